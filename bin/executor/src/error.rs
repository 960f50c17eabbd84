use thiserror::Error;

/// Boundary error type for the agent-runner HTTP surface (spec.md §6). The
/// publisher's own model-stream errors are translated earlier, at the
/// publisher boundary (spec.md §4.6); this enum only covers request-level
/// failures of the HTTP handlers themselves.
#[derive(Debug, Error)]
pub enum ExecutorError {
  #[error("agent is already running a task")]
  AlreadyRunning,
  #[error(transparent)]
  Bridge(#[from] crate::bridge::BridgeError),
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

impl axum::response::IntoResponse for ExecutorError {
  fn into_response(self) -> axum::response::Response {
    use axum::http::StatusCode;
    let status = match &self {
      ExecutorError::AlreadyRunning => StatusCode::CONFLICT,
      ExecutorError::Bridge(_) => StatusCode::BAD_GATEWAY,
      ExecutorError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, serde_json::json!({ "success": false, "error": self.to_string() }).to_string())
      .into_response()
  }
}
