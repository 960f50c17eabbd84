//! The agent-runner HTTP surface (spec.md §6 "Agent-runner HTTP"): started
//! once per agent container, this is what the host control plane's
//! `Agent` resource calls into to kick off and continue a run.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use kalpana_client::entities::agent::ChatMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::BridgeClient;
use crate::error::ExecutorError;
use crate::publisher::Publisher;

pub struct AppState {
  pub publisher: Arc<Publisher>,
  pub bridge: BridgeClient,
  pub default_model: String,
  pub workspace_id: String,
  /// Fallback for requests that omit `apiKey` (`OPENROUTER_API_KEY` from
  /// the container environment contract, spec.md §6).
  pub default_api_key: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
  Router::new()
    .route("/health", get(health))
    .route("/agent/execute", post(execute))
    .route("/agent/chat", post(chat))
    .route("/agent/status", get(status))
    .route("/vscode-command", post(vscode_command))
    .route("/command", post(command))
    .with_state(state)
}

#[derive(Deserialize)]
struct ExecuteRequest {
  task: String,
  #[serde(default, rename = "apiKey")]
  api_key: Option<String>,
  #[serde(default)]
  model: Option<String>,
  #[serde(default, rename = "conversationHistory")]
  _conversation_history: Option<Vec<ChatMessage>>,
}

#[derive(Deserialize)]
struct ChatRequest {
  message: String,
  #[serde(default, rename = "apiKey")]
  api_key: Option<String>,
  #[serde(default)]
  model: Option<String>,
}

#[derive(Serialize)]
struct RunState {
  #[serde(rename = "toolCallsCount")]
  tool_calls_count: usize,
  #[serde(rename = "filesEditedCount")]
  files_edited_count: usize,
}

#[derive(Serialize)]
struct RunResponse {
  success: bool,
  state: RunState,
}

/// Falls back to `OPENROUTER_API_KEY` from the container environment
/// (spec.md §6 "Container environment contract") when the request omits
/// `apiKey`.
fn resolve_api_key(state: &AppState, requested: Option<String>) -> Result<String, ExecutorError> {
  requested
    .or_else(|| state.default_api_key.clone())
    .ok_or_else(|| ExecutorError::Other(anyhow::anyhow!("no API key supplied and none configured")))
}

/// `POST /agent/execute`: starts a run and responds once the model
/// stream has fully drained (spec.md §6). Concurrent calls while a run is
/// already in flight are rejected rather than interleaved, since the
/// publisher's local state is not reentrant.
async fn execute(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ExecuteRequest>,
) -> Result<Json<RunResponse>, ExecutorError> {
  if state.publisher.is_in_flight().await {
    return Err(ExecutorError::AlreadyRunning);
  }
  let model = body.model.unwrap_or_else(|| state.default_model.clone());
  let api_key = resolve_api_key(&state, body.api_key)?;
  state.publisher.execute(&body.task, &model, &api_key).await;
  let (tool_calls_count, files_edited_count) = state.publisher.status_snapshot().await;
  Ok(Json(RunResponse { success: true, state: RunState { tool_calls_count, files_edited_count } }))
}

/// `POST /agent/chat`: continues the same conversation with a new user
/// message; same lifecycle-event semantics as `execute`.
async fn chat(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ChatRequest>,
) -> Result<Json<RunResponse>, ExecutorError> {
  if state.publisher.is_in_flight().await {
    return Err(ExecutorError::AlreadyRunning);
  }
  let model = body.model.unwrap_or_else(|| state.default_model.clone());
  let api_key = resolve_api_key(&state, body.api_key)?;
  state.publisher.execute(&body.message, &model, &api_key).await;
  let (tool_calls_count, files_edited_count) = state.publisher.status_snapshot().await;
  Ok(Json(RunResponse { success: true, state: RunState { tool_calls_count, files_edited_count } }))
}

#[derive(Serialize)]
struct StatusResponse {
  initialized: bool,
  #[serde(rename = "inFlight")]
  in_flight: bool,
  state: RunState,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
  let (tool_calls_count, files_edited_count) = state.publisher.status_snapshot().await;
  Json(StatusResponse {
    initialized: true,
    in_flight: state.publisher.is_in_flight().await,
    state: RunState { tool_calls_count, files_edited_count },
  })
}

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  workspace: String,
}

async fn health(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
  Json(HealthResponse { status: "ok", workspace: "/workspace".to_string() })
}

/// `POST /vscode-command` and `POST /command`: forward the body to the
/// bridge unchanged and return its reply unchanged (spec.md §6).
async fn vscode_command(
  State(state): State<Arc<AppState>>,
  Json(body): Json<Value>,
) -> Result<Json<Value>, ExecutorError> {
  Ok(Json(state.bridge.forward(body).await?))
}

async fn command(
  State(state): State<Arc<AppState>>,
  Json(body): Json<Value>,
) -> Result<Json<Value>, ExecutorError> {
  Ok(Json(state.bridge.forward(body).await?))
}
