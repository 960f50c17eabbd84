//! Client side of the in-container bridge protocol (spec.md §6): the
//! bridge itself runs as a separate process in the same container and is
//! out of scope beyond the commands exchanged with it. This module issues
//! the `{id, type, payload}` / `{id, success, data?, error?}` request-reply
//! exchange described there over the bridge's HTTP endpoint on :3001, and
//! is what both the tool executor (file/search/git tool bodies) and the
//! `/vscode-command` and `/command` forwarding routes go through.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
  id: &'a str,
  #[serde(rename = "type")]
  kind: &'a str,
  payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct BridgeReply {
  #[serde(default)]
  pub success: bool,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
  #[error("bridge request failed: {0}")]
  Transport(#[from] reqwest::Error),
  #[error("bridge returned an error: {0}")]
  Rejected(String),
}

#[derive(Clone)]
pub struct BridgeClient {
  http: reqwest::Client,
  base_url: String,
}

impl BridgeClient {
  pub fn new(base_url: impl Into<String>) -> Self {
    BridgeClient { http: reqwest::Client::new(), base_url: base_url.into() }
  }

  /// Sends one `{id, type, payload}` request and returns its `data` on
  /// success, or the bridge's own `error` string on rejection (e.g. a
  /// `runCommand` whose first token isn't on the whitelist).
  pub async fn call(&self, kind: &str, payload: Value) -> Result<Value, BridgeError> {
    let id = uuid_like_id();
    let request = BridgeRequest { id: &id, kind, payload };
    let reply: BridgeReply =
      self.http.post(&self.base_url).json(&request).send().await?.json().await?;

    if reply.success {
      Ok(reply.data.unwrap_or(Value::Null))
    } else {
      Err(BridgeError::Rejected(reply.error.unwrap_or_else(|| "unknown bridge error".to_string())))
    }
  }

  /// Raw passthrough for `/vscode-command` and `/command`: forward the
  /// caller's body unchanged and return the bridge's reply unchanged
  /// (spec.md §6 "forward the body to the bridge and return its reply").
  pub async fn forward(&self, body: Value) -> Result<Value, BridgeError> {
    let reply: Value = self.http.post(&self.base_url).json(&body).send().await?.json().await?;
    Ok(reply)
  }
}

fn uuid_like_id() -> String {
  use std::time::{SystemTime, UNIX_EPOCH};
  let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
  format!("req-{nanos:x}")
}
