use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::{I64, MongoId, resource::ResourceMeta};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentStatus {
  Pending,
  Cloning,
  Running,
  Completed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
  User,
  Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
  pub role: ChatRole,
  pub content: String,
  /// In-memory-only marker: set while an assistant message is still
  /// receiving `text-delta` events, stripped before the snapshot is
  /// persisted (spec §4.7 "Snapshot reducer").
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub streaming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
  Executing,
  Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
  pub id: String,
  pub name: String,
  pub args: serde_json::Value,
  pub state: ToolCallState,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEditOperation {
  Created,
  Modified,
  Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
  pub path: String,
  pub operation: FileEditOperation,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
  #[serde(flatten)]
  pub meta: ResourceMeta,

  pub status: AgentStatus,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent_port: Option<u16>,

  #[serde(default)]
  pub conversation_history: Vec<ChatMessage>,
  #[serde(default)]
  pub tool_calls: Vec<ToolCall>,
  #[serde(default)]
  pub files_edited: Vec<FileEdit>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_message_at: Option<I64>,
}

impl Agent {
  pub fn container_name(&self) -> String {
    format!("agent-{}", self.meta.id)
  }
}

/// The in-transit event contract from spec §3/§4.6. Every event carries
/// `agent_id` and a millisecond timestamp; the payload is a tagged variant
/// (`#[serde(tag = "type")]`) so downstream consumers (the gateway's
/// reducer, the SSE/WS bridge) get a fully-specified, non-`any`-typed
/// shape, per Design Notes' "`any`-typed event payloads" redesign item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
  pub agent_id: MongoId,
  pub timestamp: I64,
  #[serde(flatten)]
  pub kind: AgentEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AgentEventKind {
  TextDelta { text_delta: String },
  ToolCall { tool_call_id: String, tool_name: String, args: serde_json::Value },
  ToolResult { tool_call_id: String, tool_name: String, result: serde_json::Value },
  FileEdit { file_edit: FileEdit },
  Status { status: AgentStatus },
  Finish {},
  Error { message: String },
}

impl AgentEvent {
  pub fn new(agent_id: impl Into<MongoId>, kind: AgentEventKind) -> Self {
    AgentEvent { agent_id: agent_id.into(), timestamp: super::kalpana_timestamp(), kind }
  }
}

/// Redis keys for one agent's event pipeline (spec §6 "Redis keys").
pub fn stream_key(agent_id: &str) -> String {
  format!("agent:{agent_id}:stream")
}

pub fn channel_key(agent_id: &str) -> String {
  format!("agent:{agent_id}:events")
}

/// `MAXLEN ~1000` approximate trim applied on every `xAdd` (spec §4.6).
pub const STREAM_MAXLEN: usize = 1000;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_serializes_with_type_tag() {
    let event = AgentEvent::new(
      "a1",
      AgentEventKind::TextDelta { text_delta: "Hello".into() },
    );
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "text-delta");
    assert_eq!(json["text_delta"], "Hello");
  }

  #[test]
  fn keys_are_namespaced_per_agent() {
    assert_eq!(stream_key("a1"), "agent:a1:stream");
    assert_eq!(channel_key("a1"), "agent:a1:events");
  }
}
