//! Tool execution for the agent run. The tool bodies themselves (file I/O,
//! grep, git wrappers) live behind the bridge and are out of scope (spec.md
//! §1); this module is the thin dispatcher that maps a model tool-call
//! name onto a bridge request type and, for file-mutating tools, notifies
//! an explicit [`FileEditSink`] rather than a module-level callback
//! (Design Notes: "Callback registered as module-level state" redesign
//! item - the sink is constructed once and passed in, never a global).

use async_trait::async_trait;
use kalpana_client::entities::agent::{FileEdit, FileEditOperation};
use serde_json::Value;

use crate::bridge::{BridgeClient, BridgeError};

/// Registered at executor startup and handed to the tool set at
/// construction (not stashed in a static), per the redesign item above.
#[async_trait]
pub trait FileEditSink: Send + Sync {
  async fn record(&self, edit: FileEdit);
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
  #[error("unknown tool: {0}")]
  Unknown(String),
  #[error(transparent)]
  Bridge(#[from] BridgeError),
}

/// Maps a tool-call name from the model onto the bridge's closed type set
/// (spec.md §6 "Types:"). Only the subset relevant to an agent run's
/// ordinary editing loop is wired here; the full whitelist is the
/// bridge's concern, not this dispatcher's.
fn bridge_type_for_tool(name: &str) -> Option<&'static str> {
  Some(match name {
    "read_file" => "readFile",
    "write_file" => "writeFile",
    "list_files" => "listFiles",
    "run_command" => "runCommand",
    "search_code" => "searchCode",
    "grep_in_file" => "grepInFile",
    "grep_in_directory" => "grepInDirectory",
    "git_commit" => "gitCommit",
    "git_push" => "gitPush",
    _ => return None,
  })
}

/// The tool names this executor knows how to dispatch, in the shape
/// `async-openai`'s `ChatCompletionToolArgs` expects (name only - each
/// tool's argument schema is the bridge's to document, so a permissive
/// open-object schema is advertised for all of them).
pub const KNOWN_TOOL_NAMES: &[&str] = &[
  "read_file",
  "write_file",
  "list_files",
  "run_command",
  "search_code",
  "grep_in_file",
  "grep_in_directory",
  "git_commit",
  "git_push",
];

pub struct ToolExecutor {
  bridge: BridgeClient,
  file_edits: std::sync::Arc<dyn FileEditSink>,
}

impl ToolExecutor {
  pub fn new(bridge: BridgeClient, file_edits: std::sync::Arc<dyn FileEditSink>) -> Self {
    ToolExecutor { bridge, file_edits }
  }

  /// Executes one tool call, returning the raw result payload the
  /// publisher wraps into a `tool-result` event. `write_file` calls that
  /// succeed also publish a `file-edit` through `file_edits`, independent
  /// of the tool-call/tool-result pair (spec.md §4.6 "File-edits are
  /// published independently").
  pub async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
    let kind = bridge_type_for_tool(name).ok_or_else(|| ToolError::Unknown(name.to_string()))?;
    let result = self.bridge.call(kind, args.clone()).await?;

    if name == "write_file" {
      if let Some(path) = args.get("path").and_then(Value::as_str) {
        let operation = if args.get("create").and_then(Value::as_bool).unwrap_or(false) {
          FileEditOperation::Created
        } else {
          FileEditOperation::Modified
        };
        self.file_edits.record(FileEdit { path: path.to_string(), operation, diff: None }).await;
      }
    }

    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn maps_known_tool_names() {
    assert_eq!(bridge_type_for_tool("read_file"), Some("readFile"));
    assert_eq!(bridge_type_for_tool("git_push"), Some("gitPush"));
    assert_eq!(bridge_type_for_tool("not_a_tool"), None);
  }
}
