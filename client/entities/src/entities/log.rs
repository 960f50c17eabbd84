use serde::{Deserialize, Serialize};

use super::{I64, kalpana_timestamp};

/// One stage of command output, as produced by `command::run_kalpana_command`
/// and accumulated into a `Build`'s log buffer (spec §4.4 step 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
  pub stage: String,
  pub command: String,
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
  pub start_ts: I64,
  pub end_ts: I64,
}

impl Log {
  /// A log entry with no associated shell command, eg "Write Dockerfile"
  /// style bookkeeping steps.
  pub fn simple(stage: impl Into<String>, stdout: impl Into<String>) -> Log {
    let ts = kalpana_timestamp();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: stdout.into(),
      stderr: String::new(),
      success: true,
      start_ts: ts,
      end_ts: ts,
    }
  }

  pub fn error(stage: impl Into<String>, stderr: impl Into<String>) -> Log {
    let ts = kalpana_timestamp();
    Log {
      stage: stage.into(),
      command: String::new(),
      stdout: String::new(),
      stderr: stderr.into(),
      success: false,
      start_ts: ts,
      end_ts: ts,
    }
  }

  /// Renders the log as it would be appended to a `Build`'s plaintext log
  /// buffer (spec §4.4 step 3: "accumulate logs into an append-only
  /// buffer").
  pub fn to_buffer_entry(&self) -> String {
    let mut out = format!("--- {} ---\n", self.stage);
    if !self.command.is_empty() {
      out.push_str(&format!("$ {}\n", self.command));
    }
    if !self.stdout.is_empty() {
      out.push_str(&self.stdout);
      if !self.stdout.ends_with('\n') {
        out.push('\n');
      }
    }
    if !self.stderr.is_empty() {
      out.push_str(&self.stderr);
      if !self.stderr.ends_with('\n') {
        out.push('\n');
      }
    }
    out
  }
}

pub fn all_logs_success(logs: &[Log]) -> bool {
  logs.iter().all(|log| log.success)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn all_logs_success_short_circuits_on_failure() {
    let logs = vec![Log::simple("a", "ok"), Log::error("b", "boom")];
    assert!(!all_logs_success(&logs));
    assert!(all_logs_success(&logs[..1]));
  }

  #[test]
  fn buffer_entry_includes_command_and_streams() {
    let log = Log {
      stage: "Install".into(),
      command: "npm i".into(),
      stdout: "added 1 package".into(),
      stderr: String::new(),
      success: true,
      start_ts: 0,
      end_ts: 1,
    };
    let entry = log.to_buffer_entry();
    assert!(entry.contains("--- Install ---"));
    assert!(entry.contains("$ npm i"));
    assert!(entry.contains("added 1 package"));
  }
}
