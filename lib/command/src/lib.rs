use std::path::Path;

use kalpana_client::entities::{kalpana_timestamp, log::Log};
use run_command::{CommandOutput, async_run_command};

/// Runs `command` (optionally `cd`-ing into `path` first) and wraps the
/// result into a `Log` record, stamping start/end timestamps around the
/// call. This is the one place every host-side shell invocation in the
/// control plane goes through - the deployment builder's install/build
/// steps (spec §4.4) and `git`'s clone helpers all produce a `Log` this
/// way so their output can be appended to a `Build`'s log buffer
/// uniformly.
pub async fn run_kalpana_command(
  stage: &str,
  path: impl Into<Option<&Path>>,
  command: impl AsRef<str>,
) -> Log {
  let command = if let Some(path) = path.into() {
    format!("cd {} && {}", path.display(), command.as_ref())
  } else {
    command.as_ref().to_string()
  };
  let start_ts = kalpana_timestamp();
  let output = async_run_command(&command).await;
  output_into_log(stage, command, start_ts, output)
}

pub fn output_into_log(
  stage: &str,
  command: String,
  start_ts: i64,
  output: CommandOutput,
) -> Log {
  let success = output.success();
  Log {
    stage: stage.to_string(),
    stdout: output.stdout,
    stderr: output.stderr,
    command,
    success,
    start_ts,
    end_ts: kalpana_timestamp(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn runs_simple_command_and_records_success() {
    let log = run_kalpana_command("Echo", None, "echo hello").await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "hello");
    assert_eq!(log.stage, "Echo");
  }

  #[tokio::test]
  async fn runs_in_working_directory() {
    let log = run_kalpana_command("Pwd", Path::new("/tmp"), "pwd").await;
    assert!(log.success);
    assert_eq!(log.stdout.trim(), "/tmp");
  }

  #[tokio::test]
  async fn captures_failure() {
    let log = run_kalpana_command("Fail", None, "exit 1").await;
    assert!(!log.success);
  }
}
