//! Run a command inside a running container and collect stdout/stderr/exit
//! code, with an optional per-chunk callback for log streaming (the
//! deployment builder's install/build steps stream through this).
//!
//! `bollard::exec::StartExecResults::Attached` already yields a
//! `Stream<Item = Result<LogOutput, Error>>` with stdout/stderr
//! de-multiplexed into `LogOutput::StdOut`/`StdErr` variants - the 8-byte
//! stream-header framing Docker's raw attach socket uses is parsed for us
//! by `bollard` before we ever see a chunk.

use anyhow::Context;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures_util::StreamExt;

use super::DockerClient;

pub struct ExecResult {
  pub stdout: String,
  pub stderr: String,
  pub exit_code: i64,
}

/// Called once per chunk of combined output, in arrival order, tagged by
/// which stream it came from. Used to flush build logs incrementally in
/// coalesced writes rather than one per line.
pub type LogCallback<'a> = Box<dyn FnMut(LogChunk) + Send + 'a>;

#[derive(Debug, Clone)]
pub enum LogChunk {
  Stdout(String),
  Stderr(String),
}

impl DockerClient {
  pub async fn exec(
    &self,
    container_name: &str,
    cmd: Vec<String>,
    working_dir: Option<&str>,
  ) -> anyhow::Result<ExecResult> {
    self.exec_with_callback(container_name, cmd, working_dir, None).await
  }

  pub async fn exec_with_callback(
    &self,
    container_name: &str,
    cmd: Vec<String>,
    working_dir: Option<&str>,
    mut on_chunk: Option<LogCallback<'_>>,
  ) -> anyhow::Result<ExecResult> {
    let exec = self
      .docker
      .create_exec(
        container_name,
        CreateExecOptions {
          cmd: Some(cmd),
          working_dir: working_dir.map(str::to_string),
          attach_stdout: Some(true),
          attach_stderr: Some(true),
          ..Default::default()
        },
      )
      .await
      .with_context(|| format!("failed to create exec in {container_name}"))?;

    let start = self
      .docker
      .start_exec(&exec.id, None)
      .await
      .with_context(|| format!("failed to start exec {}", exec.id))?;

    let StartExecResults::Attached { mut output, .. } = start else {
      anyhow::bail!("exec {} started detached, expected attached output", exec.id);
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(chunk) = output.next().await {
      match chunk.with_context(|| format!("exec {} output stream error", exec.id))? {
        LogOutput::StdOut { message } => {
          let text = String::from_utf8_lossy(&message).into_owned();
          if let Some(cb) = on_chunk.as_mut() {
            cb(LogChunk::Stdout(text.clone()));
          }
          stdout.push_str(&text);
        }
        LogOutput::StdErr { message } => {
          let text = String::from_utf8_lossy(&message).into_owned();
          if let Some(cb) = on_chunk.as_mut() {
            cb(LogChunk::Stderr(text.clone()));
          }
          stderr.push_str(&text);
        }
        _ => {}
      }
    }

    let inspect = self
      .docker
      .inspect_exec(&exec.id)
      .await
      .with_context(|| format!("failed to inspect exec {}", exec.id))?;
    let exit_code = inspect.exit_code.unwrap_or(-1);

    Ok(ExecResult { stdout, stderr, exit_code })
  }
}
