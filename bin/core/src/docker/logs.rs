//! One-shot and following log reads, and the line-cleanup helper the
//! readiness watcher uses when scanning for ready-sentinels.

use anyhow::Context;
use bollard::container::LogOutput;
use bollard::query_parameters::LogsOptions;
use futures_util::{Stream, StreamExt};

use super::DockerClient;

impl DockerClient {
  /// One-shot tail, no follow.
  pub async fn logs(&self, name: &str, tail: &str) -> anyhow::Result<String> {
    let mut stream = self.docker.logs(
      name,
      Some(LogsOptions {
        stdout: true,
        stderr: true,
        tail: tail.to_string(),
        ..Default::default()
      }),
    );
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
      match chunk.with_context(|| format!("failed to read logs for {name}"))? {
        LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
          out.push_str(&String::from_utf8_lossy(&message));
        }
        _ => {}
      }
    }
    Ok(out)
  }

  /// Following stream, used by the readiness watcher and live log tailing.
  pub fn stream_logs(
    &self,
    name: &str,
    tail: &str,
  ) -> impl Stream<Item = anyhow::Result<String>> + '_ {
    let stream = self.docker.logs(
      name,
      Some(LogsOptions {
        stdout: true,
        stderr: true,
        follow: true,
        tail: tail.to_string(),
        ..Default::default()
      }),
    );
    stream.map(|chunk| {
      let chunk = chunk.context("log stream error")?;
      let bytes = match chunk {
        LogOutput::StdOut { message } | LogOutput::StdErr { message } => message,
        _ => Default::default(),
      };
      Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
  }
}

/// Strips ANSI/control characters from a log line before sentinel scanning.
pub fn strip_control_chars(line: &str) -> String {
  line
    .chars()
    .filter(|c| !c.is_control() || *c == ' ')
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_ansi_escape_sequences() {
    let line = "\x1b[32mAgent bridge started\x1b[0m";
    assert_eq!(strip_control_chars(line), "[32mAgent bridge started[0m");
  }
}
