//! A single non-streaming stats snapshot plus a running/health-state check.

use anyhow::Context;
use bollard::query_parameters::StatsOptions;
use futures_util::StreamExt;

use super::DockerClient;

#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
  pub cpu_percent: f64,
  pub memory_usage_bytes: u64,
  pub memory_limit_bytes: u64,
}

impl DockerClient {
  pub async fn container_stats(&self, name: &str) -> anyhow::Result<ContainerStats> {
    let mut stream =
      self.docker.stats(name, Some(StatsOptions { stream: false, one_shot: true }));
    let sample = stream
      .next()
      .await
      .with_context(|| format!("no stats sample returned for {name}"))?
      .with_context(|| format!("failed to read stats for {name}"))?;

    let cpu_delta = sample.cpu_stats.as_ref().and_then(|s| s.cpu_usage.as_ref()).and_then(|u| u.total_usage)
      .unwrap_or(0)
      .saturating_sub(
        sample.precpu_stats.as_ref().and_then(|s| s.cpu_usage.as_ref()).and_then(|u| u.total_usage)
          .unwrap_or(0),
      );
    let system_delta = sample.cpu_stats.as_ref().and_then(|s| s.system_cpu_usage).unwrap_or(0)
      .saturating_sub(sample.precpu_stats.as_ref().and_then(|s| s.system_cpu_usage).unwrap_or(0));
    let online_cpus = sample.cpu_stats.as_ref().and_then(|s| s.online_cpus).unwrap_or(1).max(1);
    let cpu_percent = if system_delta > 0 {
      (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
    } else {
      0.0
    };

    let memory_usage_bytes = sample.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
    let memory_limit_bytes = sample.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0);

    Ok(ContainerStats { cpu_percent, memory_usage_bytes, memory_limit_bytes })
  }

  /// Whether the container is both running and, if it declares a
  /// healthcheck, reporting healthy.
  pub async fn is_healthy(&self, name: &str) -> anyhow::Result<bool> {
    let info = self.inspect_container(name).await?;
    let Some(state) = info.state else { return Ok(false) };
    if !state.running.unwrap_or(false) {
      return Ok(false);
    }
    match state.health.and_then(|h| h.status) {
      Some(bollard::models::HealthStatusEnum::HEALTHY) => Ok(true),
      Some(bollard::models::HealthStatusEnum::UNHEALTHY) => Ok(false),
      // No healthcheck declared: running is enough.
      _ => Ok(true),
    }
  }
}
