//! C3/C4/C5: the class-specific resource managers (workspace, deployment,
//! database, bucket) plus the machinery they all share - the injected
//! `Services` bundle (Design Notes' "process-wide singletons" redesign:
//! one constructed instance per process, handed around as `Arc`s rather
//! than reached for via a global), the port-bind retry loop (spec.md
//! §4.3 step 7), and auto-generated-subdomain collision retry (spec.md
//! §4.5).

pub mod bucket;
pub mod database;
pub mod deployment;
pub mod workspace;

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::config::CoreConfig;
use crate::docker::{ContainerSpec, DockerClient};
use crate::error::{ContainerError, PortError};
use crate::ports::{PortAllocator, RecordPortsCheck};
use crate::proxy::ProxyOrchestrator;

/// Everything a resource manager needs, constructed once in `main` and
/// shared via `Arc<Services>` - replaces the teacher's per-subsystem
/// process-wide singletons (`traefikManager`, `deploymentManager`, ...).
pub struct Services {
  pub docker: Arc<DockerClient>,
  pub ports: Arc<PortAllocator>,
  pub proxy: Arc<ProxyOrchestrator>,
  pub db: Arc<database::Client>,
  pub secrets: Arc<secrets::SecretCipher>,
  pub config: Arc<CoreConfig>,
  /// C6/C7's Redis connection factory (stream + pub/sub transport for
  /// agent events, spec.md §4.6/§4.7). `redis::Client` is cheap to clone
  /// and hands out a fresh connection per `get_*` call, so it is shared
  /// as-is rather than wrapped in a pool.
  pub redis: Arc<redis::Client>,
}

/// Bridges C8's state store to C1's "no live record references this
/// port" check (spec.md §4.1 check 1), scanning the port-bearing fields
/// across every resource kind that allocates from C1 (workspaces,
/// buckets, databases, and standalone deployments' exposed port).
pub struct DbRecordPorts {
  pub db: Arc<database::Client>,
}

impl RecordPortsCheck for DbRecordPorts {
  fn ports_in_use_by_records<'a>(
    &'a self,
  ) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = anyhow::Result<HashSet<u16>>> + Send + 'a>,
  > {
    Box::pin(async move {
      use database::StateStore;
      let mut ports = HashSet::new();

      for workspace in self.db.workspaces.list_by(bson::doc! {}).await? {
        if let Some(p) = workspace.vscode_port {
          ports.insert(p);
        }
        if let Some(p) = workspace.agent_port {
          ports.insert(p);
        }
      }
      for bucket in self.db.buckets.list_by(bson::doc! {}).await? {
        if let Some(p) = bucket.api_port {
          ports.insert(p);
        }
        if let Some(p) = bucket.console_port {
          ports.insert(p);
        }
      }
      for database_resource in self.db.databases.list_by(bson::doc! {}).await? {
        if let Some(p) = database_resource.external_port {
          ports.insert(p);
        }
      }
      for deployment in self.db.deployments.list_by(bson::doc! {}).await? {
        if let Some(p) = deployment.exposed_port {
          ports.insert(p);
        }
      }

      Ok(ports)
    })
  }
}

/// How many consecutive ports a resource kind needs from C1.
#[derive(Debug, Clone, Copy)]
pub enum PortShape {
  Single,
  Pair,
}

async fn allocate_ports(
  ports: &PortAllocator,
  shape: PortShape,
) -> Result<Vec<u16>, PortError> {
  match shape {
    PortShape::Single => Ok(vec![ports.allocate_port().await?]),
    PortShape::Pair => {
      let (a, b) = ports.allocate_port_pair().await?;
      Ok(vec![a, b])
    }
  }
}

/// Docker's own wording for a failed host-port bind (spec.md §4.3 step
/// 7's exact phrases).
pub fn is_port_bind_error(message: &str) -> bool {
  message.contains("port is already allocated")
    || message.contains("address already in use")
    || message.contains("Bind for")
}

pub const MAX_PORT_BIND_ATTEMPTS: u32 = 3;

/// Removes any stale container under the deterministic name, creates a
/// fresh one from `make_spec(&allocated_ports)`, and starts it. On a
/// Docker port-bind error, releases the ports, allocates a fresh set, and
/// retries up to `MAX_PORT_BIND_ATTEMPTS` (spec.md §4.3 step 7).
pub async fn create_and_start_with_port_retry(
  docker: &DockerClient,
  ports: &PortAllocator,
  shape: PortShape,
  mut make_spec: impl FnMut(&[u16]) -> ContainerSpec,
) -> Result<(String, Vec<u16>), ContainerError> {
  let mut allocated = allocate_ports(ports, shape).await?;
  let mut attempt = 0u32;
  loop {
    attempt += 1;
    let spec = make_spec(&allocated);
    docker.remove_stale_container(&spec.name).await?;
    let container_id = docker.create_container(&spec).await?;
    match docker.start_container(&spec.name).await {
      Ok(()) => return Ok((container_id, allocated)),
      Err(e) if attempt < MAX_PORT_BIND_ATTEMPTS && is_port_bind_error(&e.to_string()) => {
        for port in &allocated {
          ports.release_port(*port);
        }
        docker.force_remove_container(&spec.name).await.ok();
        allocated = allocate_ports(ports, shape).await?;
      }
      Err(e) => {
        return Err(ContainerError::PortBindExhausted {
          attempts: attempt,
          message: e.to_string(),
        });
      }
    }
  }
}

/// `{prefix}-{sanitized-name}`, with a random 4-character suffix appended
/// on collision, retried up to 10 times, truncated to 63 characters
/// (spec.md §4.5 "Subdomain validation").
pub async fn generate_unique_subdomain<F, Fut>(
  prefix: &str,
  resource_name: &str,
  mut is_taken: F,
) -> anyhow::Result<String>
where
  F: FnMut(String) -> Fut,
  Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
  let sanitized = sanitize_for_subdomain(resource_name);
  let base = truncate_subdomain(&format!("{prefix}-{sanitized}"));

  if !is_taken(base.clone()).await? {
    return Ok(base);
  }

  let mut rng = rand::rng();
  for _ in 0..10 {
    let suffix: String = (0..4)
      .map(|_| {
        let choices = b"abcdefghijklmnopqrstuvwxyz0123456789";
        choices[rng.random_range(0..choices.len())] as char
      })
      .collect();
    let candidate = truncate_subdomain(&format!("{base}-{suffix}"));
    if !is_taken(candidate.clone()).await? {
      return Ok(candidate);
    }
  }

  anyhow::bail!("could not find a free subdomain for '{resource_name}' after 10 attempts")
}

fn sanitize_for_subdomain(name: &str) -> String {
  let lowered = name.to_ascii_lowercase();
  let mut out = String::with_capacity(lowered.len());
  for c in lowered.chars() {
    if c.is_ascii_alphanumeric() {
      out.push(c);
    } else if !out.ends_with('-') {
      out.push('-');
    }
  }
  out.trim_matches('-').to_string()
}

fn truncate_subdomain(s: &str) -> String {
  let truncated: String = s.chars().take(63).collect();
  truncated.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bind_error_detection() {
    assert!(is_port_bind_error("Bind for 0.0.0.0:40010 failed: port is already allocated"));
    assert!(is_port_bind_error("listen tcp 0.0.0.0:443: bind: address already in use"));
    assert!(!is_port_bind_error("no such image"));
  }

  #[test]
  fn sanitizes_and_truncates() {
    assert_eq!(sanitize_for_subdomain("My Cool App!!"), "my-cool-app");
    let long = "a".repeat(100);
    assert_eq!(truncate_subdomain(&long).len(), 63);
  }
}
