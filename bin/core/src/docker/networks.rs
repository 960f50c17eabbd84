//! The shared proxy network: create-or-reuse plus idempotent attach/detach.
//! A user-defined bridge network joined by the edge router and every
//! routed container.

use anyhow::Context;
use bollard::models::{NetworkConnectRequest, NetworkCreateRequest, NetworkDisconnectRequest};
use bollard::query_parameters::InspectNetworkOptions;

use super::DockerClient;

impl DockerClient {
  pub async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
    if self
      .docker
      .inspect_network(name, Some(InspectNetworkOptions::default()))
      .await
      .is_ok()
    {
      return Ok(());
    }
    self
      .docker
      .create_network(NetworkCreateRequest {
        name: name.to_string(),
        driver: Some("bridge".to_string()),
        ..Default::default()
      })
      .await
      .with_context(|| format!("failed to create network {name}"))?;
    Ok(())
  }

  /// Idempotent: "already attached" errors are swallowed.
  pub async fn attach(&self, network: &str, container_id: &str) -> anyhow::Result<()> {
    let res = self
      .docker
      .connect_network(
        network,
        NetworkConnectRequest { container: Some(container_id.to_string()), ..Default::default() },
      )
      .await;
    match res {
      Ok(()) => Ok(()),
      Err(e) if e.to_string().contains("already exists")
        || e.to_string().contains("already connected") =>
      {
        Ok(())
      }
      Err(e) => Err(e).with_context(|| {
        format!("failed to attach container {container_id} to network {network}")
      }),
    }
  }

  /// No-op if the container isn't attached.
  pub async fn detach(&self, network: &str, container_id: &str) -> anyhow::Result<()> {
    let res = self
      .docker
      .disconnect_network(
        network,
        NetworkDisconnectRequest {
          container: Some(container_id.to_string()),
          force: Some(true),
        },
      )
      .await;
    match res {
      Ok(()) => Ok(()),
      Err(e) if e.to_string().contains("is not connected") => Ok(()),
      Err(e) => Err(e).with_context(|| {
        format!("failed to detach container {container_id} from network {network}")
      }),
    }
  }
}
