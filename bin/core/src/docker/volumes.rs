//! Named-volume create-or-reuse helpers: the per-workspace persistent
//! volume, and the shared Nix cache / VSCode extensions volumes
//! (labelled, many-to-one, read-write).

use std::collections::HashMap;

use anyhow::Context;
use bollard::models::VolumeCreateOptions;
use bollard::query_parameters::InspectVolumeOptions;

use super::DockerClient;

impl DockerClient {
  /// Creates the volume if it doesn't already exist; returns its name
  /// either way.
  pub async fn ensure_volume(
    &self,
    name: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<String> {
    if self.docker.inspect_volume(name, None::<InspectVolumeOptions>).await.is_ok() {
      return Ok(name.to_string());
    }
    self
      .docker
      .create_volume(VolumeCreateOptions {
        name: Some(name.to_string()),
        labels: Some(labels),
        ..Default::default()
      })
      .await
      .with_context(|| format!("failed to create volume {name}"))?;
    Ok(name.to_string())
  }

  pub async fn remove_volume(&self, name: &str) -> anyhow::Result<()> {
    use bollard::query_parameters::RemoveVolumeOptions;
    let res = self
      .docker
      .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
      .await;
    match res {
      Ok(()) => Ok(()),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
      Err(e) => Err(e).with_context(|| format!("failed to remove volume {name}")),
    }
  }
}

/// Deterministic names for the shared cross-workspace volumes.
pub const NIX_CACHE_VOLUME: &str = "kalpana-nix-cache";
pub const VSCODE_EXTENSIONS_VOLUME: &str = "kalpana-vscode-extensions";
