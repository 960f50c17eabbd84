//! C3's workspace lifecycle (spec.md §4.3): creation, start/stop/restart/
//! destroy, exec, log streaming, and the background readiness watcher
//! that promotes STARTING -> RUNNING once both bridge and editor
//! sentinels have been observed in the container's log stream.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use database::StateStore;
use futures_util::StreamExt;
use kalpana_client::entities::ResourceStatus;
use kalpana_client::entities::workspace::{
  BRIDGE_READY_SENTINELS, EDITOR_READY_SENTINEL, Workspace, container_env,
};

use super::{PortShape, Services, create_and_start_with_port_retry};
use crate::docker::containers::{ContainerSpec, PortSpec, VolumeMount};
use crate::docker::volumes::{NIX_CACHE_VOLUME, VSCODE_EXTENSIONS_VOLUME};
use crate::error::ContainerError;

pub const WORKSPACE_IMAGE_TAG: &str = "kalpana-workspace:latest";
/// Readiness watcher self-terminates after this deadline even if both
/// sentinels never appear (spec.md §4.3, Open Question #1 - no escalation
/// to ERROR on timeout).
const READINESS_TIMEOUT: Duration = Duration::from_secs(120);

pub struct WorkspaceManager {
  pub services: Arc<Services>,
  /// Directory containing the bundled workspace Dockerfile, sent to the
  /// daemon as the build context (spec.md §4.3 "Image readiness").
  pub dockerfile_dir: std::path::PathBuf,
}

impl WorkspaceManager {
  pub fn new(services: Arc<Services>, dockerfile_dir: std::path::PathBuf) -> Self {
    Self { services, dockerfile_dir }
  }

  /// Steps 1-9 of spec.md §4.3's "Workspace creation algorithm".
  pub async fn create(&self, mut workspace: Workspace) -> anyhow::Result<Workspace> {
    let docker = &self.services.docker;

    docker.ensure_workspace_image(&self.dockerfile_dir, WORKSPACE_IMAGE_TAG).await?;

    let persistent_volume = workspace.persistent_volume_name();
    let mut volume_labels = HashMap::new();
    volume_labels.insert("kalpana.workspace.id".to_string(), workspace.meta.id.clone());
    docker.ensure_volume(&persistent_volume, volume_labels).await?;
    docker.ensure_volume(NIX_CACHE_VOLUME, HashMap::new()).await?;
    docker.ensure_volume(VSCODE_EXTENSIONS_VOLUME, HashMap::new()).await?;

    let decrypted_secrets = if workspace.encrypted_env.is_empty() {
      Default::default()
    } else {
      self.services.secrets.decrypt_env(&workspace.encrypted_env)?
    };
    let env = container_env(&workspace, &decrypted_secrets, "Kalpana", "agent@kalpana.dev");

    let container_name = workspace.container_name();
    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("kalpana.workspace.id".to_string(), workspace.meta.id.clone());

    let config = self.services.config.clone();
    let result = create_and_start_with_port_retry(
      docker,
      &self.services.ports,
      PortShape::Pair,
      |ports| {
        let env_vec: Vec<String> =
          env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        ContainerSpec {
          name: container_name.clone(),
          image: WORKSPACE_IMAGE_TAG.to_string(),
          env: env_vec,
          ports: vec![
            PortSpec { container_port: 8080, host_port: Some(ports[0]) },
            PortSpec { container_port: 3001, host_port: Some(ports[1]) },
          ],
          volumes: vec![
            VolumeMount::rw(persistent_volume.clone(), "/workspace"),
            VolumeMount::rw(NIX_CACHE_VOLUME, "/nix"),
            VolumeMount::rw(VSCODE_EXTENSIONS_VOLUME, "/root/.vscode-server/extensions"),
          ],
          labels: labels.clone(),
          memory_bytes: (config.default_container_memory > 0)
            .then_some(config.default_container_memory),
          nano_cpus: (config.default_container_cpu > 0.0)
            .then_some((config.default_container_cpu * 1_000_000_000.0) as i64),
          restart_unless_stopped: true,
          ..Default::default()
        }
      },
    )
    .await;

    let (container_id, ports) = match result {
      Ok(ok) => ok,
      Err(ContainerError::PortBindExhausted { attempts, message }) => {
        workspace.meta.status = ResourceStatus::Error;
        workspace.vscode_port = None;
        workspace.agent_port = None;
        workspace.meta.touch();
        self.services.db.workspaces.update(
          &workspace.meta.id,
          bson::doc! {
            "status": bson::to_bson(&ResourceStatus::Error)?,
            "vscode_port": bson::Bson::Null,
            "agent_port": bson::Bson::Null,
            "updated_at": workspace.meta.updated_at,
          },
        )
        .await?;
        anyhow::bail!(
          "workspace {} failed to start after {attempts} port-bind attempts: {message}",
          workspace.meta.id
        );
      }
      Err(e) => return Err(e.into()),
    };

    workspace.meta.container_id = Some(container_id);
    workspace.meta.volume_id = Some(persistent_volume);
    workspace.meta.status = ResourceStatus::Starting;
    workspace.vscode_port = Some(ports[0]);
    workspace.agent_port = Some(ports[1]);
    workspace.meta.touch();

    self.services.db.workspaces.update(
      &workspace.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Starting)?,
        "container_id": &workspace.meta.container_id,
        "volume_id": &workspace.meta.volume_id,
        "vscode_port": ports[0] as i32,
        "agent_port": ports[1] as i32,
        "updated_at": workspace.meta.updated_at,
      },
    )
    .await?;

    self.spawn_readiness_watcher(workspace.meta.id.clone(), workspace.container_name());

    Ok(workspace)
  }

  /// Streams container logs (tail 200, follow), scanning for the bridge
  /// and editor ready sentinels; once both are seen, inspects the
  /// container and promotes STARTING -> RUNNING if still running. Never
  /// propagates errors to the caller (spec.md §4.3 "Readiness watcher").
  fn spawn_readiness_watcher(&self, workspace_id: String, container_name: String) {
    let docker = self.services.docker.clone();
    let db = self.services.db.clone();
    tokio::spawn(async move {
      let watch = async {
        let mut bridge_ready = false;
        let mut editor_ready = false;
        let mut stream = docker.stream_logs(&container_name, "200");
        while let Some(chunk) = stream.next().await {
          let Ok(raw) = chunk else { continue };
          for line in raw.lines() {
            let clean = crate::docker::logs::strip_control_chars(line);
            if !bridge_ready && BRIDGE_READY_SENTINELS.iter().any(|s| clean.contains(s)) {
              bridge_ready = true;
            }
            if !editor_ready && clean.contains(EDITOR_READY_SENTINEL) {
              editor_ready = true;
            }
          }
          if bridge_ready && editor_ready {
            break;
          }
        }

        if !(bridge_ready && editor_ready) {
          return;
        }
        let Ok(true) = docker.is_running(&container_name).await else { return };

        let _ = db.workspaces.update(
          &workspace_id,
          bson::doc! {
            "status": bson::to_bson(&ResourceStatus::Running).unwrap_or_default(),
            "updated_at": kalpana_client::entities::kalpana_timestamp(),
          },
        )
        .await;
      };

      tokio::select! {
        _ = watch => {}
        _ = tokio::time::sleep(READINESS_TIMEOUT) => {
          tracing::debug!(
            "readiness watcher for workspace {workspace_id} timed out after {:?} without both sentinels",
            READINESS_TIMEOUT
          );
        }
      }
    });
  }

  /// Set STOPPING, `docker stop`, null out ports, release ports, set
  /// STOPPED. On failure, set ERROR and surface (spec.md §4.3 "Stop").
  pub async fn stop(&self, workspace: &Workspace) -> anyhow::Result<()> {
    self.services.db.workspaces.update(
      &workspace.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Stopping)? },
    )
    .await?;

    let stop_result = self.services.docker.stop_container(&workspace.container_name()).await;
    if let Err(e) = stop_result {
      self.services.db.workspaces.update(
        &workspace.meta.id,
        bson::doc! { "status": bson::to_bson(&ResourceStatus::Error)? },
      )
      .await?;
      return Err(e);
    }

    if let Some(port) = workspace.vscode_port {
      self.services.ports.release_port(port);
    }
    if let Some(port) = workspace.agent_port {
      self.services.ports.release_port(port);
    }

    self.services.db.workspaces.update(
      &workspace.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Stopped)?,
        "vscode_port": bson::Bson::Null,
        "agent_port": bson::Bson::Null,
        "updated_at": kalpana_client::entities::kalpana_timestamp(),
      },
    )
    .await?;
    Ok(())
  }

  /// `docker restart` preserving labels/binds; STARTING -> RUNNING is
  /// driven by the readiness watcher, same as on create.
  pub async fn restart(&self, workspace: &Workspace) -> anyhow::Result<()> {
    self.services.docker.restart_container(&workspace.container_name()).await?;
    self.services.db.workspaces.update(
      &workspace.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Starting)? },
    )
    .await?;
    self.spawn_readiness_watcher(workspace.meta.id.clone(), workspace.container_name());
    Ok(())
  }

  /// Force-stop, force-remove; optionally remove the persistent volume
  /// (caller opt-in, irreversible). Always releases ports.
  pub async fn destroy(&self, workspace: &Workspace, remove_volume: bool) -> anyhow::Result<()> {
    let name = workspace.container_name();
    self.services.docker.stop_container(&name).await.ok();
    self.services.docker.force_remove_container(&name).await?;

    if remove_volume {
      if let Some(volume) = &workspace.meta.volume_id {
        self.services.docker.remove_volume(volume).await?;
      }
    }

    if let Some(port) = workspace.vscode_port {
      self.services.ports.release_port(port);
    }
    if let Some(port) = workspace.agent_port {
      self.services.ports.release_port(port);
    }

    self.services.db.workspaces.update(
      &workspace.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Deleted)?,
        "container_id": bson::Bson::Null,
        "updated_at": kalpana_client::entities::kalpana_timestamp(),
      },
    )
    .await?;
    Ok(())
  }

  pub async fn exec(
    &self,
    workspace: &Workspace,
    cmd: Vec<String>,
    working_dir: Option<&str>,
  ) -> anyhow::Result<crate::docker::exec::ExecResult> {
    self.services.docker.exec(&workspace.container_name(), cmd, working_dir).await
  }

  pub async fn logs(&self, workspace: &Workspace, tail: &str) -> anyhow::Result<String> {
    self.services.docker.logs(&workspace.container_name(), tail).await
  }

  pub async fn is_healthy(&self, workspace: &Workspace) -> anyhow::Result<bool> {
    self.services.docker.is_healthy(&workspace.container_name()).await
  }

  pub async fn stats(
    &self,
    workspace: &Workspace,
  ) -> anyhow::Result<crate::docker::stats::ContainerStats> {
    self.services.docker.container_stats(&workspace.container_name()).await
  }
}

/// `Dockerfile` build-context directory bundled with the control plane,
/// resolved against `KALPANA_CONTAINER_DIR` (spec.md §6).
pub fn default_dockerfile_dir(container_dir: &str) -> std::path::PathBuf {
  Path::new(container_dir).join("workspace-image")
}
