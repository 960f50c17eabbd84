//! Container CRUD: create, start, stop, restart, destroy, and the
//! label/volume/port wiring every resource kind shares.

use std::collections::HashMap;

use anyhow::Context;
use bollard::models::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
  CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
  RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
  StopContainerOptions,
};

use super::DockerClient;

/// A host bind mount or named volume mount, keyed by container-side path.
#[derive(Debug, Clone)]
pub struct VolumeMount {
  pub source: String,
  pub target: String,
  pub read_only: bool,
}

impl VolumeMount {
  pub fn rw(source: impl Into<String>, target: impl Into<String>) -> Self {
    Self { source: source.into(), target: target.into(), read_only: false }
  }
}

/// One container-side port to expose, optionally bound to a host port.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
  pub container_port: u16,
  pub host_port: Option<u16>,
}

/// Everything needed to create a managed container, independent of
/// resource kind (specialized per kind by `resource/*`).
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
  pub name: String,
  pub image: String,
  pub command: Option<Vec<String>>,
  pub env: Vec<String>,
  pub ports: Vec<PortSpec>,
  pub volumes: Vec<VolumeMount>,
  pub labels: HashMap<String, String>,
  pub network: Option<String>,
  pub working_dir: Option<String>,
  pub memory_bytes: Option<i64>,
  pub nano_cpus: Option<i64>,
  /// `unless-stopped` when true, Docker default (no restart) otherwise.
  pub restart_unless_stopped: bool,
}

impl DockerClient {
  /// Removes any container with this name, running or stopped, ignoring
  /// "no such container" - the usual first step before (re)creating a
  /// container under a deterministic name.
  pub async fn remove_stale_container(&self, name: &str) -> anyhow::Result<()> {
    let res = self
      .docker
      .remove_container(
        name,
        Some(RemoveContainerOptions { force: true, v: false, ..Default::default() }),
      )
      .await;
    match res {
      Ok(()) => Ok(()),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
      Err(e) => Err(e).context(format!("failed to remove stale container {name}")),
    }
  }

  pub async fn create_container(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
    let mut exposed_ports = Vec::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &spec.ports {
      let key = format!("{}/tcp", port.container_port);
      exposed_ports.push(key.clone());
      if let Some(host_port) = port.host_port {
        port_bindings.insert(
          key,
          Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
          }]),
        );
      }
    }

    let mounts = spec
      .volumes
      .iter()
      .map(|m| Mount {
        source: Some(m.source.clone()),
        target: Some(m.target.clone()),
        typ: Some(MountTypeEnum::VOLUME),
        read_only: Some(m.read_only),
        ..Default::default()
      })
      .collect::<Vec<_>>();

    let restart_policy = if spec.restart_unless_stopped {
      Some(RestartPolicy {
        name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        maximum_retry_count: None,
      })
    } else {
      None
    };

    let host_config = HostConfig {
      mounts: Some(mounts),
      port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
      restart_policy,
      memory: spec.memory_bytes,
      nano_cpus: spec.nano_cpus,
      network_mode: spec.network.clone(),
      ..Default::default()
    };

    let config = ContainerCreateBody {
      image: Some(spec.image.clone()),
      cmd: spec.command.clone(),
      env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
      working_dir: spec.working_dir.clone(),
      exposed_ports: if exposed_ports.is_empty() {
        None
      } else {
        Some(exposed_ports.into_iter().map(|p| (p, HashMap::new())).collect())
      },
      labels: if spec.labels.is_empty() { None } else { Some(spec.labels.clone()) },
      host_config: Some(host_config),
      ..Default::default()
    };

    let options = CreateContainerOptions { name: Some(spec.name.clone()), platform: None };

    let response = self
      .docker
      .create_container(Some(options), config)
      .await
      .with_context(|| format!("failed to create container {}", spec.name))?;
    Ok(response.id)
  }

  pub async fn start_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .start_container(name, None::<StartContainerOptions>)
      .await
      .with_context(|| format!("failed to start container {name}"))
  }

  pub async fn stop_container(&self, name: &str) -> anyhow::Result<()> {
    let res = self
      .docker
      .stop_container(name, Some(StopContainerOptions { t: Some(10), ..Default::default() }))
      .await;
    match res {
      Ok(()) => Ok(()),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
      Err(e) => Err(e).with_context(|| format!("failed to stop container {name}")),
    }
  }

  pub async fn restart_container(&self, name: &str) -> anyhow::Result<()> {
    self
      .docker
      .restart_container(name, None::<RestartContainerOptions>)
      .await
      .with_context(|| format!("failed to restart container {name}"))
  }

  pub async fn force_remove_container(&self, name: &str) -> anyhow::Result<()> {
    self.remove_stale_container(name).await
  }

  pub async fn inspect_container(
    &self,
    name: &str,
  ) -> anyhow::Result<bollard::models::ContainerInspectResponse> {
    self
      .docker
      .inspect_container(name, Some(InspectContainerOptions { size: false }))
      .await
      .with_context(|| format!("failed to inspect container {name}"))
  }

  pub async fn container_exists(&self, name: &str) -> anyhow::Result<bool> {
    match self.inspect_container(name).await {
      Ok(_) => Ok(true),
      Err(e) => {
        if let Some(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) =
          e.downcast_ref()
        {
          Ok(false)
        } else {
          Err(e)
        }
      }
    }
  }

  pub async fn is_running(&self, name: &str) -> anyhow::Result<bool> {
    let info = self.inspect_container(name).await?;
    Ok(info.state.and_then(|s| s.running).unwrap_or(false))
  }

  /// Host-port bindings currently in effect for `name`, keyed by
  /// container-side port. Used to reconcile a resource's recorded ports
  /// against what the container actually has bound.
  pub async fn host_port_bindings(
    &self,
    name: &str,
  ) -> anyhow::Result<HashMap<u16, u16>> {
    let info = self.inspect_container(name).await?;
    let mut out = HashMap::new();
    let Some(ports) = info.network_settings.and_then(|ns| ns.ports) else {
      return Ok(out);
    };
    for (key, bindings) in ports {
      let Some(container_port) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
        continue;
      };
      if let Some(binding) = bindings.and_then(|b| b.into_iter().next()) {
        if let Some(host_port) = binding.host_port.and_then(|p| p.parse::<u16>().ok()) {
          out.insert(container_port, host_port);
        }
      }
    }
    Ok(out)
  }

  /// Every host-port binding on the Docker daemon, across all containers
  /// (running or stopped), used by the port allocator's bound-ports
  /// check. Fetched once per scan pass so the caller doesn't re-list per
  /// candidate port.
  pub async fn all_bound_host_ports(&self) -> anyhow::Result<std::collections::HashSet<u16>> {
    let containers = self
      .docker
      .list_containers(Some(ListContainersOptions { all: true, ..Default::default() }))
      .await
      .context("failed to list containers")?;
    let mut out = std::collections::HashSet::new();
    for container in containers {
      for port in container.ports.unwrap_or_default() {
        if let Some(host_port) = port.public_port {
          out.insert(host_port);
        }
      }
    }
    Ok(out)
  }

  pub async fn remove_image_best_effort(&self, image: &str) {
    use bollard::query_parameters::RemoveImageOptions;
    if let Err(e) = self
      .docker
      .remove_image(image, Some(RemoveImageOptions { force: true, ..Default::default() }), None)
      .await
    {
      tracing::warn!("best-effort image removal failed for {image}: {e:#}");
    }
  }
}
