//! C4: the deployment builder (spec.md §4.4). Owns the shared
//! build pipeline (workspace-based and standalone branches), the start
//! phase that promotes a freshly built image into a routed production
//! container, build cancellation, and stop/delete.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::oid::ObjectId;
use database::StateStore;
use hmac::{Hmac, Mac};
use kalpana_client::entities::ResourceStatus;
use kalpana_client::entities::deployment::{Build, BuildStatus, BuildTrigger, Deployment};
use kalpana_client::entities::log::Log;
use sha2::Sha256;

use super::workspace::WORKSPACE_IMAGE_TAG;
use super::{PortShape, Services, create_and_start_with_port_retry};
use crate::docker::containers::{ContainerSpec, PortSpec};
use crate::error::BuildError;
use crate::proxy::{RoutingDecision, select_routing};

/// Generic runtime image pulled for the standalone build branch
/// (spec.md §4.4 standalone step 1: "a generic JS runtime image is
/// acceptable").
const BUILD_IMAGE: &str = "node:20-bookworm";
/// Coalesced log-flush interval (spec.md §4.4 shared pipeline step 3).
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct DeploymentManager {
  pub services: Arc<Services>,
}

/// Accumulates build output into one append-only buffer, flushing to the
/// `Build` row at most once per second so in-flight viewers can tail
/// without every `exec` chunk round-tripping to the state store.
struct BuildLogAccumulator<'a> {
  db: &'a database::Client,
  build_id: String,
  buffer: String,
  last_flush: Instant,
}

impl<'a> BuildLogAccumulator<'a> {
  fn new(db: &'a database::Client, build_id: String) -> Self {
    Self { db, build_id, buffer: String::new(), last_flush: Instant::now() }
  }

  async fn push(&mut self, log: &Log) {
    self.buffer.push_str(&log.to_buffer_entry());
    if self.last_flush.elapsed() >= LOG_FLUSH_INTERVAL {
      self.flush().await;
    }
  }

  async fn push_line(&mut self, line: &str) {
    self.buffer.push_str(line);
    if !line.ends_with('\n') {
      self.buffer.push('\n');
    }
    self.flush().await;
  }

  async fn flush(&mut self) {
    let _ = self
      .db
      .builds
      .update(&self.build_id, bson::doc! { "logs": &self.buffer })
      .await;
    self.last_flush = Instant::now();
  }
}

impl DeploymentManager {
  pub fn new(services: Arc<Services>) -> Self {
    Self { services }
  }

  /// Runs the shared build pipeline end to end: starts a `Build` row
  /// guarded by the `current_build_id` conditional update (Open Question
  /// #4), dispatches to the workspace-based or standalone branch, and on
  /// success runs the start phase. Returns the refreshed `Deployment`.
  pub async fn build(
    &self,
    deployment: &Deployment,
    trigger: BuildTrigger,
    token: Option<&str>,
  ) -> anyhow::Result<Deployment> {
    let build = match self.start_build_row(&deployment.meta.id, trigger).await? {
      Some(build) => build,
      None => return Err(BuildError::AlreadyBuilding.into()),
    };

    let mut log = BuildLogAccumulator::new(&self.services.db, build.id.clone());
    let pipeline_result = if deployment.is_workspace_based() {
      self.run_workspace_branch(deployment, &mut log).await
    } else {
      self.run_standalone_branch(deployment, token, &mut log).await
    };

    match pipeline_result {
      Ok(image) => {
        log.push_line("build succeeded").await;
        self.services.db.builds.update(
          &build.id,
          bson::doc! {
            "status": bson::to_bson(&BuildStatus::Success)?,
            "completed_at": kalpana_client::entities::kalpana_timestamp(),
            "logs": &log.buffer,
          },
        )
        .await?;
        self.clear_current_build(&deployment.meta.id).await?;

        match self.start_phase(deployment, &image).await {
          Ok(updated) => Ok(updated),
          Err(e) => {
            self.services.db.deployments.update(
              &deployment.meta.id,
              bson::doc! { "status": bson::to_bson(&ResourceStatus::Error)? },
            )
            .await?;
            Err(e)
          }
        }
      }
      Err(e) => {
        log.push_line(&format!("build failed: {e}")).await;
        self.services.db.builds.update(
          &build.id,
          bson::doc! {
            "status": bson::to_bson(&BuildStatus::Failed)?,
            "completed_at": kalpana_client::entities::kalpana_timestamp(),
            "logs": &log.buffer,
            "error_message": e.to_string(),
          },
        )
        .await?;
        self.clear_current_build(&deployment.meta.id).await?;
        self.services.db.deployments.update(
          &deployment.meta.id,
          bson::doc! { "status": bson::to_bson(&ResourceStatus::Error)? },
        )
        .await?;
        Err(e)
      }
    }
  }

  /// Creates a `Build` row and atomically claims `current_build_id` on
  /// the deployment; returns `None` if another build already holds the
  /// slot (spec.md §3 "at most one BUILDING build per deployment").
  async fn start_build_row(
    &self,
    deployment_id: &str,
    trigger: BuildTrigger,
  ) -> anyhow::Result<Option<Build>> {
    let build = self.services.db.builds.create(Build::new(deployment_id, trigger)).await?;

    let oid = ObjectId::from_str(deployment_id)?;
    let filter = bson::doc! { "_id": oid, "current_build_id": bson::Bson::Null };
    let update = bson::doc! {
      "$set": {
        "current_build_id": &build.id,
        "status": bson::to_bson(&ResourceStatus::Creating)?,
      }
    };
    let result = self.services.db.deployments.collection.update_one(filter, update).await?;
    if result.modified_count == 0 {
      self.services.db.builds.delete(&build.id).await.ok();
      return Ok(None);
    }
    Ok(Some(build))
  }

  async fn clear_current_build(&self, deployment_id: &str) -> anyhow::Result<()> {
    self.services.db.deployments.update(
      deployment_id,
      bson::doc! { "current_build_id": bson::Bson::Null },
    )
    .await
  }

  /// `exec` the build command inside the user's already-running workspace
  /// container (spec.md §4.4 "Workspace-based branch"). Returns the image
  /// the start phase should run - the workspace base image itself, since
  /// nothing new is committed.
  async fn run_workspace_branch(
    &self,
    deployment: &Deployment,
    log: &mut BuildLogAccumulator<'_>,
  ) -> anyhow::Result<String> {
    let workspace_id = deployment
      .workspace_id
      .as_deref()
      .ok_or_else(|| anyhow::anyhow!("workspace-based deployment has no workspace_id"))?;
    let workspace = self
      .services
      .db
      .workspaces
      .find_by_id(workspace_id)
      .await?
      .ok_or_else(|| anyhow::anyhow!("workspace {workspace_id} not found"))?;

    if !deployment.build_command.is_empty() {
      let result = self
        .services
        .docker
        .exec(
          &workspace.container_name(),
          vec!["sh".to_string(), "-c".to_string(), deployment.build_command.clone()],
          Some(&deployment.working_dir),
        )
        .await?;
      log
        .push(&Log {
          stage: "Build".to_string(),
          command: deployment.build_command.clone(),
          stdout: result.stdout,
          stderr: result.stderr,
          success: result.exit_code == 0,
          start_ts: kalpana_client::entities::kalpana_timestamp(),
          end_ts: kalpana_client::entities::kalpana_timestamp(),
        })
        .await;
      if result.exit_code != 0 {
        return Err(BuildError::StepFailed {
          stage: "build".to_string(),
          message: format!("exit code {}", result.exit_code),
        }
        .into());
      }
    }

    Ok(WORKSPACE_IMAGE_TAG.to_string())
  }

  /// Clones, installs, and builds inside an ephemeral build container,
  /// then commits it as `deploy-{deploymentId}:latest` (spec.md §4.4
  /// "Standalone branch"). Returns the committed image tag.
  async fn run_standalone_branch(
    &self,
    deployment: &Deployment,
    token: Option<&str>,
    log: &mut BuildLogAccumulator<'_>,
  ) -> anyhow::Result<String> {
    let github = deployment
      .github
      .as_ref()
      .ok_or_else(|| anyhow::anyhow!("standalone deployment has no github source"))?;

    self.services.docker.pull_image(BUILD_IMAGE).await?;

    let container_name = deployment.build_container_name();
    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("kalpana.deployment.id".to_string(), deployment.meta.id.clone());

    self.services.docker.remove_stale_container(&container_name).await?;
    self
      .services
      .docker
      .create_container(&ContainerSpec {
        name: container_name.clone(),
        image: BUILD_IMAGE.to_string(),
        command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        labels,
        ..Default::default()
      })
      .await?;
    self.services.docker.start_container(&container_name).await?;

    let clone_args = git::CloneArgs::new(github.repo.clone()).branch(github.branch.clone());
    let clone_args = match token {
      Some(token) => clone_args.token(token.to_string()),
      None => clone_args,
    };
    let working_dir = if github.root_directory.is_empty() {
      "/app/repo".to_string()
    } else {
      format!("/app/repo/{}", github.root_directory.trim_start_matches('/'))
    };

    let pipeline: Vec<(&str, String, Option<&str>)> = [
      ("Install Git", "apt-get update && apt-get install -y git".to_string(), None),
      ("Clone", clone_args.clone_command("/app/repo"), None),
      ("Install", deployment.install_command.clone(), Some(working_dir.as_str())),
      ("Build", deployment.build_command.clone(), Some(working_dir.as_str())),
    ]
    .into_iter()
    .filter(|(_, command, _)| !command.is_empty())
    .collect();

    for (stage, command, working_dir) in pipeline {
      let step = self
        .run_build_step(
          &container_name,
          stage,
          vec!["sh".to_string(), "-c".to_string(), command],
          working_dir,
          log,
        )
        .await;
      if let Err(e) = step {
        self.cleanup_build_container(&container_name).await;
        return Err(e);
      }
    }

    let image_tag = deployment.image_tag();
    let mut commit_labels = HashMap::new();
    commit_labels.insert("kalpana.managed".to_string(), "true".to_string());
    commit_labels.insert("kalpana.deployment.id".to_string(), deployment.meta.id.clone());
    let commit_result =
      self.services.docker.commit_container(&container_name, &image_tag, commit_labels).await;

    self.cleanup_build_container(&container_name).await;
    commit_result?;

    Ok(image_tag)
  }

  async fn run_build_step(
    &self,
    container_name: &str,
    stage: &str,
    cmd: Vec<String>,
    working_dir: Option<&str>,
    log: &mut BuildLogAccumulator<'_>,
  ) -> anyhow::Result<()> {
    let command_str = cmd.join(" ");
    let result = self.services.docker.exec(container_name, cmd, working_dir).await?;
    log
      .push(&Log {
        stage: stage.to_string(),
        command: command_str,
        stdout: result.stdout,
        stderr: result.stderr,
        success: result.exit_code == 0,
        start_ts: kalpana_client::entities::kalpana_timestamp(),
        end_ts: kalpana_client::entities::kalpana_timestamp(),
      })
      .await;
    if result.exit_code != 0 {
      return Err(
        BuildError::StepFailed { stage: stage.to_string(), message: format!("exit code {}", result.exit_code) }
          .into(),
      );
    }
    Ok(())
  }

  async fn cleanup_build_container(&self, container_name: &str) {
    self.services.docker.stop_container(container_name).await.ok();
    self.services.docker.force_remove_container(container_name).await.ok();
  }

  /// Stops/removes any prior deployment container, determines routing,
  /// creates the production container, attaches to the proxy network if
  /// routed, and persists the result (spec.md §4.4 "Start phase").
  async fn start_phase(&self, deployment: &Deployment, image: &str) -> anyhow::Result<Deployment> {
    let container_name = deployment.container_name();
    self.services.docker.stop_container(&container_name).await.ok();
    self.services.docker.force_remove_container(&container_name).await?;

    let platform_base_domain = self.services.config.kalpana_base_domain.as_deref();
    let verified_domain = self.verified_custom_domain(deployment).await?;
    let routing = select_routing(
      &deployment.meta.id,
      deployment.meta.subdomain.as_deref(),
      verified_domain.as_deref(),
      platform_base_domain,
    );

    let decrypted = if deployment.encrypted_env.is_empty() {
      Default::default()
    } else {
      self.services.secrets.decrypt_env(&deployment.encrypted_env)?
    };
    let mut env: Vec<String> = decrypted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.push(format!("PORT={}", deployment.internal_port));

    let start_cmd = format!(
      "cd {} && {}",
      if deployment.working_dir.is_empty() { "." } else { &deployment.working_dir },
      deployment.start_command
    );

    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("kalpana.deployment.id".to_string(), deployment.meta.id.clone());

    let image = image.to_string();
    let (container_id, exposed_port) = match &routing {
      RoutingDecision::HostPort => {
        let (container_id, ports) = create_and_start_with_port_retry(
          &self.services.docker,
          &self.services.ports,
          PortShape::Single,
          |ports| ContainerSpec {
            name: container_name.clone(),
            image: image.clone(),
            command: Some(vec!["sh".to_string(), "-c".to_string(), start_cmd.clone()]),
            env: env.clone(),
            ports: vec![PortSpec { container_port: deployment.internal_port, host_port: Some(ports[0]) }],
            labels: labels.clone(),
            restart_unless_stopped: true,
            ..Default::default()
          },
        )
        .await?;
        (container_id, Some(ports[0]))
      }
      RoutingDecision::Domain { subdomain, domain } | RoutingDecision::BaseDomain { subdomain, domain } => {
        let mut routed_labels = self.services.proxy.labels_for_http(
          &deployment.meta.id,
          subdomain,
          deployment.internal_port,
          domain,
        );
        routed_labels.extend(labels.clone());
        self.services.docker.remove_stale_container(&container_name).await?;
        let container_id = self
          .services
          .docker
          .create_container(&ContainerSpec {
            name: container_name.clone(),
            image: image.clone(),
            command: Some(vec!["sh".to_string(), "-c".to_string(), start_cmd.clone()]),
            env: env.clone(),
            labels: routed_labels,
            network: Some(self.services.proxy.network.clone()),
            restart_unless_stopped: true,
            ..Default::default()
          })
          .await?;
        self.services.docker.start_container(&container_name).await?;
        self.services.proxy.attach(&container_id).await?;
        (container_id, None)
      }
    };

    let mut deployment = deployment.clone();
    deployment.meta.container_id = Some(container_id);
    deployment.exposed_port = exposed_port;
    deployment.last_deployed_at = Some(kalpana_client::entities::kalpana_timestamp());
    deployment.meta.status = ResourceStatus::Running;
    deployment.meta.touch();

    self.services.db.deployments.update(
      &deployment.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Running)?,
        "container_id": &deployment.meta.container_id,
        "exposed_port": deployment.exposed_port.map(|p| p as i32),
        "last_deployed_at": deployment.last_deployed_at,
        "updated_at": deployment.meta.updated_at,
      },
    )
    .await?;

    // Best-effort: reclaim the committed image once the production
    // container built from it is running (spec.md §4.4 standalone step
    // 6). Workspace-based deployments reuse the shared workspace image
    // and must never be removed here.
    if !deployment.is_workspace_based() {
      self.services.docker.remove_image_best_effort(&deployment.image_tag()).await;
    }

    Ok(deployment)
  }

  /// Resolves `deployment.meta.domain_id` to a verified domain name, or
  /// `None` if unset or not verified (spec.md §4.2 domain selection
  /// precedence tier 1: "only domains marked verified may be referenced").
  async fn verified_custom_domain(&self, deployment: &Deployment) -> anyhow::Result<Option<String>> {
    let Some(domain_id) = &deployment.meta.domain_id else {
      return Ok(None);
    };
    let domain = self.services.db.domains.find_by_id(domain_id).await?;
    Ok(domain.filter(|d| d.verified).map(|d| d.name))
  }

  /// Best-effort cancellation of the in-flight build (spec.md §4.4
  /// "Cancel"): stop/remove the build container if present, mark the
  /// `Build` row CANCELLED, and revert the deployment to STOPPED
  /// regardless of whether a container was actually found.
  pub async fn stop_build(&self, deployment: &Deployment, build_id: &str) -> anyhow::Result<()> {
    let build = self
      .services
      .db
      .builds
      .find_by_id(build_id)
      .await?
      .ok_or_else(|| anyhow::anyhow!("build {build_id} not found"))?;
    if build.status != BuildStatus::Building {
      return Ok(());
    }

    self.cleanup_build_container(&deployment.build_container_name()).await;

    let mut logs = build.logs.clone();
    logs.push_str("cancelled by user\n");
    self.services.db.builds.update(
      build_id,
      bson::doc! {
        "status": bson::to_bson(&BuildStatus::Cancelled)?,
        "completed_at": kalpana_client::entities::kalpana_timestamp(),
        "logs": logs,
      },
    )
    .await?;

    self.clear_current_build(&deployment.meta.id).await?;
    self.services.db.deployments.update(
      &deployment.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Stopped)? },
    )
    .await?;
    Ok(())
  }

  /// Detaches from the proxy network (no-op if not attached), stops and
  /// removes the deployment container, and sets STOPPED (spec.md §4.4
  /// "Stop/Delete").
  pub async fn stop(&self, deployment: &Deployment) -> anyhow::Result<()> {
    if let Some(container_id) = &deployment.meta.container_id {
      self.services.proxy.detach(container_id).await.ok();
    }
    let name = deployment.container_name();
    self.services.docker.stop_container(&name).await?;
    self.services.docker.force_remove_container(&name).await?;
    if let Some(port) = deployment.exposed_port {
      self.services.ports.release_port(port);
    }
    self.services.db.deployments.update(
      &deployment.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Stopped)?,
        "container_id": bson::Bson::Null,
      },
    )
    .await?;
    Ok(())
  }

  /// Stop, then cascade-delete every `Build` row for this deployment
  /// (spec.md §4.4 "Delete additionally cascades Build rows").
  pub async fn destroy(&self, deployment: &Deployment) -> anyhow::Result<()> {
    self.stop(deployment).await.ok();
    let builds = self.services.db.builds.list_by(bson::doc! { "deployment_id": &deployment.meta.id }).await?;
    for build in builds {
      self.services.db.builds.delete(&build.id).await.ok();
    }
    self.services.db.deployments.update(
      &deployment.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Deleted)? },
    )
    .await?;
    Ok(())
  }

  pub async fn build_logs(&self, build_id: &str) -> anyhow::Result<String> {
    let build = self
      .services
      .db
      .builds
      .find_by_id(build_id)
      .await?
      .ok_or_else(|| anyhow::anyhow!("build {build_id} not found"))?;
    Ok(build.logs)
  }
}

type HmacSha256 = Hmac<Sha256>;

/// `X-Hub-Signature-256`-style HMAC verification gating webhook-triggered
/// auto-rebuilds, keyed by Deployment.webhookSecret.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
  let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
    return false;
  };
  let Ok(expected) = hex::decode(hex_sig) else {
    return false;
  };
  let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
    return false;
  };
  mac.update(body);
  mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn verifies_matching_signature() {
    let secret = "shh";
    let body = b"payload";
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    assert!(verify_webhook_signature(secret, body, &sig));
  }

  #[test]
  fn rejects_bad_signature() {
    assert!(!verify_webhook_signature("shh", b"payload", "sha256=deadbeef"));
  }

  #[test]
  fn rejects_missing_prefix() {
    assert!(!verify_webhook_signature("shh", b"payload", "deadbeef"));
  }
}
