//! Committing a build container's filesystem into a new image (spec.md
//! §4.4 standalone branch step 5: "Commit the build container as an
//! image tagged `deploy-{deploymentId}:latest`").

use std::collections::HashMap;

use anyhow::Context;
use bollard::models::ContainerConfig;
use bollard::query_parameters::CommitContainerOptions;

use super::DockerClient;

impl DockerClient {
  /// `repo:tag` is split the same way `pull_image` splits it; labels are
  /// carried onto the resulting image config so `remove_image_best_effort`
  /// and friends can identify it later if needed.
  pub async fn commit_container(
    &self,
    container_name: &str,
    image_tag: &str,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    let (repo, tag) = image_tag.rsplit_once(':').unwrap_or((image_tag, "latest"));
    self
      .docker
      .commit_container(
        CommitContainerOptions {
          container: container_name.to_string(),
          repo: Some(repo.to_string()),
          tag: Some(tag.to_string()),
          comment: Some("kalpana deployment build".to_string()),
          author: Some("kalpana".to_string()),
          pause: Some(false),
          ..Default::default()
        },
        ContainerConfig { labels: Some(labels), ..Default::default() },
      )
      .await
      .with_context(|| {
        format!("failed to commit container {container_name} to image {image_tag}")
      })?;
    Ok(())
  }
}
