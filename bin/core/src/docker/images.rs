//! Pulling third-party images on demand, and building the bundled
//! workspace Dockerfile. The workspace build is wrapped by
//! `ensure_workspace_image` in `bin/core/src/docker/mod.rs` with a
//! process-wide single-flight lock (`cache::KeyedLock`) so concurrent
//! callers share one in-flight build instead of racing the daemon.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use bollard::query_parameters::{BuildImageOptions, CreateImageOptions};
use futures_util::StreamExt;

use super::DockerClient;

impl DockerClient {
  /// `docker pull`, draining the progress stream to completion so the
  /// caller only observes success/failure, not intermediate layers.
  pub async fn pull_image(&self, image: &str) -> anyhow::Result<()> {
    let (repo, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
    let mut stream = self.docker.create_image(
      Some(CreateImageOptions {
        from_image: Some(repo.to_string()),
        tag: Some(tag.to_string()),
        ..Default::default()
      }),
      None,
      None,
    );
    while let Some(progress) = stream.next().await {
      progress.with_context(|| format!("failed to pull image {image}"))?;
    }
    Ok(())
  }

  pub async fn image_exists(&self, image: &str) -> anyhow::Result<bool> {
    match self.docker.inspect_image(image).await {
      Ok(_) => Ok(true),
      Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
      Err(e) => Err(e).with_context(|| format!("failed to inspect image {image}")),
    }
  }

  /// Builds the workspace image from the Dockerfile bundled with the
  /// control plane at `dockerfile_dir` (that directory is sent to the
  /// daemon as the build context), tagging the result `tag`.
  pub async fn build_image(&self, dockerfile_dir: &Path, tag: &str) -> anyhow::Result<()> {
    let tar_bytes = tar_directory(dockerfile_dir)
      .with_context(|| format!("failed to tar build context {}", dockerfile_dir.display()))?;

    let mut stream = self.docker.build_image(
      BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: Some(tag.to_string()),
        rm: true,
        ..Default::default()
      },
      None,
      Some(tar_bytes.into()),
    );
    while let Some(progress) = stream.next().await {
      let info = progress.with_context(|| format!("failed to build image {tag}"))?;
      if let Some(error) = info.error {
        anyhow::bail!("docker build error: {error}");
      }
    }
    Ok(())
  }
}

fn tar_directory(dir: &Path) -> anyhow::Result<Vec<u8>> {
  let mut buf = Vec::new();
  {
    let mut builder = tar::Builder::new(&mut buf);
    builder.append_dir_all(".", dir)?;
    builder.finish()?;
  }
  buf.flush().ok();
  Ok(buf)
}
