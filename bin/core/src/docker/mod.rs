//! `DockerClient`: a thin wrapper over `bollard`, constructed once at
//! startup and handed to every component that needs it as an injected
//! `Arc<DockerClient>` rather than a process-wide singleton.

use std::time::Duration;

use anyhow::Context;
use bollard::Docker;

pub mod commit;
pub mod containers;
pub mod exec;
pub mod images;
pub mod logs;
pub mod networks;
pub mod stats;
pub mod volumes;

pub use containers::ContainerSpec;

use cache::KeyedLock;

pub struct DockerClient {
  pub docker: Docker,
  /// Process-wide single-flight lock for `ensure_workspace_image`: N
  /// concurrent callers wait on the one in-flight build instead of each
  /// starting their own.
  image_build_lock: KeyedLock<String>,
}

impl DockerClient {
  /// Honors `DOCKER_HOST` if set, recognizing `unix://`, `npipe://`,
  /// `tcp://`, and `http(s)://` forms; falls back to the OS default
  /// connection (Unix socket or Windows named pipe) on an unset or
  /// unparseable value.
  pub fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
    let docker = match docker_host {
      Some(host) if host.starts_with("unix://") => {
        Docker::connect_with_unix(host, 120, bollard::API_DEFAULT_VERSION)
          .context("failed to connect to docker over unix socket")?
      }
      Some(host) if host.starts_with("npipe://") => {
        Docker::connect_with_named_pipe(host, 120, bollard::API_DEFAULT_VERSION)
          .context("failed to connect to docker over named pipe")?
      }
      Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
          .context("failed to connect to docker over http")?
      }
      Some(host) if host.starts_with("https://") => {
        Docker::connect_with_ssl_defaults()
          .or_else(|_| Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION))
          .context("failed to connect to docker over https")?
      }
      _ => Docker::connect_with_local_defaults()
        .context("failed to connect to docker via OS default endpoint")?,
    };

    Ok(Self { docker, image_build_lock: KeyedLock::default() })
  }

  pub async fn ping(&self) -> anyhow::Result<()> {
    self.docker.ping().await.context("docker ping failed")?;
    Ok(())
  }

  /// Builds `tag` from `dockerfile_dir` if it doesn't already exist.
  /// Single-flight per tag: concurrent callers block on the same lock and
  /// the second-through-Nth see the image already present once they
  /// acquire it, so only one `docker build` ever runs.
  pub async fn ensure_workspace_image(
    &self,
    dockerfile_dir: &std::path::Path,
    tag: &str,
  ) -> anyhow::Result<()> {
    let lock = self.image_build_lock.get_lock(tag.to_string()).await;
    let _guard = lock.lock().await;
    if self.image_exists(tag).await? {
      return Ok(());
    }
    self.build_image(dockerfile_dir, tag).await
  }
}

/// 1-second TCP bind probe used by the port allocator's final
/// availability check. Lives here rather than `ports/` since it's a pure
/// OS operation with no Docker dependency, but its timeout mirrors the
/// Docker-call timeouts this module otherwise deals in.
pub async fn port_is_bindable(port: u16) -> bool {
  tokio::time::timeout(Duration::from_secs(1), async move {
    tokio::net::TcpListener::bind(("0.0.0.0", port)).await
  })
  .await
  .map(|res| res.is_ok())
  .unwrap_or(false)
}
