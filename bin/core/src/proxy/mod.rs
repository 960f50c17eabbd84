//! C2: the reverse-proxy orchestrator (spec.md §4.2). Maintains a shared
//! Traefik-compatible edge router container and the shared bridge
//! network, and produces the container-label sets that let the router
//! discover HTTP/TCP routes by polling labels - no direct coupling
//! between this process and the router's own config format.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;

use crate::docker::{ContainerSpec, DockerClient};
use crate::error::ProxyError;

/// TCP-routable database protocols (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpProtocol {
  Postgres,
  Mysql,
  Mongodb,
  Redis,
}

impl TcpProtocol {
  fn entrypoint(self) -> &'static str {
    match self {
      TcpProtocol::Postgres => "postgres",
      TcpProtocol::Mysql => "mysql",
      TcpProtocol::Mongodb => "mongodb",
      TcpProtocol::Redis => "redis",
    }
  }
}

pub const PROXY_CONTAINER_NAME: &str = "kalpana-proxy";
const PROXY_LABEL_KEY: &str = "kalpana.proxy";

pub struct ProxyOrchestrator {
  docker: Arc<DockerClient>,
  pub network: String,
  traefik_email: Option<String>,
}

impl ProxyOrchestrator {
  pub fn new(docker: Arc<DockerClient>, network: String, traefik_email: Option<String>) -> Self {
    Self { docker, network, traefik_email }
  }

  pub async fn ensure_network(&self) -> Result<(), ProxyError> {
    self.docker.ensure_network(&self.network).await?;
    Ok(())
  }

  /// Idempotent: starts the existing proxy container if stopped,
  /// otherwise creates it fresh on the shared network with HTTP/HTTPS and
  /// per-protocol TCP SNI entrypoints (spec.md §4.2).
  pub async fn ensure_proxy(&self) -> Result<(), ProxyError> {
    self.ensure_network().await?;

    if self.docker.container_exists(PROXY_CONTAINER_NAME).await? {
      if !self.docker.is_running(PROXY_CONTAINER_NAME).await? {
        self
          .docker
          .start_container(PROXY_CONTAINER_NAME)
          .await
          .map_err(|e| ProxyError::EnsureFailed(e.to_string()))?;
      }
      return Ok(());
    }

    let mut labels = HashMap::new();
    labels.insert(PROXY_LABEL_KEY.to_string(), "true".to_string());
    labels.insert("kalpana.managed".to_string(), "true".to_string());

    let mut args = vec![
      "--providers.docker=true".to_string(),
      "--providers.docker.exposedbydefault=false".to_string(),
      "--entrypoints.web.address=:80".to_string(),
      "--entrypoints.websecure.address=:443".to_string(),
      "--entrypoints.postgres.address=:5432".to_string(),
      "--entrypoints.mysql.address=:3306".to_string(),
      "--entrypoints.mongodb.address=:27017".to_string(),
      "--entrypoints.redis.address=:6379".to_string(),
    ];
    if let Some(email) = &self.traefik_email {
      args.push("--certificatesresolvers.letsencrypt.acme.tlschallenge=true".to_string());
      args.push(format!("--certificatesresolvers.letsencrypt.acme.email={email}"));
      args.push(
        "--certificatesresolvers.letsencrypt.acme.storage=/letsencrypt/acme.json".to_string(),
      );
    }

    let spec = ContainerSpec {
      name: PROXY_CONTAINER_NAME.to_string(),
      image: "traefik:v3.1".to_string(),
      command: Some(args),
      ports: vec![
        crate::docker::containers::PortSpec { container_port: 80, host_port: Some(80) },
        crate::docker::containers::PortSpec { container_port: 443, host_port: Some(443) },
        crate::docker::containers::PortSpec { container_port: 5432, host_port: Some(5432) },
        crate::docker::containers::PortSpec { container_port: 3306, host_port: Some(3306) },
        crate::docker::containers::PortSpec { container_port: 27017, host_port: Some(27017) },
        crate::docker::containers::PortSpec { container_port: 6379, host_port: Some(6379) },
      ],
      volumes: vec![crate::docker::containers::VolumeMount::rw(
        "/var/run/docker.sock",
        "/var/run/docker.sock",
      )],
      labels,
      network: Some(self.network.clone()),
      restart_unless_stopped: true,
      ..Default::default()
    };

    self
      .docker
      .pull_image("traefik:v3.1")
      .await
      .context("failed to pull traefik image")?;
    self
      .docker
      .create_container(&spec)
      .await
      .map_err(|e| ProxyError::EnsureFailed(e.to_string()))?;
    self
      .docker
      .start_container(PROXY_CONTAINER_NAME)
      .await
      .map_err(|e| ProxyError::EnsureFailed(e.to_string()))?;
    Ok(())
  }

  pub async fn attach(&self, container_id: &str) -> anyhow::Result<()> {
    self.docker.attach(&self.network, container_id).await
  }

  pub async fn detach(&self, container_id: &str) -> anyhow::Result<()> {
    self.docker.detach(&self.network, container_id).await
  }

  /// `Host(subdomain.domain)`, TLS via `letsencrypt`, backend = the
  /// container's internal port (spec.md §4.2).
  pub fn labels_for_http(
    &self,
    resource_id: &str,
    subdomain: &str,
    internal_port: u16,
    domain: &str,
  ) -> HashMap<String, String> {
    let router = format!("kalpana-{resource_id}");
    let host = format!("{subdomain}.{domain}");
    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(format!("traefik.http.routers.{router}.rule"), format!("Host(`{host}`)"));
    labels.insert(format!("traefik.http.routers.{router}.entrypoints"), "websecure".to_string());
    labels.insert(format!("traefik.http.routers.{router}.tls.certresolver"), "letsencrypt".to_string());
    labels.insert(
      format!("traefik.http.services.{router}.loadbalancer.server.port"),
      internal_port.to_string(),
    );
    labels
  }

  /// `HostSNI(subdomain.domain)` on the protocol's entrypoint (spec.md
  /// §4.2).
  pub fn labels_for_tcp(
    &self,
    resource_id: &str,
    subdomain: &str,
    domain: &str,
    protocol: TcpProtocol,
    internal_port: u16,
  ) -> HashMap<String, String> {
    let router = format!("kalpana-{resource_id}");
    let host = format!("{subdomain}.{domain}");
    let entrypoint = protocol.entrypoint();
    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(format!("traefik.tcp.routers.{router}.rule"), format!("HostSNI(`{host}`)"));
    labels.insert(format!("traefik.tcp.routers.{router}.entrypoints"), entrypoint.to_string());
    labels.insert(format!("traefik.tcp.routers.{router}.tls.certresolver"), "letsencrypt".to_string());
    labels.insert(format!("traefik.tcp.routers.{router}.tls"), "true".to_string());
    labels.insert(
      format!("traefik.tcp.services.{router}.loadbalancer.server.port"),
      internal_port.to_string(),
    );
    labels
  }
}

/// Domain selection precedence (spec.md §4.2), shared by C3/C4/C5.
pub enum RoutingDecision {
  /// A verified custom domain + subdomain: HTTP/TCP labels should be
  /// applied and no host-port binding is needed.
  Domain { subdomain: String, domain: String },
  /// No custom domain, but a platform base domain is configured: route
  /// `resourceId.baseDomain`.
  BaseDomain { subdomain: String, domain: String },
  /// Neither: expose via a host-port binding instead.
  HostPort,
}

pub fn select_routing(
  resource_id: &str,
  custom_subdomain: Option<&str>,
  custom_domain_verified: Option<&str>,
  platform_base_domain: Option<&str>,
) -> RoutingDecision {
  if let (Some(subdomain), Some(domain)) = (custom_subdomain, custom_domain_verified) {
    return RoutingDecision::Domain { subdomain: subdomain.to_string(), domain: domain.to_string() };
  }
  if let Some(base) = platform_base_domain {
    return RoutingDecision::BaseDomain { subdomain: resource_id.to_string(), domain: base.to_string() };
  }
  RoutingDecision::HostPort
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn precedence_prefers_custom_domain() {
    let decision = select_routing("r1", Some("my-app"), Some("example.com"), Some("kalpana.dev"));
    assert!(matches!(decision, RoutingDecision::Domain { .. }));
  }

  #[test]
  fn falls_back_to_base_domain() {
    let decision = select_routing("r1", None, None, Some("kalpana.dev"));
    match decision {
      RoutingDecision::BaseDomain { subdomain, domain } => {
        assert_eq!(subdomain, "r1");
        assert_eq!(domain, "kalpana.dev");
      }
      _ => panic!("expected base domain"),
    }
  }

  #[test]
  fn falls_back_to_host_port() {
    assert!(matches!(select_routing("r1", None, None, None), RoutingDecision::HostPort));
  }
}
