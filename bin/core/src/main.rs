#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::config::core_config;
use crate::gateway::Gateway;
use crate::ports::PortAllocator;
use crate::proxy::ProxyOrchestrator;
use crate::resource::bucket::BucketManager;
use crate::resource::database::DatabaseManager;
use crate::resource::deployment::DeploymentManager;
use crate::resource::workspace::{WorkspaceManager, default_dockerfile_dir};
use crate::resource::{DbRecordPorts, Services};

mod config;
mod docker;
mod error;
mod gateway;
mod ports;
mod proxy;
mod resource;

/// Everything the rest of the process (background loops, the websocket
/// gateway router) needs once `app()` has wired it up, handed out as
/// `Arc`s rather than reached for via a process-wide singleton (Design
/// Notes' "process-wide singletons" redesign flag).
struct Managers {
  pub workspaces: Arc<WorkspaceManager>,
  pub deployments: Arc<DeploymentManager>,
  pub databases: Arc<DatabaseManager>,
  pub buckets: Arc<BucketManager>,
}

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging).context("failed to initialize logging")?;

  info!("Kalpana Core version: v{}", env!("CARGO_PKG_VERSION"));

  let docker = Arc::new(
    docker::DockerClient::new(config.docker_host.as_deref())
      .context("failed to connect to docker")?,
  );
  docker.ping().await.context("docker is unreachable")?;

  let db = Arc::new(
    database::Client::new(&config.database).await.context("failed to connect to database")?,
  );

  let redis = Arc::new(
    redis::Client::open(config.redis_url.clone()).context("failed to parse REDIS_URL")?,
  );

  let secret_cipher = secrets::SecretCipher::from_base64(&config.secret_key)
    .context("KALPANA_SECRET_KEY is invalid")?;

  let record_ports = Arc::new(DbRecordPorts { db: db.clone() });
  let ports = Arc::new(PortAllocator::new(
    config.port_range_start,
    config.port_range_end,
    docker.clone(),
    record_ports,
  ));

  let proxy = Arc::new(ProxyOrchestrator::new(
    docker.clone(),
    config.traefik_network.clone(),
    config.traefik_email.clone(),
  ));
  proxy.ensure_proxy().await.context("failed to ensure proxy container")?;

  let services = Arc::new(Services {
    docker: docker.clone(),
    ports,
    proxy,
    db: db.clone(),
    secrets: Arc::new(secret_cipher),
    config: Arc::new(config.clone()),
    redis: redis.clone(),
  });

  let managers = Managers {
    workspaces: Arc::new(WorkspaceManager::new(
      services.clone(),
      default_dockerfile_dir(&config.kalpana_container_dir),
    )),
    deployments: Arc::new(DeploymentManager::new(services.clone())),
    databases: Arc::new(DatabaseManager::new(services.clone())),
    buckets: Arc::new(BucketManager::new(services.clone())),
  };
  // Held for the lifetime of the process; the HTTP API surface that would
  // dispatch requests to these managers is out of scope (spec.md §1).
  let _managers = managers;

  let gateway = Gateway::new(db.clone(), redis.clone()).await.context("failed to start gateway")?;
  gateway.spawn_background_tasks();

  let app = Router::new()
    .merge(gateway.router())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr).context("failed to parse listen address")?;

  info!("Kalpana Core starting on http://{socket_addr}");
  let listener = tokio::net::TcpListener::bind(socket_addr)
    .await
    .with_context(|| format!("failed to bind {socket_addr}"))?;
  axum::serve(listener, app).await.context("failed to start http server")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => Ok(()),
  }
}
