#[macro_use]
extern crate tracing;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;

use crate::bridge::BridgeClient;
use crate::config::executor_config;
use crate::model::{ModelClient, OpenAiCompatibleClient};
use crate::publisher::Publisher;
use crate::routes::AppState;

mod bridge;
mod config;
mod error;
mod model;
mod publisher;
mod routes;
mod tools;

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = executor_config();
  logger::init(&config.logging).context("failed to initialize logging")?;

  info!("Kalpana Executor starting for workspace {}", config.workspace_id);

  let redis_client =
    redis::Client::open(config.redis_url.clone()).context("failed to parse REDIS_URL")?;
  let conn = redis_client
    .get_multiplexed_async_connection()
    .await
    .context("failed to connect to redis")?;

  let model: Arc<dyn ModelClient> =
    Arc::new(OpenAiCompatibleClient::new(&config.model_provider_base_url));
  let bridge = BridgeClient::new(config.bridge_url.clone());

  let publisher =
    Arc::new(Publisher::new(config.workspace_id.clone(), conn, model, bridge.clone()));

  let state = Arc::new(AppState {
    publisher,
    bridge,
    default_model: config.default_model.clone(),
    workspace_id: config.workspace_id.clone(),
    default_api_key: config.openrouter_api_key.clone(),
  });

  let app: Router = routes::router(state);

  let addr = format!("0.0.0.0:{}", config.port);
  let socket_addr = SocketAddr::from_str(&addr).context("failed to parse listen address")?;

  info!("Kalpana Executor listening on http://{socket_addr}");
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
