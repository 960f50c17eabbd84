use std::sync::OnceLock;

use anyhow::Context;
use database::DatabaseConfig;
use kalpana_client::entities::logger::LogConfig;
use serde::Deserialize;

/// Raw environment shape, parsed with `envy` the way the teacher's
/// `bin/core/src/config.rs` parses its own `Env` (spec.md §6's "Environment
/// variables consumed by the control plane"). `_file` siblings let secret
/// values be mounted instead of set directly, same convention the teacher
/// uses for `komodo_jwt_secret`/`komodo_passkey`/etc.
#[derive(Debug, Deserialize)]
struct Env {
  #[serde(default)]
  bind_ip: Option<String>,
  #[serde(default)]
  port: Option<u16>,

  #[serde(default)]
  database_uri: Option<String>,
  #[serde(default)]
  database_uri_file: Option<String>,
  #[serde(default)]
  database_address: Option<String>,
  #[serde(default)]
  database_username: Option<String>,
  #[serde(default)]
  database_password: Option<String>,
  #[serde(default)]
  database_app_name: Option<String>,
  #[serde(default)]
  database_db_name: Option<String>,

  #[serde(default)]
  redis_url: Option<String>,
  #[serde(default)]
  redis_url_file: Option<String>,

  #[serde(default)]
  docker_host: Option<String>,

  #[serde(default)]
  container_port_range_start: Option<u16>,
  #[serde(default)]
  container_port_range_end: Option<u16>,

  #[serde(default)]
  default_container_memory: Option<i64>,
  #[serde(default)]
  default_container_cpu: Option<f64>,

  #[serde(default)]
  traefik_base_url: Option<String>,
  #[serde(default)]
  traefik_email: Option<String>,
  #[serde(default)]
  traefik_network: Option<String>,

  #[serde(default)]
  kalpana_base_domain: Option<String>,
  #[serde(default)]
  kalpana_container_dir: Option<String>,

  #[serde(default)]
  kalpana_secret_key: Option<String>,
  #[serde(default)]
  kalpana_secret_key_file: Option<String>,

  #[serde(default)]
  logging_level: Option<String>,
  #[serde(default)]
  logging_stdio: Option<String>,
  #[serde(default)]
  logging_pretty: Option<bool>,
  #[serde(default)]
  logging_otlp_endpoint: Option<String>,
}

/// Resolved, process-wide configuration. Unlike the teacher's own
/// `CoreConfig`, this does not carry auth/OIDC/cloud-provider fields - there
/// is no corresponding surface in this design.
#[derive(Debug, Clone)]
pub struct CoreConfig {
  pub bind_ip: String,
  pub port: u16,

  pub database: DatabaseConfig,
  pub redis_url: String,

  pub docker_host: Option<String>,

  pub port_range_start: u16,
  pub port_range_end: u16,

  pub default_container_memory: i64,
  pub default_container_cpu: f64,

  pub traefik_base_url: Option<String>,
  pub traefik_email: Option<String>,
  pub traefik_network: String,

  pub kalpana_base_domain: Option<String>,
  pub kalpana_container_dir: String,

  /// Base64-encoded 32-byte key. Loaded once into a `SecretCipher`, never
  /// held anywhere else (Open Question #3 in `DESIGN.md`).
  pub secret_key: String,

  pub logging: LogConfig,
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| load().expect("failed to load configuration"))
}

fn load() -> anyhow::Result<CoreConfig> {
  let env: Env = envy::from_env().context("failed to parse environment")?;

  let database_uri = read_file_or_value(
    env.database_uri_file.as_deref(),
    env.database_uri.as_deref(),
  )?;
  let redis_url = read_file_or_value(
    env.redis_url_file.as_deref(),
    env.redis_url.as_deref(),
  )?
  .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
  let secret_key = read_file_or_value(
    env.kalpana_secret_key_file.as_deref(),
    env.kalpana_secret_key.as_deref(),
  )?
  .context(
    "KALPANA_SECRET_KEY or KALPANA_SECRET_KEY_FILE must be set (C9 secret encryption key)",
  )?;

  Ok(CoreConfig {
    bind_ip: env.bind_ip.unwrap_or_else(|| "0.0.0.0".to_string()),
    port: env.port.unwrap_or(9120),
    database: DatabaseConfig {
      uri: database_uri.unwrap_or_default(),
      address: env.database_address.unwrap_or_default(),
      username: env.database_username.unwrap_or_default(),
      password: env.database_password.unwrap_or_default(),
      app_name: env.database_app_name.unwrap_or_else(|| "kalpana_core".to_string()),
      db_name: env.database_db_name.unwrap_or_else(|| "kalpana".to_string()),
    },
    redis_url,
    docker_host: env.docker_host,
    port_range_start: env.container_port_range_start.unwrap_or(40_000),
    port_range_end: env.container_port_range_end.unwrap_or(50_000),
    default_container_memory: env.default_container_memory.unwrap_or(0),
    default_container_cpu: env.default_container_cpu.unwrap_or(0.0),
    traefik_base_url: env.traefik_base_url,
    traefik_email: env.traefik_email,
    traefik_network: env.traefik_network.unwrap_or_else(|| "kalpana-edge".to_string()),
    kalpana_base_domain: env.kalpana_base_domain,
    kalpana_container_dir: env.kalpana_container_dir.unwrap_or_else(|| "/workspace".to_string()),
    secret_key,
    logging: LogConfig {
      level: env.logging_level.as_deref().map(parse_log_level).unwrap_or_default(),
      stdio: env.logging_stdio.as_deref().map(parse_stdio_mode).unwrap_or_default(),
      pretty: env.logging_pretty.unwrap_or_default(),
      otlp_endpoint: env.logging_otlp_endpoint.unwrap_or_default(),
      opentelemetry_service_name: "Kalpana Core".to_string(),
    },
  })
}

fn parse_log_level(s: &str) -> kalpana_client::entities::logger::LogLevel {
  use kalpana_client::entities::logger::LogLevel;
  match s.to_ascii_lowercase().as_str() {
    "trace" => LogLevel::Trace,
    "debug" => LogLevel::Debug,
    "warn" => LogLevel::Warn,
    "error" => LogLevel::Error,
    _ => LogLevel::Info,
  }
}

fn parse_stdio_mode(s: &str) -> kalpana_client::entities::logger::StdioLogMode {
  use kalpana_client::entities::logger::StdioLogMode;
  match s.to_ascii_lowercase().as_str() {
    "json" => StdioLogMode::Json,
    "none" => StdioLogMode::None,
    _ => StdioLogMode::Standard,
  }
}

fn read_file_or_value(
  file: Option<&str>,
  value: Option<&str>,
) -> anyhow::Result<Option<String>> {
  if let Some(path) = file {
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read secret file {path}"))?;
    return Ok(Some(content.trim().to_string()));
  }
  Ok(value.map(str::to_string))
}
