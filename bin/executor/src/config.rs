use std::sync::OnceLock;

use anyhow::Context;
use kalpana_client::entities::logger::LogConfig;
use serde::Deserialize;

/// Raw environment shape for the in-container executor process, parsed
/// with `envy` like `kalpana-core`'s own `Env` (spec.md §6 "Container
/// environment contract" plus the Redis/model fields the executor itself
/// needs). `WORKSPACE_ID` doubles as the agent id the publisher writes
/// `agent:{id}:*` Redis keys under.
#[derive(Debug, Deserialize)]
struct Env {
  #[serde(default)]
  port: Option<u16>,

  #[serde(default)]
  workspace_id: Option<String>,

  #[serde(default)]
  redis_url: Option<String>,
  #[serde(default)]
  redis_url_file: Option<String>,

  #[serde(default)]
  openrouter_api_key: Option<String>,
  #[serde(default)]
  autocomplete_model: Option<String>,

  #[serde(default)]
  bridge_url: Option<String>,

  #[serde(default)]
  model_provider_base_url: Option<String>,

  #[serde(default)]
  logging_level: Option<String>,
  #[serde(default)]
  logging_stdio: Option<String>,
  #[serde(default)]
  logging_pretty: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub port: u16,
  pub workspace_id: String,
  pub redis_url: String,
  pub openrouter_api_key: Option<String>,
  pub default_model: String,
  pub bridge_url: String,
  pub model_provider_base_url: String,
  pub logging: LogConfig,
}

pub fn executor_config() -> &'static ExecutorConfig {
  static EXECUTOR_CONFIG: OnceLock<ExecutorConfig> = OnceLock::new();
  EXECUTOR_CONFIG.get_or_init(|| load().expect("failed to load executor configuration"))
}

fn load() -> anyhow::Result<ExecutorConfig> {
  let env: Env = envy::from_env().context("failed to parse environment")?;

  let redis_url = read_file_or_value(env.redis_url_file.as_deref(), env.redis_url.as_deref())?
    .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

  Ok(ExecutorConfig {
    port: env.port.unwrap_or(3002),
    workspace_id: env.workspace_id.context("WORKSPACE_ID must be set")?,
    redis_url,
    openrouter_api_key: env.openrouter_api_key,
    default_model: env.autocomplete_model.unwrap_or_else(|| "openai/gpt-4o-mini".to_string()),
    bridge_url: env.bridge_url.unwrap_or_else(|| "http://127.0.0.1:3001".to_string()),
    model_provider_base_url: env
      .model_provider_base_url
      .unwrap_or_else(|| "https://openrouter.ai/api/v1".to_string()),
    logging: LogConfig {
      level: env.logging_level.as_deref().map(parse_log_level).unwrap_or_default(),
      stdio: env.logging_stdio.as_deref().map(parse_stdio_mode).unwrap_or_default(),
      pretty: env.logging_pretty.unwrap_or_default(),
      otlp_endpoint: String::new(),
      opentelemetry_service_name: "Kalpana Executor".to_string(),
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

fn read_file_or_value(file: Option<&str>, value: Option<&str>) -> anyhow::Result<Option<String>> {
  if let Some(path) = file {
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read secret file {path}"))?;
    return Ok(Some(content.trim().to_string()));
  }
  Ok(value.map(str::to_string))
}
