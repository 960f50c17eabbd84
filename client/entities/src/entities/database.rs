use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::resource::ResourceMeta;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DatabaseType {
  Postgres,
  Mysql,
  Mongodb,
  Redis,
  Sqlite,
}

impl DatabaseType {
  /// Internal container port for the protocol's default, used both for
  /// `internal:` connection strings (spec §4.5) and TCP routing labels
  /// (spec §4.2).
  pub fn default_port(&self) -> u16 {
    match self {
      DatabaseType::Postgres => 5432,
      DatabaseType::Mysql => 3306,
      DatabaseType::Mongodb => 27017,
      DatabaseType::Redis => 6379,
      DatabaseType::Sqlite => 0,
    }
  }

  pub fn image(&self, version: &str) -> String {
    match self {
      DatabaseType::Postgres => format!("postgres:{version}"),
      DatabaseType::Mysql => format!("mysql:{version}"),
      DatabaseType::Mongodb => format!("mongo:{version}"),
      DatabaseType::Redis => format!("redis:{version}"),
      DatabaseType::Sqlite => String::new(),
    }
  }

  pub fn has_container(&self) -> bool {
    !matches!(self, DatabaseType::Sqlite)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
  #[serde(flatten)]
  pub meta: ResourceMeta,

  #[serde(rename = "type")]
  pub db_type: DatabaseType,
  pub version: String,
  pub admin_username: String,
  /// Encrypted with `secrets::SecretCipher`.
  pub encrypted_password: String,
  pub database_name: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub external_port: Option<u16>,
}

impl Database {
  pub fn container_name(&self) -> String {
    format!("database-{}", self.meta.id)
  }
}

/// Three connection-string forms (spec §4.5), keyed by where the caller
/// will be connecting from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStrings {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub external: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub internal: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub domain: Option<String>,
}

pub fn connection_strings(
  db: &Database,
  password: &str,
  container_network_name: &str,
  domain_host: Option<&str>,
) -> ConnectionStrings {
  if !db.db_type.has_container() {
    return ConnectionStrings { external: None, internal: None, domain: None };
  }
  let port = db.db_type.default_port();
  let proto = db.db_type.as_ref();
  let external = db.external_port.map(|p| {
    format!(
      "{proto}://{}:{password}@localhost:{p}/{}",
      db.admin_username, db.database_name
    )
  });
  let internal = Some(format!(
    "{proto}://{}:{password}@{container_network_name}:{port}/{}",
    db.admin_username, db.database_name
  ));
  let domain = domain_host.map(|host| {
    format!(
      "{proto}://{}:{password}@{host}:{port}/{}",
      db.admin_username, db.database_name
    )
  });
  ConnectionStrings { external, internal, domain }
}
