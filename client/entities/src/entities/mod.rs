use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Milliseconds-since-epoch timestamp, used for every `created_at` /
/// `updated_at` / event timestamp in the data model.
pub type I64 = i64;

/// MongoDB ObjectId, carried as a hex string on the wire and re-hydrated
/// with `bson::serde_helpers::hex_string_as_object_id` at the database
/// boundary (see `database::Client`).
pub type MongoId = String;

pub mod agent;
pub mod bucket;
pub mod database;
pub mod deployment;
pub mod domain;
pub mod log;
pub mod logger;
pub mod resource;
pub mod workspace;

pub fn kalpana_timestamp() -> I64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("system clock is before the unix epoch")
    .as_millis() as I64
}

/// Lifecycle status shared by every managed resource (spec §3).
///
/// Workspace / Database / Bucket / Deployment all reuse this enum rather
/// than defining their own parallel status types, since spec §3 defines
/// exactly one status lattice for the abstract `Resource` parent.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceStatus {
  #[default]
  Creating,
  Starting,
  Running,
  Stopping,
  Stopped,
  Error,
  Deleted,
}

impl ResourceStatus {
  pub fn is_live(&self) -> bool {
    matches!(self, ResourceStatus::Starting | ResourceStatus::Running)
  }
}

/// `^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$`, truncated to 63 characters -
/// spec §4.5 "Subdomain validation".
pub fn is_valid_subdomain(subdomain: &str) -> bool {
  if subdomain.is_empty() || subdomain.len() > 63 {
    return false;
  }
  let bytes = subdomain.as_bytes();
  let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
  if !is_alnum(bytes[0]) {
    return false;
  }
  if bytes.len() == 1 {
    return true;
  }
  if !is_alnum(*bytes.last().unwrap()) {
    return false;
  }
  bytes[1..bytes.len() - 1]
    .iter()
    .all(|&b| is_alnum(b) || b == b'-')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subdomain_validation() {
    assert!(is_valid_subdomain("a"));
    assert!(is_valid_subdomain("my-app-1"));
    assert!(!is_valid_subdomain(""));
    assert!(!is_valid_subdomain("-leading-dash"));
    assert!(!is_valid_subdomain("trailing-dash-"));
    assert!(!is_valid_subdomain("Has_Upper"));
    assert!(!is_valid_subdomain(&"a".repeat(64)));
    assert!(is_valid_subdomain(&"a".repeat(63)));
  }

  #[test]
  fn status_is_live() {
    assert!(ResourceStatus::Running.is_live());
    assert!(ResourceStatus::Starting.is_live());
    assert!(!ResourceStatus::Stopped.is_live());
  }
}
