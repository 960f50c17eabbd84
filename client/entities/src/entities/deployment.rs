use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use super::{I64, MongoId, resource::ResourceMeta};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GithubSource {
  pub repo: String,
  #[serde(default = "default_branch")]
  pub branch: String,
  #[serde(default)]
  pub root_directory: String,
}

fn default_branch() -> String {
  "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
  #[serde(flatten)]
  pub meta: ResourceMeta,

  #[serde(default)]
  pub install_command: String,
  #[serde(default)]
  pub build_command: String,
  pub start_command: String,
  #[serde(default)]
  pub working_dir: String,
  pub internal_port: u16,

  /// `secrets::SecretCipher`-encrypted `BTreeMap<String, String>`.
  #[serde(default)]
  pub encrypted_env: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub github: Option<GithubSource>,

  #[serde(default)]
  pub auto_rebuild: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub webhook_secret: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub exposed_port: Option<u16>,

  /// Guards spec §3's "at most one BUILDING build per deployment"
  /// invariant: set by the state store's conditional update when a build
  /// starts, cleared when it reaches a terminal status (Open Question #4
  /// in `DESIGN.md`).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_build_id: Option<MongoId>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_deployed_at: Option<I64>,

  /// Whether this deployment builds inside an already-running workspace
  /// container (spec §4.4 "workspace-based branch") rather than an
  /// ephemeral standalone build container. When set, `github` is ignored
  /// for sourcing and the build command runs via `exec` against this
  /// workspace id instead.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workspace_id: Option<MongoId>,
}

impl Deployment {
  pub fn is_workspace_based(&self) -> bool {
    self.workspace_id.is_some()
  }

  pub fn container_name(&self) -> String {
    format!("deploy-{}", self.meta.id)
  }

  pub fn build_container_name(&self) -> String {
    format!("build-{}", self.meta.id)
  }

  pub fn image_tag(&self) -> String {
    format!("deploy-{}:latest", self.meta.id)
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildStatus {
  Building,
  Success,
  Failed,
  Cancelled,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BuildTrigger {
  Manual,
  Webhook,
  AutoRebuild,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "mongo", derive(mongo_indexed::derive::MongoIndexed))]
pub struct Build {
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  pub id: MongoId,
  #[cfg_attr(feature = "mongo", index)]
  pub deployment_id: MongoId,
  pub status: BuildStatus,
  pub trigger: BuildTrigger,
  pub started_at: I64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<I64>,
  #[serde(default)]
  pub logs: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_message: Option<String>,
}

impl Build {
  pub fn new(deployment_id: impl Into<MongoId>, trigger: BuildTrigger) -> Self {
    Build {
      id: String::new(),
      deployment_id: deployment_id.into(),
      status: BuildStatus::Building,
      trigger,
      started_at: super::kalpana_timestamp(),
      completed_at: None,
      logs: String::new(),
      error_message: None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    !matches!(self.status, BuildStatus::Building)
  }
}
