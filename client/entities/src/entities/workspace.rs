use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resource::ResourceMeta;

/// Where a workspace's `/workspace` volume is seeded from at first boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneSource {
  #[serde(default)]
  pub repo: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
  #[serde(flatten)]
  pub meta: ResourceMeta,

  /// Host port bound to the container's editor port (8080). Invariant
  /// (spec §3): non-null iff status is STARTING or RUNNING.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub vscode_port: Option<u16>,

  /// Host port bound to the container's bridge port (3001).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub agent_port: Option<u16>,

  #[serde(default)]
  pub clone_source: CloneSource,

  #[serde(default)]
  pub preset: String,

  /// Encrypted with `secrets::SecretCipher`; decrypted only when
  /// assembling the container's environment list.
  #[serde(default)]
  pub encrypted_env: String,
}

impl Workspace {
  pub fn ports(&self) -> Option<(u16, u16)> {
    match (self.vscode_port, self.agent_port) {
      (Some(a), Some(b)) => Some((a, b)),
      _ => None,
    }
  }

  pub fn container_name(&self) -> String {
    format!("workspace-{}", self.meta.id)
  }

  pub fn persistent_volume_name(&self) -> String {
    format!("kalpana-workspace-{}", self.meta.id)
  }
}

/// Env vars read by the in-container startup (spec §6 "Container
/// environment contract").
pub fn container_env(
  workspace: &Workspace,
  decrypted_secrets: &BTreeMap<String, String>,
  git_user_name: &str,
  git_user_email: &str,
) -> BTreeMap<String, String> {
  let mut env = BTreeMap::new();
  env.insert("WORKSPACE_ID".into(), workspace.meta.id.clone());
  env.insert("GITHUB_REPO".into(), workspace.clone_source.repo.clone());
  if let Some(token) = &workspace.clone_source.token {
    env.insert("GITHUB_TOKEN".into(), token.clone());
  }
  env.insert("PRESET".into(), workspace.preset.clone());
  env.insert("GIT_USER_NAME".into(), git_user_name.into());
  env.insert("GIT_USER_EMAIL".into(), git_user_email.into());
  env.extend(decrypted_secrets.clone());
  env
}

pub const EDITOR_PORT: u16 = 8080;
pub const BRIDGE_PORT: u16 = 3001;

/// Sentinels the readiness watcher scans for (spec §4.3).
pub const BRIDGE_READY_SENTINELS: &[&str] = &[
  "Agent bridge started",
  "Agent bridge running",
  "WebSocket server available",
];
pub const EDITOR_READY_SENTINEL: &str = "HTTP server listening";
