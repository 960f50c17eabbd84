use serde::{Deserialize, Serialize};

use super::{I64, MongoId, ResourceStatus};

/// Fields common to every managed resource (spec §3's abstract `Resource`
/// parent). The teacher's `Resource<Config, Info>` is generic over a
/// per-kind config/info pair with tags, templates, and permission levels;
/// none of that applies here (single resource family per spec, no
/// multi-tenant permission model), so this design flattens the shared
/// fields directly into each concrete entity via `#[serde(flatten)]`
/// rather than carrying a generic wrapper type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  pub id: MongoId,

  pub user_id: MongoId,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub team_id: Option<MongoId>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub domain_id: Option<MongoId>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub subdomain: Option<String>,

  pub name: String,

  #[serde(default)]
  pub status: ResourceStatus,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub container_id: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub volume_id: Option<String>,

  #[serde(default)]
  pub created_at: I64,

  #[serde(default)]
  pub updated_at: I64,
}

impl ResourceMeta {
  pub fn new(user_id: impl Into<MongoId>, name: impl Into<String>) -> Self {
    let now = super::kalpana_timestamp();
    Self {
      id: String::new(),
      user_id: user_id.into(),
      team_id: None,
      domain_id: None,
      subdomain: None,
      name: name.into(),
      status: ResourceStatus::Creating,
      container_id: None,
      volume_id: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn touch(&mut self) {
    self.updated_at = super::kalpana_timestamp();
  }
}
