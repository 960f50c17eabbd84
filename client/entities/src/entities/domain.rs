use serde::{Deserialize, Serialize};

use super::MongoId;

/// Referenced, not managed, by the core (spec §3): a custom domain a user
/// has proven ownership of out-of-band. `verified=false` is a hard
/// rejection when a resource tries to link against it (spec §4.2 "Domain
/// selection precedence").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "mongo", derive(mongo_indexed::derive::MongoIndexed))]
pub struct Domain {
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  pub id: MongoId,
  #[cfg_attr(feature = "mongo", index)]
  pub user_id: MongoId,
  #[cfg_attr(feature = "mongo", unique_index)]
  pub name: String,
  #[serde(default)]
  pub verified: bool,
  pub verification_token: String,
}
