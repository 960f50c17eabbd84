use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{I64, MongoId, resource::ResourceMeta};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketFlags {
  #[serde(default)]
  pub versioning: bool,
  #[serde(default)]
  pub encryption: bool,
  #[serde(default)]
  pub public_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
  #[serde(flatten)]
  pub meta: ResourceMeta,

  pub access_key: String,
  /// Encrypted with `secrets::SecretCipher`.
  pub encrypted_secret_key: String,
  pub region: String,

  #[serde(default)]
  pub flags: BucketFlags,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub max_size_bytes: Option<u64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub public_url_slug: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub api_port: Option<u16>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub console_port: Option<u16>,

  #[serde(default)]
  pub object_count: u64,
  #[serde(default)]
  pub total_size_bytes: u64,
}

impl Bucket {
  pub fn container_name(&self) -> String {
    format!("bucket-{}", self.meta.id)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "mongo", derive(mongo_indexed::derive::MongoIndexed))]
// A given key is unique per version within a bucket (S3-style
// versioning, spec §3's BucketObject).
#[cfg_attr(
  feature = "mongo",
  unique_doc_index({ "bucket_id": 1, "key": 1, "version_id": 1 })
)]
pub struct BucketObject {
  #[serde(
    default,
    rename = "_id",
    skip_serializing_if = "String::is_empty",
    with = "bson::serde_helpers::hex_string_as_object_id"
  )]
  pub id: MongoId,
  #[cfg_attr(feature = "mongo", index)]
  pub bucket_id: MongoId,
  pub key: String,
  pub version_id: String,
  pub size: u64,
  pub content_type: String,
  pub etag: String,
  #[serde(default)]
  pub metadata: BTreeMap<String, String>,
  #[serde(default)]
  pub is_public: bool,
  pub created_at: I64,
  pub updated_at: I64,
}

/// Recomputes the bucket-level object count and byte total invariant from
/// spec §3/§8: `objectCount = |objects|`, `totalSizeBytes = Σ size`.
pub fn recompute_totals(objects: &[BucketObject]) -> (u64, u64) {
  let count = objects.len() as u64;
  let total = objects.iter().map(|o| o.size).sum();
  (count, total)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn object(size: u64) -> BucketObject {
    BucketObject {
      id: String::new(),
      bucket_id: "b".into(),
      key: "k".into(),
      version_id: "v1".into(),
      size,
      content_type: "text/plain".into(),
      etag: "etag".into(),
      metadata: Default::default(),
      is_public: false,
      created_at: 0,
      updated_at: 0,
    }
  }

  #[test]
  fn recompute_totals_matches_invariant() {
    let objects = vec![object(17), object(3)];
    assert_eq!(recompute_totals(&objects), (2, 20));
    assert_eq!(recompute_totals(&[]), (0, 0));
  }
}
