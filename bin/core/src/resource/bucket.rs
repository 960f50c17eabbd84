//! C5's bucket specialization (spec.md §4.5 "Bucket specifics"): a
//! MinIO-backed S3-compatible server per bucket, health-polled before
//! promotion to RUNNING, with object operations proxied through
//! `aws-sdk-s3` and the §3/§8 object-count/byte-total invariant
//! recomputed after every mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use database::StateStore;
use kalpana_client::entities::ResourceStatus;
use kalpana_client::entities::bucket::{Bucket, BucketObject, recompute_totals};

use super::{PortShape, Services, create_and_start_with_port_retry, generate_unique_subdomain};
use crate::docker::containers::{ContainerSpec, PortSpec, VolumeMount};

pub const DEFAULT_API_PORT: u16 = 9000;
pub const DEFAULT_CONSOLE_PORT: u16 = 9001;
const HEALTH_POLL_ATTEMPTS: u32 = 30;
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BucketManager {
  pub services: Arc<Services>,
}

impl BucketManager {
  pub fn new(services: Arc<Services>) -> Self {
    Self { services }
  }

  /// Steps for provisioning a bucket: allocate the api/console port pair
  /// (Open Question #2: reuses the workspace pair allocator rather than
  /// a dedicated bucket API), start MinIO, and poll `/health/live` up to
  /// 30 times at 1s before considering the bucket RUNNING (spec.md §4.5).
  pub async fn create(&self, mut bucket: Bucket, secret_key: &str) -> anyhow::Result<Bucket> {
    let image = "minio/minio:latest";
    self.services.docker.pull_image(image).await?;

    let volume = format!("kalpana-bucket-{}", bucket.meta.id);
    let mut volume_labels = HashMap::new();
    volume_labels.insert("kalpana.bucket.id".to_string(), bucket.meta.id.clone());
    self.services.docker.ensure_volume(&volume, volume_labels).await?;

    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("kalpana.bucket.id".to_string(), bucket.meta.id.clone());

    let container_name = bucket.container_name();
    let access_key = bucket.access_key.clone();
    let secret_key_owned = secret_key.to_string();

    let (container_id, ports) = create_and_start_with_port_retry(
      &self.services.docker,
      &self.services.ports,
      PortShape::Pair,
      |ports| ContainerSpec {
        name: container_name.clone(),
        image: image.to_string(),
        command: Some(vec![
          "server".to_string(),
          "/data".to_string(),
          "--console-address".to_string(),
          format!(":{}", DEFAULT_CONSOLE_PORT),
        ]),
        env: vec![
          format!("MINIO_ROOT_USER={access_key}"),
          format!("MINIO_ROOT_PASSWORD={secret_key_owned}"),
        ],
        ports: vec![
          PortSpec { container_port: DEFAULT_API_PORT, host_port: Some(ports[0]) },
          PortSpec { container_port: DEFAULT_CONSOLE_PORT, host_port: Some(ports[1]) },
        ],
        volumes: vec![VolumeMount::rw(volume.clone(), "/data")],
        labels: labels.clone(),
        restart_unless_stopped: true,
        ..Default::default()
      },
    )
    .await?;

    bucket.meta.container_id = Some(container_id);
    bucket.meta.volume_id = Some(volume);
    bucket.api_port = Some(ports[0]);
    bucket.console_port = Some(ports[1]);

    let healthy = self.poll_health(ports[0]).await;
    bucket.meta.status = if healthy { ResourceStatus::Running } else { ResourceStatus::Error };
    bucket.meta.touch();

    self.services.db.buckets.update(
      &bucket.meta.id,
      bson::doc! {
        "status": bson::to_bson(&bucket.meta.status)?,
        "container_id": &bucket.meta.container_id,
        "volume_id": &bucket.meta.volume_id,
        "api_port": ports[0] as i32,
        "console_port": ports[1] as i32,
        "updated_at": bucket.meta.updated_at,
      },
    )
    .await?;

    if healthy {
      self.init_bucket(&bucket, secret_key).await?;
    }

    Ok(bucket)
  }

  async fn poll_health(&self, api_port: u16) -> bool {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{api_port}/health/live");
    for _ in 0..HEALTH_POLL_ATTEMPTS {
      if let Ok(resp) = client.get(&url).send().await {
        if resp.status().is_success() {
          return true;
        }
      }
      tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
    false
  }

  /// Creates the bucket's single logical bucket inside the freshly
  /// started S3-compatible server (spec.md §4.5 "invoke the image's own
  /// post-start initialization").
  async fn init_bucket(&self, bucket: &Bucket, secret_key: &str) -> anyhow::Result<()> {
    let client = self.s3_client(bucket, secret_key);
    let exists = client.head_bucket().bucket(bucket_name(bucket)).send().await.is_ok();
    if !exists {
      client.create_bucket().bucket(bucket_name(bucket)).send().await?;
    }
    if bucket.flags.versioning {
      use aws_sdk_s3::types::{BucketVersioningStatus, VersioningConfiguration};
      client
        .put_bucket_versioning()
        .bucket(bucket_name(bucket))
        .versioning_configuration(
          VersioningConfiguration::builder().status(BucketVersioningStatus::Enabled).build(),
        )
        .send()
        .await?;
    }
    Ok(())
  }

  fn s3_client(&self, bucket: &Bucket, secret_key: &str) -> S3Client {
    let api_port = bucket.api_port.unwrap_or(DEFAULT_API_PORT);
    let credentials = Credentials::new(&bucket.access_key, secret_key, None, None, "kalpana");
    let config = aws_sdk_s3::Config::builder()
      .region(Region::new(bucket.region.clone()))
      .endpoint_url(format!("http://127.0.0.1:{api_port}"))
      .credentials_provider(credentials)
      .force_path_style(true)
      .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
      .build();
    S3Client::from_conf(config)
  }

  /// `{prefix}-{sanitized name}` where `prefix` is `storage` (spec.md
  /// §4.5).
  pub async fn suggest_subdomain(&self, name: &str) -> anyhow::Result<String> {
    let buckets = self.services.db.clone();
    generate_unique_subdomain("storage", name, move |candidate| {
      let buckets = buckets.clone();
      async move {
        Ok(
          buckets
            .buckets
            .find_first(bson::doc! { "subdomain": &candidate })
            .await?
            .is_some(),
        )
      }
    })
    .await
  }

  /// Globally-unique `publicUrl` slug for a `publicAccess=true` bucket
  /// (spec.md §3).
  pub async fn assign_public_url_slug(&self, name: &str) -> anyhow::Result<String> {
    let buckets = self.services.db.clone();
    generate_unique_subdomain("public", name, move |candidate| {
      let buckets = buckets.clone();
      async move {
        Ok(
          buckets
            .buckets
            .find_first(bson::doc! { "public_url_slug": &candidate })
            .await?
            .is_some(),
        )
      }
    })
    .await
  }

  pub async fn upload_object(
    &self,
    bucket: &Bucket,
    secret_key: &str,
    key: &str,
    content_type: &str,
    body: Bytes,
  ) -> anyhow::Result<BucketObject> {
    let size = body.len() as u64;
    let client = self.s3_client(bucket, secret_key);
    let output = client
      .put_object()
      .bucket(bucket_name(bucket))
      .key(key)
      .content_type(content_type)
      .body(ByteStream::from(body))
      .send()
      .await?;

    let version_id = output.version_id.clone().unwrap_or_else(|| "null".to_string());
    let etag = output.e_tag.clone().unwrap_or_default();
    let now = kalpana_client::entities::kalpana_timestamp();

    let existing = self.services.db.bucket_objects.find_first(
      bson::doc! { "bucket_id": &bucket.meta.id, "key": key, "version_id": &version_id },
    )
    .await?;

    let object = if let Some(mut existing) = existing {
      existing.size = size;
      existing.content_type = content_type.to_string();
      existing.etag = etag.clone();
      existing.updated_at = now;
      self.services.db.bucket_objects.update(
        &existing.id,
        bson::doc! {
          "size": size as i64,
          "content_type": content_type,
          "etag": &etag,
          "updated_at": now,
        },
      )
      .await?;
      existing
    } else {
      self.services.db.bucket_objects.create(BucketObject {
        id: String::new(),
        bucket_id: bucket.meta.id.clone(),
        key: key.to_string(),
        version_id,
        size,
        content_type: content_type.to_string(),
        etag,
        metadata: Default::default(),
        is_public: bucket.flags.public_access,
        created_at: now,
        updated_at: now,
      })
      .await?
    };

    self.recompute_invariant(bucket).await?;
    Ok(object)
  }

  pub async fn download_object(
    &self,
    bucket: &Bucket,
    secret_key: &str,
    key: &str,
  ) -> anyhow::Result<Bytes> {
    let client = self.s3_client(bucket, secret_key);
    let output = client.get_object().bucket(bucket_name(bucket)).key(key).send().await?;
    Ok(output.body.collect().await?.into_bytes())
  }

  pub async fn head_object(
    &self,
    bucket: &Bucket,
    secret_key: &str,
    key: &str,
  ) -> anyhow::Result<Option<BucketObject>> {
    self.services.db.bucket_objects.find_first(
      bson::doc! { "bucket_id": &bucket.meta.id, "key": key },
    )
    .await
    .map_err(Into::into)
    .and_then(|existing| {
      let _ = secret_key;
      Ok(existing)
    })
  }

  pub async fn delete_object(
    &self,
    bucket: &Bucket,
    secret_key: &str,
    key: &str,
  ) -> anyhow::Result<()> {
    let client = self.s3_client(bucket, secret_key);
    client.delete_object().bucket(bucket_name(bucket)).key(key).send().await?;

    if let Some(existing) = self.services.db.bucket_objects.find_first(
      bson::doc! { "bucket_id": &bucket.meta.id, "key": key },
    )
    .await?
    {
      self.services.db.bucket_objects.delete(&existing.id).await?;
    }

    self.recompute_invariant(bucket).await?;
    Ok(())
  }

  pub async fn list_objects(
    &self,
    bucket: &Bucket,
    prefix: Option<&str>,
  ) -> anyhow::Result<Vec<BucketObject>> {
    let mut filter = bson::doc! { "bucket_id": &bucket.meta.id };
    if let Some(prefix) = prefix {
      filter.insert("key", bson::doc! { "$regex": format!("^{}", regex::escape(prefix)) });
    }
    self.services.db.bucket_objects.list_by(filter).await
  }

  /// A time-limited presigned GET URL for a key, for direct client
  /// download without proxying bytes through the control plane.
  pub async fn presigned_download_url(
    &self,
    bucket: &Bucket,
    secret_key: &str,
    key: &str,
    expires_in: Duration,
  ) -> anyhow::Result<String> {
    use aws_sdk_s3::presigning::PresigningConfig;
    let client = self.s3_client(bucket, secret_key);
    let presigned = client
      .get_object()
      .bucket(bucket_name(bucket))
      .key(key)
      .presigned(PresigningConfig::expires_in(expires_in)?)
      .await?;
    Ok(presigned.uri().to_string())
  }

  /// Recomputes `objectCount`/`totalSizeBytes` from the current set of
  /// `BucketObject` rows so the invariant from spec.md §3/§8 holds after
  /// every mutation.
  async fn recompute_invariant(&self, bucket: &Bucket) -> anyhow::Result<()> {
    let objects = self.services.db.bucket_objects.list_by(
      bson::doc! { "bucket_id": &bucket.meta.id },
    )
    .await?;
    let (count, total) = recompute_totals(&objects);
    self.services.db.buckets.update(
      &bucket.meta.id,
      bson::doc! { "object_count": count as i64, "total_size_bytes": total as i64 },
    )
    .await?;
    Ok(())
  }

  pub async fn stop(&self, bucket: &Bucket) -> anyhow::Result<()> {
    self.services.docker.stop_container(&bucket.container_name()).await?;
    if let Some(port) = bucket.api_port {
      self.services.ports.release_port(port);
    }
    if let Some(port) = bucket.console_port {
      self.services.ports.release_port(port);
    }
    self.services.db.buckets.update(
      &bucket.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Stopped)? },
    )
    .await?;
    Ok(())
  }

  pub async fn destroy(&self, bucket: &Bucket, remove_volume: bool) -> anyhow::Result<()> {
    let name = bucket.container_name();
    self.services.docker.stop_container(&name).await.ok();
    self.services.docker.force_remove_container(&name).await?;
    if remove_volume {
      if let Some(volume) = &bucket.meta.volume_id {
        self.services.docker.remove_volume(volume).await?;
      }
    }
    if let Some(port) = bucket.api_port {
      self.services.ports.release_port(port);
    }
    if let Some(port) = bucket.console_port {
      self.services.ports.release_port(port);
    }
    self.services.db.buckets.update(
      &bucket.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Deleted)? },
    )
    .await?;
    Ok(())
  }
}

/// The bucket's single logical S3 bucket name inside the server - the
/// resource id itself, since one `Bucket` resource owns exactly one
/// logical bucket (spec.md glossary).
fn bucket_name(bucket: &Bucket) -> String {
  format!("kalpana-{}", bucket.meta.id)
}
