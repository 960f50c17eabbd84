//! C8: the persistent state store interface (spec §4.8). A small
//! `StateStore<T>` contract (`create`, `find_by_id`, `find_first`,
//! `update`, `delete`, `list_by`) sits in front of the entity families from
//! spec §3; the only implementation wraps MongoDB via `mungos`/
//! `mongo_indexed`, the same stack the teacher's `lib/database` uses for
//! its own resource collections. The core never assumes a specific query
//! language - callers build a `bson::Document` filter/patch and the trait
//! takes it from there.

use std::str::FromStr;

use anyhow::Context;
use bson::{Document, doc, oid::ObjectId};
use futures_util::TryStreamExt;
use kalpana_client::entities::{
  agent::Agent,
  bucket::{Bucket, BucketObject},
  database::Database as DatabaseResource,
  deployment::{Build, Deployment},
  domain::Domain,
  workspace::Workspace,
};
use mongo_indexed::create_index;
use mungos::mongodb::{Collection, Database};

pub use mongo_indexed;
pub use mungos;

/// Connection settings for the backing Mongo deployment. Mirrors the
/// teacher's `DatabaseConfig` shape (`uri` takes precedence over
/// `address`/`username`/`password` when set).
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
  pub uri: String,
  pub address: String,
  pub username: String,
  pub password: String,
  pub app_name: String,
  pub db_name: String,
}

/// Implemented for every entity in spec §3 so `MongoStore<T>` can manage
/// the `_id` field without each call site re-deriving hex-string/ObjectId
/// plumbing.
pub trait HasId {
  fn id(&self) -> &str;
  fn set_id(&mut self, id: String);
}

macro_rules! impl_has_id {
  ($ty:ty, $($path:tt)+) => {
    impl HasId for $ty {
      fn id(&self) -> &str {
        &self.$($path)+.id
      }
      fn set_id(&mut self, id: String) {
        self.$($path)+.id = id;
      }
    }
  };
}

impl_has_id!(Workspace, meta);
impl_has_id!(Deployment, meta);
impl_has_id!(DatabaseResource, meta);
impl_has_id!(Bucket, meta);
impl_has_id!(Agent, meta);

impl HasId for Build {
  fn id(&self) -> &str {
    &self.id
  }
  fn set_id(&mut self, id: String) {
    self.id = id;
  }
}

impl HasId for BucketObject {
  fn id(&self) -> &str {
    &self.id
  }
  fn set_id(&mut self, id: String) {
    self.id = id;
  }
}

impl HasId for Domain {
  fn id(&self) -> &str {
    &self.id
  }
  fn set_id(&mut self, id: String) {
    self.id = id;
  }
}

/// C8's abstract contract (spec §4.8), parameterized over an entity type.
pub trait StateStore<T> {
  async fn create(&self, item: T) -> anyhow::Result<T>;
  async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<T>>;
  async fn find_first(&self, filter: Document) -> anyhow::Result<Option<T>>;
  async fn update(&self, id: &str, patch: Document) -> anyhow::Result<()>;
  async fn delete(&self, id: &str) -> anyhow::Result<()>;
  async fn list_by(&self, filter: Document) -> anyhow::Result<Vec<T>>;
}

/// The sole `StateStore` implementation: a thin wrapper over one Mongo
/// collection.
pub struct MongoStore<T> {
  pub collection: Collection<T>,
}

impl<T> StateStore<T> for MongoStore<T>
where
  T: HasId
    + serde::Serialize
    + serde::de::DeserializeOwned
    + Unpin
    + Send
    + Sync,
{
  async fn create(&self, mut item: T) -> anyhow::Result<T> {
    let res = self
      .collection
      .insert_one(&item)
      .await
      .context("failed to insert document")?;
    let id = res
      .inserted_id
      .as_object_id()
      .context("inserted_id was not an ObjectId")?;
    item.set_id(id.to_hex());
    Ok(item)
  }

  async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<T>> {
    let oid = ObjectId::from_str(id).context("id is not a valid ObjectId")?;
    self
      .collection
      .find_one(doc! { "_id": oid })
      .await
      .context("failed to find document by id")
  }

  async fn find_first(&self, filter: Document) -> anyhow::Result<Option<T>> {
    self
      .collection
      .find_one(filter)
      .await
      .context("failed to find document")
  }

  async fn update(&self, id: &str, patch: Document) -> anyhow::Result<()> {
    let oid = ObjectId::from_str(id).context("id is not a valid ObjectId")?;
    self
      .collection
      .update_one(doc! { "_id": oid }, doc! { "$set": patch })
      .await
      .context("failed to update document")?;
    Ok(())
  }

  async fn delete(&self, id: &str) -> anyhow::Result<()> {
    let oid = ObjectId::from_str(id).context("id is not a valid ObjectId")?;
    self
      .collection
      .delete_one(doc! { "_id": oid })
      .await
      .context("failed to delete document")?;
    Ok(())
  }

  async fn list_by(&self, filter: Document) -> anyhow::Result<Vec<T>> {
    self
      .collection
      .find(filter)
      .await
      .context("failed to list documents")?
      .try_collect()
      .await
      .context("failed to collect documents")
  }
}

/// Every collection the control plane reads or writes, plus the raw
/// `Database` handle for one-off aggregation queries.
pub struct Client {
  pub workspaces: MongoStore<Workspace>,
  pub deployments: MongoStore<Deployment>,
  pub builds: MongoStore<Build>,
  pub databases: MongoStore<DatabaseResource>,
  pub buckets: MongoStore<Bucket>,
  pub bucket_objects: MongoStore<BucketObject>,
  pub agents: MongoStore<Agent>,
  pub domains: MongoStore<Domain>,
  pub db: Database,
}

impl Client {
  pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Client> {
    let db = init(config).await?;
    Self::from_database(db).await
  }

  pub async fn from_database(db: Database) -> anyhow::Result<Client> {
    // The five resource kinds all flatten `ResourceMeta` (spec §3) rather
    // than deriving `MongoIndexed` directly - `mongo_indexed`'s derive
    // macro reads attributes off the struct it's applied to, and can't see
    // through a `#[serde(flatten)]`'d field. So, same as the teacher's
    // generic `Resource<Config, Info>` collections, their indexes are
    // built by hand instead of via derive.
    let workspaces: Collection<Workspace> =
      resource_collection(&db, "Workspace").await?;
    let deployments: Collection<Deployment> =
      resource_collection(&db, "Deployment").await?;
    let databases: Collection<DatabaseResource> =
      resource_collection(&db, "Database").await?;
    let buckets: Collection<Bucket> = resource_collection(&db, "Bucket").await?;
    let agents: Collection<Agent> = resource_collection(&db, "Agent").await?;

    // Build, BucketObject and Domain are flat structs, so their indexes
    // come from the `MongoIndexed` derive's own attributes instead.
    let builds: Collection<Build> = mongo_indexed::collection(&db, true).await?;
    let bucket_objects: Collection<BucketObject> =
      mongo_indexed::collection(&db, true).await?;
    let domains: Collection<Domain> = mongo_indexed::collection(&db, true).await?;

    // `public_url_slug` is optional (most buckets have no public URL), so
    // a plain unique index would reject the second bucket with no slug.
    // A partial filter expression scopes uniqueness to documents that
    // actually set it, same trick as the subdomain index below.
    create_partial_unique_index(
      &db,
      "Bucket",
      doc! { "public_url_slug": 1 },
      doc! { "public_url_slug": { "$exists": true } },
    )
    .await?;

    Ok(Client {
      workspaces: MongoStore { collection: workspaces },
      deployments: MongoStore { collection: deployments },
      builds: MongoStore { collection: builds },
      databases: MongoStore { collection: databases },
      buckets: MongoStore { collection: buckets },
      bucket_objects: MongoStore { collection: bucket_objects },
      agents: MongoStore { collection: agents },
      domains: MongoStore { collection: domains },
      db,
    })
  }
}

/// Mirrors the teacher's `resource_collection` helper: sets up the
/// indexes shared by every `ResourceMeta`-based collection, then hands
/// back a typed handle to it.
async fn resource_collection<T: Send + Sync>(
  db: &Database,
  collection_name: &str,
) -> anyhow::Result<Collection<T>> {
  let coll = db.collection::<T>(collection_name);

  // (subdomain, domainId) unique when both are set (spec §3, §8
  // invariant 5).
  create_partial_unique_index(
    db,
    collection_name,
    doc! { "subdomain": 1, "domain_id": 1 },
    doc! { "subdomain": { "$exists": true }, "domain_id": { "$exists": true } },
  )
  .await?;

  create_index(&coll, "user_id").await?;

  Ok(coll)
}

async fn create_partial_unique_index(
  db: &Database,
  collection_name: &str,
  keys: Document,
  partial_filter: Document,
) -> anyhow::Result<()> {
  use mungos::mongodb::{IndexModel, options::IndexOptions};

  let index = IndexModel::builder()
    .keys(keys)
    .options(IndexOptions::builder().unique(true).partial_filter_expression(partial_filter).build())
    .build();

  db.collection::<Document>(collection_name)
    .create_index(index)
    .await
    .with_context(|| format!("failed to create index on {collection_name}"))?;
  Ok(())
}

/// Initializes the unindexed database handle, following the teacher's
/// `uri` vs `address`+`username`+`password` precedence.
pub async fn init(
  DatabaseConfig { uri, address, username, password, app_name, db_name }: &DatabaseConfig,
) -> anyhow::Result<Database> {
  use mungos::init::MongoBuilder;

  let mut client = MongoBuilder::default().app_name(app_name);

  match (!uri.is_empty(), !address.is_empty(), !username.is_empty(), !password.is_empty()) {
    (true, ..) => {
      client = client.uri(uri);
    }
    (_, true, true, true) => {
      client = client.address(address).username(username).password(password);
    }
    (_, true, ..) => {
      client = client.address(address);
    }
    _ => {
      anyhow::bail!(
        "database config is incomplete: pass either `uri`, or `address` + `username` + `password`"
      );
    }
  }

  let client = client
    .build()
    .await
    .context("failed to initialize database connection")?;

  Ok(client.database(db_name))
}
