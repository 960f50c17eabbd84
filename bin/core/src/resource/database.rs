//! C5's database specialization (spec.md §4.5 "Database specifics"): a
//! thin wrapper over C3 that picks the right image/env, applies the
//! routing precedence from C2, and surfaces typed connection strings.
//! `SQLITE` is the one database type with no container and no port.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use database::StateStore;
use kalpana_client::entities::ResourceStatus;
use kalpana_client::entities::database::{
  ConnectionStrings, Database, DatabaseType, connection_strings,
};

use super::{PortShape, Services, create_and_start_with_port_retry, generate_unique_subdomain};
use crate::docker::containers::{ContainerSpec, PortSpec};
use crate::proxy::{RoutingDecision, TcpProtocol, select_routing};

pub struct DatabaseManager {
  pub services: Arc<Services>,
}

impl DatabaseManager {
  pub fn new(services: Arc<Services>) -> Self {
    Self { services }
  }

  /// Generates a credential pair with a cryptographic RNG when the
  /// caller doesn't supply one (spec.md §4.5: "Credentials are generated
  /// with a cryptographic RNG if the caller does not supply them").
  pub fn generate_credentials() -> (String, String) {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    let password = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    ("kalpana_admin".to_string(), password)
  }

  /// `{dbtype}-{sanitized name}`, truncated and collision-retried per
  /// spec.md §4.5.
  pub async fn suggest_subdomain(&self, db_type: DatabaseType, name: &str) -> anyhow::Result<String> {
    let prefix = db_type.as_ref();
    let databases = self.services.db.clone();
    generate_unique_subdomain(prefix, name, move |candidate| {
      let databases = databases.clone();
      async move {
        Ok(
          databases
            .databases
            .find_first(bson::doc! { "subdomain": &candidate })
            .await?
            .is_some(),
        )
      }
    })
    .await
  }

  pub async fn create(
    &self,
    mut database: Database,
    password: &str,
    platform_base_domain: Option<&str>,
    custom_domain_verified: Option<&str>,
  ) -> anyhow::Result<Database> {
    if !database.db_type.has_container() {
      database.meta.status = ResourceStatus::Running;
      database.meta.touch();
      self.services.db.databases.update(
        &database.meta.id,
        bson::doc! { "status": bson::to_bson(&ResourceStatus::Running)? },
      )
      .await?;
      return Ok(database);
    }

    let image = database.db_type.image(&database.version);
    self.services.docker.pull_image(&image).await?;

    let internal_port = database.db_type.default_port();
    let routing = select_routing(
      &database.meta.id,
      database.meta.subdomain.as_deref(),
      custom_domain_verified,
      platform_base_domain,
    );

    let mut labels = HashMap::new();
    labels.insert("kalpana.managed".to_string(), "true".to_string());
    labels.insert("kalpana.database.id".to_string(), database.meta.id.clone());

    let container_name = database.container_name();
    let env = vec![
      format!("POSTGRES_USER={}", database.admin_username),
      format!("POSTGRES_PASSWORD={password}"),
      format!("POSTGRES_DB={}", database.database_name),
      format!("MYSQL_ROOT_PASSWORD={password}"),
      format!("MYSQL_USER={}", database.admin_username),
      format!("MYSQL_PASSWORD={password}"),
      format!("MYSQL_DATABASE={}", database.database_name),
      format!("MONGO_INITDB_ROOT_USERNAME={}", database.admin_username),
      format!("MONGO_INITDB_ROOT_PASSWORD={password}"),
      format!("MONGO_INITDB_DATABASE={}", database.database_name),
    ];

    let (container_id, external_port) = match &routing {
      RoutingDecision::HostPort => {
        let (container_id, ports) = create_and_start_with_port_retry(
          &self.services.docker,
          &self.services.ports,
          PortShape::Single,
          |ports| ContainerSpec {
            name: container_name.clone(),
            image: image.clone(),
            env: env.clone(),
            ports: vec![PortSpec { container_port: internal_port, host_port: Some(ports[0]) }],
            labels: labels.clone(),
            restart_unless_stopped: true,
            ..Default::default()
          },
        )
        .await?;
        (container_id, Some(ports[0]))
      }
      RoutingDecision::Domain { subdomain, domain } | RoutingDecision::BaseDomain { subdomain, domain } => {
        let protocol = tcp_protocol(database.db_type);
        let mut routed_labels = self.services.proxy.labels_for_tcp(
          &database.meta.id,
          subdomain,
          domain,
          protocol,
          internal_port,
        );
        routed_labels.extend(labels.clone());
        self.services.docker.remove_stale_container(&container_name).await?;
        let container_id = self
          .services
          .docker
          .create_container(&ContainerSpec {
            name: container_name.clone(),
            image: image.clone(),
            env: env.clone(),
            labels: routed_labels,
            network: Some(self.services.proxy.network.clone()),
            restart_unless_stopped: true,
            ..Default::default()
          })
          .await?;
        self.services.docker.start_container(&container_name).await?;
        self.services.proxy.attach(&container_id).await?;
        (container_id, None)
      }
    };

    database.meta.container_id = Some(container_id);
    database.meta.status = ResourceStatus::Running;
    database.external_port = external_port;
    database.host = Some(container_name.clone());
    database.meta.touch();

    self.services.db.databases.update(
      &database.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Running)?,
        "container_id": &database.meta.container_id,
        "external_port": database.external_port.map(|p| p as i32),
        "host": &database.host,
        "updated_at": database.meta.updated_at,
      },
    )
    .await?;

    Ok(database)
  }

  pub fn connection_strings(
    &self,
    database: &Database,
    password: &str,
    domain_host: Option<&str>,
  ) -> ConnectionStrings {
    connection_strings(database, password, &database.container_name(), domain_host)
  }

  pub async fn stop(&self, database: &Database) -> anyhow::Result<()> {
    if !database.db_type.has_container() {
      return Ok(());
    }
    self.services.db.databases.update(
      &database.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Stopping)? },
    )
    .await?;
    self.services.docker.stop_container(&database.container_name()).await?;
    if let Some(port) = database.external_port {
      self.services.ports.release_port(port);
    }
    self.services.db.databases.update(
      &database.meta.id,
      bson::doc! {
        "status": bson::to_bson(&ResourceStatus::Stopped)?,
        "external_port": bson::Bson::Null,
      },
    )
    .await?;
    Ok(())
  }

  pub async fn destroy(&self, database: &Database, remove_volume: bool) -> anyhow::Result<()> {
    if database.db_type.has_container() {
      let name = database.container_name();
      self.services.docker.stop_container(&name).await.ok();
      self.services.docker.force_remove_container(&name).await?;
      if remove_volume {
        if let Some(volume) = &database.meta.volume_id {
          self.services.docker.remove_volume(volume).await?;
        }
      }
      if let Some(port) = database.external_port {
        self.services.ports.release_port(port);
      }
    }
    self.services.db.databases.update(
      &database.meta.id,
      bson::doc! { "status": bson::to_bson(&ResourceStatus::Deleted)? },
    )
    .await?;
    Ok(())
  }
}

fn tcp_protocol(db_type: DatabaseType) -> TcpProtocol {
  match db_type {
    DatabaseType::Postgres => TcpProtocol::Postgres,
    DatabaseType::Mysql => TcpProtocol::Mysql,
    DatabaseType::Mongodb => TcpProtocol::Mongodb,
    DatabaseType::Redis => TcpProtocol::Redis,
    // Redis has no auth env vars above and Sqlite never reaches this
    // branch (`has_container()` is false); Redis containers authenticate
    // via `requirepass` passed as a command argument elsewhere if needed.
    DatabaseType::Sqlite => TcpProtocol::Redis,
  }
}
