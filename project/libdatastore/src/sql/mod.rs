//! SQLite and PostgreSQL datastores via SeaORM.
//!
//! Cluster state is a single `cluster_state` key/value table. The row at
//! [`BOOTSTRAP_KEY`] marks the datastore as initialized and carries the
//! hash of the cluster token that joining servers must match.

pub mod entity;

use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use sea_orm::sea_query::{OnConflict, Table};
use sea_orm::{
    ActiveValue::Set, ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, QueryOrder, Schema, Statement, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{ClientAccessInfo, ControlConfig};
use crate::driver::Driver;
use crate::endpoint;
use crate::error::{DatastoreError, Result};
use crate::snapshot;
use entity::Entity as ClusterState;

pub const BOOTSTRAP_KEY: &str = "/bootstrap";
const TABLE: &str = "cluster_state";
const MEMBER_PREFIX: &str = "/members/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRecord {
    pub cluster_id: String,
    pub token_hash: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MemberRecord {
    name: String,
    advertise_ip: String,
    joined_at: i64,
}

/// One row of a JSON snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
}

pub struct SqlDriver {
    dialect: Dialect,
    config: OnceLock<ControlConfig>,
    db: OnceCell<DatabaseConnection>,
    started: AtomicBool,
}

impl SqlDriver {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            config: OnceLock::new(),
            db: OnceCell::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn sqlite() -> Self {
        Self::new(Dialect::Sqlite)
    }

    pub fn postgres() -> Self {
        Self::new(Dialect::Postgres)
    }

    fn config(&self) -> Result<&ControlConfig> {
        self.config
            .get()
            .ok_or_else(|| DatastoreError::NotRegistered(self.dialect.name().to_string()))
    }

    /// Connection URL for `cfg`, filling in the SQLite default and TLS
    /// parameters for PostgreSQL.
    pub fn connection_url(&self, cfg: &ControlConfig) -> String {
        let configured = cfg.datastore.endpoint.trim();
        match self.dialect {
            Dialect::Sqlite => {
                let url = if sqlite_path(configured).is_none() {
                    format!("sqlite://{}", cfg.db_dir().join("state.db").display())
                } else {
                    configured.to_string()
                };
                if url.contains('?') {
                    url
                } else {
                    format!("{url}?mode=rwc")
                }
            }
            Dialect::Postgres => {
                let mut url = configured.to_string();
                let mut params = Vec::new();
                if let Some(ca) = &cfg.datastore.ca_file {
                    params.push(format!("sslmode=verify-full&sslrootcert={}", ca.display()));
                }
                if let Some(cert) = &cfg.datastore.cert_file {
                    params.push(format!("sslcert={}", cert.display()));
                }
                if let Some(key) = &cfg.datastore.key_file {
                    params.push(format!("sslkey={}", key.display()));
                }
                if !params.is_empty() {
                    url.push(if url.contains('?') { '&' } else { '?' });
                    url.push_str(&params.join("&"));
                }
                url
            }
        }
    }

    /// Shared connection. Does not touch the schema.
    async fn connect(&self, cfg: &ControlConfig) -> Result<&DatabaseConnection> {
        self.db
            .get_or_try_init(|| async {
                let url = self.connection_url(cfg);
                if let Some(path) = sqlite_path(&url) {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                info!("connecting to {}", endpoint::redact(&url));
                let mut opts = ConnectOptions::new(url);
                opts.sqlx_logging(false);
                Ok::<_, DatastoreError>(Database::connect(opts).await?)
            })
            .await
    }

    /// Shared connection, with the state table created if it is missing.
    async fn schema_connection(&self, cfg: &ControlConfig) -> Result<&DatabaseConnection> {
        let db = self.connect(cfg).await?;
        init_schema(db).await?;
        Ok(db)
    }

    async fn bootstrap_record(&self, db: &DatabaseConnection) -> Result<Option<BootstrapRecord>> {
        if !has_table(db).await? {
            return Ok(None);
        }
        match ClusterState::find_by_id(BOOTSTRAP_KEY.to_string()).one(db).await? {
            Some(row) => Ok(Some(serde_json::from_str(&row.value)?)),
            None => Ok(None),
        }
    }

    fn snapshot_prefix(&self) -> String {
        format!("{}-snapshot", self.dialect.name())
    }
}

pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Database file behind a `sqlite://` URL. `None` for in-memory databases
/// and for URLs without a path.
pub fn sqlite_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Whether the state table exists, read from the catalog.
async fn has_table(db: &DatabaseConnection) -> Result<bool> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DbBackend::Postgres => format!(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = '{TABLE}'"
        ),
        _ => format!("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '{TABLE}'"),
    };
    Ok(db
        .query_one(Statement::from_string(backend, sql))
        .await?
        .is_some())
}

async fn init_schema(db: &DatabaseConnection) -> Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);
    let stmt = schema
        .create_table_from_entity(ClusterState)
        .if_not_exists()
        .to_owned();
    db.execute(builder.build(&stmt)).await?;
    Ok(())
}

async fn put<C: ConnectionTrait>(db: &C, key: &str, value: String) -> Result<()> {
    let row = entity::ActiveModel {
        key: Set(key.to_string()),
        value: Set(value),
        updated_at: Set(Utc::now().timestamp()),
    };
    ClusterState::insert(row)
        .on_conflict(
            OnConflict::column(entity::Column::Key)
                .update_columns([entity::Column::Value, entity::Column::UpdatedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;
    Ok(())
}

#[async_trait]
impl Driver for SqlDriver {
    fn endpoint_name(&self) -> &str {
        self.dialect.name()
    }

    async fn is_initialized(&self, config: &ControlConfig) -> Result<bool> {
        if self.dialect == Dialect::Sqlite {
            // don't create the database file just to find it empty
            if let Some(path) = sqlite_path(&self.connection_url(config)) {
                if !path.exists() {
                    return Ok(false);
                }
            }
        }
        let db = self.connect(config).await?;
        Ok(self.bootstrap_record(db).await?.is_some())
    }

    async fn register(&self, config: &ControlConfig, router: Router) -> Result<Router> {
        if self.config.set(config.clone()).is_err() {
            warn!(
                "{} driver registered twice, keeping the first config",
                self.dialect.name()
            );
        }
        Ok(router)
    }

    async fn start(&self, access: Option<ClientAccessInfo>) -> Result<()> {
        let cfg = self.config()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DatastoreError::AlreadyRunning(self.dialect.name().to_string()));
        }
        let result = async {
            let db = self.schema_connection(cfg).await?;
            let existing = self.bootstrap_record(db).await?;

            match (&access, existing) {
                (Some(access), Some(record)) => {
                    if record.token_hash != token_hash(&access.token) {
                        return Err(DatastoreError::Join(
                            "token does not match the cluster".to_string(),
                        ));
                    }
                    info!("joined cluster {}", record.cluster_id);
                }
                (Some(access), None) => {
                    return Err(DatastoreError::NotInitialized(format!(
                        "no cluster bootstrapped in datastore for {}",
                        access.url
                    )));
                }
                (None, Some(record)) => info!("using existing cluster {}", record.cluster_id),
                (None, None) => {
                    let record = BootstrapRecord {
                        cluster_id: uuid::Uuid::new_v4().to_string(),
                        token_hash: cfg.token.as_deref().map(token_hash).unwrap_or_default(),
                        created_at: Utc::now().timestamp(),
                    };
                    put(db, BOOTSTRAP_KEY, serde_json::to_string(&record)?).await?;
                    info!("bootstrapped new cluster {}", record.cluster_id);
                }
            }

            let member = MemberRecord {
                name: cfg.node_name.clone(),
                advertise_ip: cfg.advertise_ip.clone(),
                joined_at: Utc::now().timestamp(),
            };
            put(
                db,
                &format!("{MEMBER_PREFIX}{}", cfg.node_name),
                serde_json::to_string(&member)?,
            )
            .await
        }
        .await;

        if result.is_err() {
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn reset(&self) -> Result<()> {
        let cfg = self.config()?;
        let db = self.connect(cfg).await?;
        let stmt = Table::drop().table(ClusterState).if_exists().to_owned();
        db.execute(db.get_database_backend().build(&stmt)).await?;
        info!("dropped {} cluster state", self.dialect.name());
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        let cfg = self.config()?;
        let db = self
            .connect(cfg)
            .await
            .map_err(|e| DatastoreError::Connectivity(e.to_string()))?;
        db.ping()
            .await
            .map_err(|e| DatastoreError::Connectivity(e.to_string()))
    }

    async fn restore(&self) -> Result<()> {
        let cfg = self.config()?;
        let path = cfg.restore_path.as_deref().ok_or_else(|| {
            DatastoreError::RestoreFailed("no snapshot path configured".to_string())
        })?;
        let data = tokio::fs::read(path).await.map_err(|e| {
            DatastoreError::RestoreFailed(format!("read {}: {e}", path.display()))
        })?;
        let entries: Vec<SnapshotEntry> = serde_json::from_slice(&data).map_err(|e| {
            DatastoreError::RestoreFailed(format!("parse {}: {e}", path.display()))
        })?;

        let db = self.schema_connection(cfg).await?;
        let txn = db.begin().await?;
        ClusterState::delete_many().exec(&txn).await?;
        for entry in &entries {
            put(&txn, &entry.key, entry.value.clone()).await?;
        }
        txn.commit().await?;
        info!(
            "restored {} row(s) from {}",
            entries.len(),
            path.display()
        );
        Ok(())
    }

    async fn snapshot(&self) -> Result<PathBuf> {
        let cfg = self.config()?;
        let db = self.connect(cfg).await?;
        if !has_table(db).await? {
            return Err(DatastoreError::NotInitialized(format!(
                "no {} cluster state to snapshot",
                self.dialect.name()
            )));
        }
        let entries: Vec<SnapshotEntry> = ClusterState::find()
            .order_by_asc(entity::Column::Key)
            .all(db)
            .await?
            .into_iter()
            .map(|row| SnapshotEntry {
                key: row.key,
                value: row.value,
            })
            .collect();

        let dir = cfg.snapshot_dir();
        let prefix = self.snapshot_prefix();
        let path = dir.join(snapshot::snapshot_name(
            &prefix,
            &cfg.node_name,
            Some("json"),
        ));
        snapshot::write_atomically(&path, &serde_json::to_vec_pretty(&entries)?)?;
        info!("{} snapshot written to {}", self.dialect.name(), path.display());

        snapshot::prune(&dir, &prefix, cfg.snapshot.retention)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn control(dir: &Path, node: &str) -> ControlConfig {
        let mut cfg = ControlConfig::new(dir.join("server"), node);
        cfg.token = Some("secret".to_string());
        cfg
    }

    async fn started(cfg: &ControlConfig, access: Option<ClientAccessInfo>) -> Result<SqlDriver> {
        let driver = SqlDriver::sqlite();
        let _router = driver.register(cfg, Router::new()).await?;
        driver.start(access).await?;
        Ok(driver)
    }

    #[test]
    fn sqlite_default_url_lives_in_db_dir() {
        let cfg = ControlConfig::new("/var/lib/rkd/server", "n1");
        assert_eq!(
            SqlDriver::sqlite().connection_url(&cfg),
            "sqlite:///var/lib/rkd/server/db/state.db?mode=rwc"
        );
        assert_eq!(
            sqlite_path("sqlite:///var/lib/rkd/server/db/state.db?mode=rwc"),
            Some(PathBuf::from("/var/lib/rkd/server/db/state.db"))
        );
        assert_eq!(sqlite_path("sqlite::memory:"), None);
        assert_eq!(sqlite_path("sqlite://"), None);
    }

    #[test]
    fn postgres_url_carries_tls_files() {
        let mut cfg = ControlConfig::new("/var/lib/rkd/server", "n1");
        cfg.datastore.endpoint = "postgres://rkd:pw@db/rkd".to_string();
        cfg.datastore.ca_file = Some(PathBuf::from("/etc/rkd/ca.pem"));
        cfg.datastore.key_file = Some(PathBuf::from("/etc/rkd/client.key"));
        assert_eq!(
            SqlDriver::postgres().connection_url(&cfg),
            "postgres://rkd:pw@db/rkd?sslmode=verify-full&sslrootcert=/etc/rkd/ca.pem&sslkey=/etc/rkd/client.key"
        );
    }

    #[tokio::test]
    async fn fresh_start_bootstraps_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n1");

        let fresh = SqlDriver::sqlite();
        assert!(!fresh.is_initialized(&cfg).await.unwrap());
        assert!(!cfg.db_dir().join("state.db").exists());

        let driver = started(&cfg, None).await.unwrap();
        driver.test().await.unwrap();
        assert!(driver.is_initialized(&cfg).await.unwrap());
        assert!(matches!(
            driver.start(None).await,
            Err(DatastoreError::AlreadyRunning(_))
        ));

        let db = driver.db.get().unwrap();
        let record = driver.bootstrap_record(db).await.unwrap().unwrap();
        assert_eq!(record.token_hash, token_hash("secret"));
    }

    #[tokio::test]
    async fn join_checks_token() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n1");
        started(&cfg, None).await.unwrap();

        let mut joiner = cfg.clone();
        joiner.node_name = "n2".to_string();
        let bad = started(&joiner, Some(ClientAccessInfo::new("nope", "http://n1:9345"))).await;
        assert!(matches!(bad, Err(DatastoreError::Join(_))));

        started(&joiner, Some(ClientAccessInfo::new("secret", "http://n1:9345")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn join_without_bootstrap_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n2");
        let result = started(&cfg, Some(ClientAccessInfo::new("secret", "http://n1:9345"))).await;
        assert!(matches!(result, Err(DatastoreError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn is_initialized_does_not_create_schema() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n1");
        std::fs::create_dir_all(cfg.db_dir()).unwrap();
        std::fs::write(cfg.db_dir().join("state.db"), b"").unwrap();

        let driver = SqlDriver::sqlite();
        let _router = driver.register(&cfg, Router::new()).await.unwrap();
        assert!(!driver.is_initialized(&cfg).await.unwrap());
        let db = driver.connect(&cfg).await.unwrap();
        assert!(!has_table(db).await.unwrap());

        let driver = started(&cfg, None).await.unwrap();
        driver.reset().await.unwrap();
        assert!(!driver.is_initialized(&cfg).await.unwrap());
        assert!(!has_table(driver.db.get().unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_works_right_after_register() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n1");
        let driver = SqlDriver::sqlite();
        assert!(matches!(
            driver.test().await,
            Err(DatastoreError::NotRegistered(_))
        ));

        let _router = driver.register(&cfg, Router::new()).await.unwrap();
        driver.test().await.unwrap();
        assert!(!driver.is_initialized(&cfg).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_without_state_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = control(dir.path(), "n1");
        let driver = SqlDriver::sqlite();
        let _router = driver.register(&cfg, Router::new()).await.unwrap();
        assert!(matches!(
            driver.snapshot().await,
            Err(DatastoreError::NotInitialized(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_reset_restore() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = control(dir.path(), "n1");
        cfg.snapshot.retention = 1;
        let driver = started(&cfg, None).await.unwrap();

        let first = driver.snapshot().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = driver.snapshot().await.unwrap();
        assert!(!first.exists());
        assert!(second.exists());

        let entries: Vec<SnapshotEntry> =
            serde_json::from_slice(&std::fs::read(&second).unwrap()).unwrap();
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, [BOOTSTRAP_KEY, "/members/n1"]);

        driver.reset().await.unwrap();
        assert!(!driver.is_initialized(&cfg).await.unwrap());

        cfg.restore_path = Some(second);
        let restorer = SqlDriver::sqlite();
        let _router = restorer.register(&cfg, Router::new()).await.unwrap();
        restorer.restore().await.unwrap();
        assert!(restorer.is_initialized(&cfg).await.unwrap());
    }

    #[tokio::test]
    async fn restore_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = control(dir.path(), "n1");
        cfg.restore_path = Some(dir.path().join("missing.json"));
        let driver = SqlDriver::sqlite();
        let _router = driver.register(&cfg, Router::new()).await.unwrap();
        assert!(matches!(
            driver.restore().await,
            Err(DatastoreError::RestoreFailed(_))
        ));

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, b"{not json").unwrap();
        cfg.restore_path = Some(garbage);
        let driver = SqlDriver::sqlite();
        let _router = driver.register(&cfg, Router::new()).await.unwrap();
        assert!(matches!(
            driver.restore().await,
            Err(DatastoreError::RestoreFailed(_))
        ));
    }
}
