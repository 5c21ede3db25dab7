use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("no datastore driver matches endpoint {0:?}")]
    DriverNotFound(String),

    #[error("datastore driver {0} used before register")]
    NotRegistered(String),

    #[error("datastore is not initialized: {0}")]
    NotInitialized(String),

    #[error("datastore driver {0} is already running")]
    AlreadyRunning(String),

    #[error("datastore connectivity check failed: {0}")]
    Connectivity(String),

    #[error("datastore restore failed: {0}")]
    RestoreFailed(String),

    #[error("failed to join cluster: {0}")]
    Join(String),

    #[error("{op} is not supported by datastore driver {driver}")]
    NotSupported { driver: String, op: &'static str },

    #[error("datastore operation cancelled")]
    Cancelled,

    #[error("datastore not ready after {0:?}")]
    ReadyTimeout(Duration),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = DatastoreError> = std::result::Result<T, E>;
