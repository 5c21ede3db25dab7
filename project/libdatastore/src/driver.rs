use std::path::PathBuf;

use async_trait::async_trait;
use axum::Router;

use crate::config::{ClientAccessInfo, ControlConfig};
use crate::error::{DatastoreError, Result};

/// Lifecycle contract shared by every cluster datastore backend.
///
/// Drivers are created once at startup and live for the whole process.
/// Nothing here enforces call order; [`crate::ClusterBootstrapper`] issues
/// the calls one at a time:
///
/// ```text
/// register -> is_initialized -> start            (fresh cluster or join)
/// register -> restore -> start                   (restore from snapshot)
/// register -> reset                              (forget cluster state)
/// ```
///
/// `register` hands the driver its [`ControlConfig`]. The argument-less calls
/// (`reset`, `test`, `restore`, `snapshot`) work off that stored config and
/// return [`DatastoreError::NotRegistered`] before it.
///
/// Futures returned here may be dropped at any await point; that is how a
/// caller cancels an in-flight call.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable identifier used for registry lookup and endpoint selection.
    fn endpoint_name(&self) -> &str;

    /// Whether this backend already holds cluster state. No side effects.
    async fn is_initialized(&self, config: &ControlConfig) -> Result<bool>;

    /// Store `config` and optionally mount extra routes on the supervisor API.
    async fn register(&self, config: &ControlConfig, router: Router) -> Result<Router>;

    /// Bootstrap a fresh cluster (`None`) or join an existing one.
    async fn start(&self, access: Option<ClientAccessInfo>) -> Result<()>;

    /// Discard persisted cluster state; afterwards `is_initialized` is false.
    async fn reset(&self) -> Result<()>;

    /// Liveness check without persistent side effects.
    async fn test(&self) -> Result<()>;

    /// Rebuild state from the snapshot named by `ControlConfig::restore_path`.
    async fn restore(&self) -> Result<()>;

    /// Write a snapshot into the configured snapshot directory.
    async fn snapshot(&self) -> Result<PathBuf> {
        Err(DatastoreError::NotSupported {
            driver: self.endpoint_name().to_string(),
            op: "snapshot",
        })
    }

    /// URLs the API server should use to reach this datastore.
    fn client_urls(&self) -> Vec<String> {
        Vec::new()
    }
}
