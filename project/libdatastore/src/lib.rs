//! Cluster datastore drivers.
//!
//! A server keeps its cluster state in exactly one backend. Every backend
//! implements [`Driver`]; the server picks one out of a [`DriverRegistry`]
//! and walks it through its lifecycle with a [`ClusterBootstrapper`].
//!
//! Built-in backends:
//!
//! - [`etcd::EtcdDriver`]: an etcd member supervised by the server process
//! - [`sql::SqlDriver`]: SQLite or PostgreSQL through SeaORM

pub mod cluster;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod etcd;
pub mod registry;
pub mod snapshot;
pub mod sql;

pub use cluster::{BootstrapOutcome, ClusterBootstrapper};
pub use config::{ClientAccessInfo, ControlConfig, DatastoreConfig, SnapshotConfig};
pub use driver::Driver;
pub use error::{DatastoreError, Result};
pub use registry::DriverRegistry;
