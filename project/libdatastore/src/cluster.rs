use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::driver::Driver;
use crate::endpoint;
use crate::error::{DatastoreError, Result};
use crate::registry::DriverRegistry;

const DEFAULT_TEST_INTERVAL: Duration = Duration::from_secs(5);

pub enum BootstrapOutcome {
    /// Cluster state was discarded; the server must not continue starting.
    Reset { driver: Arc<dyn Driver> },
    /// The datastore is running and answered its connectivity check.
    Running {
        driver: Arc<dyn Driver>,
        router: Router,
    },
}

/// Picks the configured driver and drives it through its lifecycle.
///
/// Every driver call is raced against `cancel`; cancellation drops the
/// in-flight future and surfaces [`DatastoreError::Cancelled`]. Calls are
/// strictly sequential and never retried, except the readiness check.
pub struct ClusterBootstrapper<'a> {
    registry: &'a DriverRegistry,
    cancel: CancellationToken,
    test_interval: Duration,
}

impl<'a> ClusterBootstrapper<'a> {
    pub fn new(registry: &'a DriverRegistry, cancel: CancellationToken) -> Self {
        Self {
            registry,
            cancel,
            test_interval: DEFAULT_TEST_INTERVAL,
        }
    }

    pub fn with_test_interval(mut self, interval: Duration) -> Self {
        self.test_interval = interval;
        self
    }

    pub async fn bootstrap(&self, config: &ControlConfig, router: Router) -> Result<BootstrapOutcome> {
        let driver = self.registry.select(&config.datastore.endpoint)?;
        info!(
            "using datastore driver {} (endpoint {:?})",
            driver.endpoint_name(),
            endpoint::redact(&config.datastore.endpoint)
        );

        let router = self.guard(driver.register(config, router)).await?;

        if config.cluster_reset {
            if config.restore_path.is_some() {
                warn!("cluster reset requested, ignoring restore path");
            }
            info!("resetting {} datastore", driver.endpoint_name());
            self.guard(driver.reset()).await?;
            return Ok(BootstrapOutcome::Reset { driver });
        }

        if let Some(path) = &config.restore_path {
            info!("restoring {} datastore from {}", driver.endpoint_name(), path.display());
            self.guard(driver.restore()).await?;
            self.guard(driver.start(None)).await?;
        } else {
            let initialized = self.guard(driver.is_initialized(config)).await?;
            let access = if initialized {
                if config.join_url.is_some() {
                    info!("datastore already initialized, not joining {:?}", config.join_url);
                }
                None
            } else {
                config.client_access_info()
            };
            match &access {
                Some(info) => info!("joining cluster at {}", info.url),
                None if initialized => info!("starting datastore from existing state"),
                None => info!("initializing new cluster"),
            }
            self.guard(driver.start(access)).await?;
        }

        self.wait_ready(driver.as_ref(), config.ready_timeout).await?;
        Ok(BootstrapOutcome::Running { driver, router })
    }

    async fn guard<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DatastoreError::Cancelled),
            result = call => result,
        }
    }

    async fn wait_ready(&self, driver: &dyn Driver, timeout: Duration) -> Result<()> {
        // a timeout past the clock's range never expires
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match self.guard(driver.test()).await {
                Ok(()) => {
                    info!("{} datastore is ready", driver.endpoint_name());
                    return Ok(());
                }
                Err(DatastoreError::Cancelled) => return Err(DatastoreError::Cancelled),
                Err(err) => warn!("datastore not ready yet: {err}"),
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(DatastoreError::ReadyTimeout(timeout));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DatastoreError::Cancelled),
                _ = tokio::time::sleep(self.test_interval) => {}
            }
        }
    }
}
