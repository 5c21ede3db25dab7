use std::fmt;
use std::sync::Arc;

use crate::driver::Driver;
use crate::endpoint;
use crate::error::{DatastoreError, Result};
use crate::etcd::EtcdDriver;
use crate::sql::SqlDriver;

/// The set of datastore drivers known to this process.
///
/// Built once during startup and shared read-only behind an `Arc` afterwards,
/// so lookups need no locking. Registration order is kept; it decides both
/// enumeration order and which driver wins a duplicated endpoint name.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
    default_driver: Option<String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the drivers shipped with rkd: `etcd`, `sqlite`, `postgres`.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .register(Arc::new(EtcdDriver::new()))
            .register(Arc::new(SqlDriver::sqlite()))
            .register(Arc::new(SqlDriver::postgres()));
        registry
    }

    /// Append a driver. Duplicates are not filtered.
    pub fn register(&mut self, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.push(driver);
        self
    }

    pub fn registered(&self) -> &[Arc<dyn Driver>] {
        &self.drivers
    }

    pub fn set_default(&mut self, endpoint_name: impl Into<String>) -> &mut Self {
        self.default_driver = Some(endpoint_name.into()).filter(|n: &String| !n.is_empty());
        self
    }

    /// The explicitly configured default, else the only registered driver.
    /// With several drivers and no explicit default there is no answer.
    pub fn default_endpoint(&self) -> Option<&str> {
        if let Some(name) = self.default_driver.as_deref() {
            return Some(name);
        }
        match self.drivers.as_slice() {
            [only] => Some(only.endpoint_name()),
            _ => None,
        }
    }

    pub fn lookup(&self, endpoint_name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|d| d.endpoint_name() == endpoint_name)
            .cloned()
    }

    /// Driver for a datastore endpoint string, falling back to the default
    /// when the endpoint is empty.
    pub fn select(&self, endpoint: &str) -> Result<Arc<dyn Driver>> {
        let name = match endpoint::scheme(endpoint) {
            Some(scheme) => scheme,
            None => self
                .default_endpoint()
                .map(str::to_string)
                .ok_or_else(|| DatastoreError::DriverNotFound(String::new()))?,
        };
        self.lookup(&name)
            .ok_or(DatastoreError::DriverNotFound(name))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field(
                "drivers",
                &self
                    .drivers
                    .iter()
                    .map(|d| d.endpoint_name())
                    .collect::<Vec<_>>(),
            )
            .field("default_driver", &self.default_driver)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use axum::Router;

    use super::*;
    use crate::config::{ClientAccessInfo, ControlConfig};

    struct Named(&'static str);

    #[async_trait]
    impl Driver for Named {
        fn endpoint_name(&self) -> &str {
            self.0
        }
        async fn is_initialized(&self, _: &ControlConfig) -> Result<bool> {
            Ok(false)
        }
        async fn register(&self, _: &ControlConfig, router: Router) -> Result<Router> {
            Ok(router)
        }
        async fn start(&self, _: Option<ClientAccessInfo>) -> Result<()> {
            Ok(())
        }
        async fn reset(&self) -> Result<()> {
            Ok(())
        }
        async fn test(&self) -> Result<()> {
            Ok(())
        }
        async fn restore(&self) -> Result<()> {
            Ok(())
        }
        async fn snapshot(&self) -> Result<PathBuf> {
            Ok(PathBuf::new())
        }
    }

    #[test]
    fn default_with_no_drivers_is_none() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.default_endpoint(), None);
        assert!(matches!(
            registry.select(""),
            Err(DatastoreError::DriverNotFound(_))
        ));
    }

    #[test]
    fn default_with_single_driver_is_that_driver() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(Named("etcd")));
        assert_eq!(registry.default_endpoint(), Some("etcd"));
        assert_eq!(registry.select("").unwrap().endpoint_name(), "etcd");
    }

    #[test]
    fn default_with_two_drivers_is_ambiguous() {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(Named("etcd")))
            .register(Arc::new(Named("sqlite")));
        assert_eq!(registry.default_endpoint(), None);
        assert!(registry.select("").is_err());

        registry.set_default("sqlite");
        assert_eq!(registry.default_endpoint(), Some("sqlite"));
        assert_eq!(registry.select("").unwrap().endpoint_name(), "sqlite");
    }

    #[test]
    fn explicit_default_wins_over_single_driver() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(Named("etcd"))).set_default("postgres");
        assert_eq!(registry.default_endpoint(), Some("postgres"));
        assert!(matches!(
            registry.select(""),
            Err(DatastoreError::DriverNotFound(name)) if name == "postgres"
        ));
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = DriverRegistry::new();
        registry
            .register(Arc::new(Named("b")))
            .register(Arc::new(Named("a")))
            .register(Arc::new(Named("b")));
        let names: Vec<_> = registry
            .registered()
            .iter()
            .map(|d| d.endpoint_name().to_string())
            .collect();
        assert_eq!(names, ["b", "a", "b"]);
    }

    #[test]
    fn select_uses_endpoint_scheme() {
        let registry = DriverRegistry::builtin();
        assert_eq!(
            registry.select("etcd://").unwrap().endpoint_name(),
            "etcd"
        );
        assert_eq!(
            registry
                .select("postgresql://rkd@db/rkd")
                .unwrap()
                .endpoint_name(),
            "postgres"
        );
        assert!(matches!(
            registry.select("mysql://root@db/rkd"),
            Err(DatastoreError::DriverNotFound(name)) if name == "mysql"
        ));
    }
}
