use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use libdatastore::{ClientAccessInfo, ControlConfig, DatastoreError, Driver, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Register,
    IsInitialized,
    Start(Option<ClientAccessInfo>),
    Reset,
    Test,
    Restore,
}

/// Driver that records every lifecycle call made on it.
pub struct RecordingDriver {
    name: &'static str,
    pub calls: Mutex<Vec<Call>>,
    initialized: bool,
    /// Number of `test` calls that fail before one succeeds.
    failing_tests: AtomicUsize,
    /// Makes `start` hang until the caller gives up.
    pub hang_on_start: bool,
}

impl RecordingDriver {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: Mutex::new(Vec::new()),
            initialized: false,
            failing_tests: AtomicUsize::new(0),
            hang_on_start: false,
        }
    }

    pub fn initialized(mut self) -> Self {
        self.initialized = true;
        self
    }

    pub fn failing_tests(self, count: usize) -> Self {
        self.failing_tests.store(count, Ordering::SeqCst);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang_on_start = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn endpoint_name(&self) -> &str {
        self.name
    }

    async fn is_initialized(&self, _: &ControlConfig) -> Result<bool> {
        self.record(Call::IsInitialized);
        Ok(self.initialized)
    }

    async fn register(&self, _: &ControlConfig, router: Router) -> Result<Router> {
        self.record(Call::Register);
        Ok(router)
    }

    async fn start(&self, access: Option<ClientAccessInfo>) -> Result<()> {
        self.record(Call::Start(access));
        if self.hang_on_start {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.record(Call::Reset);
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        self.record(Call::Test);
        let remaining = self.failing_tests.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_tests.store(remaining - 1, Ordering::SeqCst);
            return Err(DatastoreError::Connectivity("not yet".to_string()));
        }
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        self.record(Call::Restore);
        Ok(())
    }

    async fn snapshot(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("/dev/null"))
    }
}
