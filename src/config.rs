//! Runtime configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::models::DeviceId;

/// The default delay after which an unconfirmed objective fails.
const DEFAULT_PENDING_EXPIRY_MILLIS: u64 = 20_000;
/// The default interval of the reconciliation sweep.
const DEFAULT_SWEEP_INTERVAL_MILLIS: u64 = 500;
/// The default port of the metrics server.
const DEFAULT_METRICS_PORT: u16 = 7002;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The ID of the device whose groups this controller manages.
    pub device_id: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The delay in milliseconds after which an objective whose top-level group was never
    /// confirmed is reported as failed.
    #[serde(default = "Config::default_pending_expiry_millis")]
    pub pending_expiry_millis: u64,
    /// The interval in milliseconds at which pending groups are reconciled against the device.
    #[serde(default = "Config::default_sweep_interval_millis")]
    pub sweep_interval_millis: u64,

    /// The port which the metrics server is to use.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// An optional JSON file of next objectives to install at startup.
    #[serde(default)]
    pub objectives_path: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            bail!("DEVICE_ID must not be empty");
        }
        if self.sweep_interval_millis == 0 {
            bail!("SWEEP_INTERVAL_MILLIS must be greater than 0");
        }
        Ok(())
    }

    /// The ID of the managed device.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.device_id.clone())
    }

    /// The delay after which an unconfirmed objective fails.
    pub fn pending_expiry(&self) -> Duration {
        Duration::from_millis(self.pending_expiry_millis)
    }

    /// The interval of the reconciliation sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis)
    }

    fn default_pending_expiry_millis() -> u64 {
        DEFAULT_PENDING_EXPIRY_MILLIS
    }

    fn default_sweep_interval_millis() -> u64 {
        DEFAULT_SWEEP_INTERVAL_MILLIS
    }

    fn default_metrics_port() -> u16 {
        DEFAULT_METRICS_PORT
    }

    /// Create a config for tests, backed by a temporary data directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            device_id: crate::fixtures::DEVICE.into(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            pending_expiry_millis: DEFAULT_PENDING_EXPIRY_MILLIS,
            sweep_interval_millis: 50,
            metrics_port: DEFAULT_METRICS_PORT,
            objectives_path: None,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
