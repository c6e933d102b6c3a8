//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// The default port of the metrics server.
pub const DEFAULT_METRICS_PORT: u16 = 7002;
/// The default number of times a conflicting channel update is retried.
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 8;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which the Prometheus metrics server is to use.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The name of this coordinator instance.
    ///
    /// Used as the name of this instance's database directory and as a global metrics label.
    pub node_name: String,
    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// Channels which are registered at startup, comma separated.
    ///
    /// Registration is idempotent, so already known channels are left as they are.
    #[serde(default)]
    pub channels: Vec<String>,
    /// The number of times a channel update which lost a race against another writer is retried.
    #[serde(default = "Config::default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.channels.retain(|name| !name.trim().is_empty());
        Ok(config)
    }

    fn default_metrics_port() -> u16 {
        DEFAULT_METRICS_PORT
    }

    fn default_max_conflict_retries() -> u32 {
        DEFAULT_MAX_CONFLICT_RETRIES
    }

    /// Create a config for testing, with storage placed in a temporary directory which lives as
    /// long as the returned handle.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        let config = Self {
            rust_log: "error".into(),
            metrics_port: DEFAULT_METRICS_PORT,
            node_name: "coord-0".into(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            channels: vec![],
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
