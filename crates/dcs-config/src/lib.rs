//! DICOM scheduler configuration system
//!
//! TOML-based configuration with environment variable override support,
//! seeding the scheduler's retry/concurrency defaults and its initial
//! server registry from one file.

use std::path::Path;

use dcs_common::Server;
use dcs_scheduler::SchedulerSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DcsConfig {
    pub scheduler: SchedulerSettings,

    /// Servers seeded into the registry at startup, in file order.
    pub servers: Vec<Server>,

    /// Directory the local index/thumbnail cache is written under.
    pub data_dir: String,

    pub dev_mode: bool,
}

impl Default for DcsConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            servers: Vec::new(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

impl DcsConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DcsConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides, searching
    /// the standard paths if no explicit path is given (see [`ConfigLoader`]).
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Generate an example TOML configuration.
    pub fn example_toml() -> String {
        r#"# DICOM client workstation scheduler configuration
# Environment variables prefixed DCS_ override these settings

[scheduler]
maximum_thread_count = 20
retry_delay_ms = 100
maximum_retries = 3
maximum_patients_query = 25
listener_batch_limit = 500

[scheduler.filters]
# Modalities = "CT,MR"

[[servers]]
connection_name = "PACS1"
calling_ae_title = "CTK_SCU"
called_ae_title = "PACS1_AE"
host = "pacs1.example.org"
port = 11112
retrieve_protocol = "CGET"
query_retrieve_enabled = true
storage_enabled = true
trusted_enabled = true

data_dir = "./data"
dev_mode = false
"#
        .to_string()
    }
}
