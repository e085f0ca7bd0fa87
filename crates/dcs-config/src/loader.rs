//! Configuration loader with file and environment variable support

use std::env;
use std::path::PathBuf;

use tracing::info;

use crate::{ConfigError, DcsConfig};

/// Standard config file search paths, checked in order.
const CONFIG_PATHS: &[&str] = &["dcs.toml", "./config/dcs.toml", "/etc/dicom-scheduler/dcs.toml"];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self { config_path: Some(path.into()) }
    }

    /// Load configuration from file (if found) with environment variable overrides.
    pub fn load(&self) -> Result<DcsConfig, ConfigError> {
        let mut config = DcsConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading configuration from file");
            config = DcsConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("DCS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut DcsConfig) {
        if let Ok(val) = env::var("DCS_MAXIMUM_THREAD_COUNT") {
            if let Ok(n) = val.parse() {
                config.scheduler.maximum_thread_count = n;
            }
        }
        if let Ok(val) = env::var("DCS_RETRY_DELAY_MS") {
            if let Ok(n) = val.parse() {
                config.scheduler.retry_delay_ms = n;
            }
        }
        if let Ok(val) = env::var("DCS_MAXIMUM_RETRIES") {
            if let Ok(n) = val.parse() {
                config.scheduler.maximum_retries = n;
            }
        }
        if let Ok(val) = env::var("DCS_MAXIMUM_PATIENTS_QUERY") {
            if let Ok(n) = val.parse() {
                config.scheduler.maximum_patients_query = n;
            }
        }
        if let Ok(val) = env::var("DCS_LISTENER_BATCH_LIMIT") {
            if let Ok(n) = val.parse() {
                config.scheduler.listener_batch_limit = n;
            }
        }
        if let Ok(val) = env::var("DCS_DATA_DIR") {
            config.data_dir = val;
        }
        if let Ok(val) = env::var("DCS_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let loader = ConfigLoader::with_path("/nonexistent/dcs.toml");
        let config = loader.load().expect("defaults should always load");
        assert_eq!(config.scheduler.maximum_thread_count, 20);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn example_toml_round_trips_through_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dcs.toml");
        std::fs::write(&path, DcsConfig::example_toml()).expect("write example config");

        let config = DcsConfig::from_file(&path).expect("example config should parse");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].connection_name, "PACS1");
        assert_eq!(config.scheduler.maximum_patients_query, 25);
    }
}
