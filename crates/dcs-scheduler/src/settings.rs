//! Scheduler-wide configuration surface (§6 "Configuration surface").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{DEFAULT_MAXIMUM_RETRIES, DEFAULT_RETRY_DELAY_MS};

/// Global defaults consulted by newly-created jobs and the admission pool.
/// Deserialized from TOML by `dcs-config`; constructed directly by
/// embedders and tests that don't need file-based configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub maximum_thread_count: usize,
    pub retry_delay_ms: u64,
    pub maximum_retries: u32,
    pub maximum_patients_query: usize,
    pub listener_batch_limit: usize,
    pub filters: HashMap<String, String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            maximum_thread_count: 20,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            maximum_retries: DEFAULT_MAXIMUM_RETRIES,
            // Carried forward from the reference client's documented
            // default for setMaximumPatientsQuery/maximumPatientsQuery.
            maximum_patients_query: 25,
            listener_batch_limit: 500,
            filters: HashMap::new(),
        }
    }
}
