//! Metrics infrastructure for the job scheduler
//!
//! Provides Prometheus-compatible metrics for:
//! - Job lifecycle counts (started, finished, failed, canceled)
//! - Job run duration
//! - Per-class admission queue depth

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub fn record_job_started(job_type: &str) {
    counter!("dcs_jobs_started_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_finished(job_type: &str) {
    counter!("dcs_jobs_finished_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_failed(job_type: &str) {
    counter!("dcs_jobs_failed_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_canceled(job_type: &str) {
    counter!("dcs_jobs_canceled_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_retried(job_type: &str) {
    counter!("dcs_jobs_retried_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_job_duration(job_type: &str, duration: Duration) {
    histogram!("dcs_job_duration_seconds", "job_type" => job_type.to_string()).record(duration.as_secs_f64());
}

pub fn set_active_job_count(job_class: &str, count: usize) {
    gauge!("dcs_active_jobs", "job_class" => job_class.to_string()).set(count as f64);
}
