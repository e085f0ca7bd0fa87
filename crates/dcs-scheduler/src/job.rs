//! Job taxonomy and lifecycle (§3, §4.2).
//!
//! A Job is a tagged variant rather than a class hierarchy: [`JobVariant`]
//! carries the per-kind payload, [`JobRecord`] carries the fields every
//! variant shares (identity, status, retry policy, hierarchy filters,
//! produced response sets).

use std::collections::HashMap;

use dcs_common::{new_job_id, DicomLevel, JobDetail, JobId, JobStatus, JobType, Priority, ResponseSet};

/// Default cap on concurrently `Queued`/`Running` jobs of one class.
pub const DEFAULT_MAXIMUM_CONCURRENT_PER_TYPE: u32 = 20;
/// The Inserter class is capped at 1 so writes to the Store never interleave.
pub const INSERTER_MAXIMUM_CONCURRENT_PER_TYPE: u32 = 1;
pub const DEFAULT_MAXIMUM_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Per-class concurrency grouping key (§4.4: "per class (variant), not per
/// server, not per level").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobClass {
    Query,
    Retrieve,
    Echo,
    StorageListener,
    Inserter,
    ThumbnailGenerator,
}

/// Per-variant payload. Each variant carries exactly the fields its Worker
/// needs; shared fields (status, priority, retry counters, hierarchy UIDs,
/// produced response sets) live on [`JobRecord`].
#[derive(Debug, Clone)]
pub enum JobVariant {
    Query {
        connection_name: String,
        filters: HashMap<String, String>,
    },
    Retrieve {
        connection_name: String,
    },
    Echo {
        connection_name: String,
    },
    StorageListener {
        ae_title: String,
        port: u16,
        connection_timeout_secs: u32,
        listener_batch_limit: usize,
    },
    Inserter {
        database_filename: String,
        tags_to_precache: Vec<String>,
        tags_to_exclude_from_storage: Vec<String>,
    },
    ThumbnailGenerator,
}

impl JobVariant {
    pub fn class(&self) -> JobClass {
        match self {
            JobVariant::Query { .. } => JobClass::Query,
            JobVariant::Retrieve { .. } => JobClass::Retrieve,
            JobVariant::Echo { .. } => JobClass::Echo,
            JobVariant::StorageListener { .. } => JobClass::StorageListener,
            JobVariant::Inserter { .. } => JobClass::Inserter,
            JobVariant::ThumbnailGenerator => JobClass::ThumbnailGenerator,
        }
    }

    pub fn connection_name(&self) -> Option<&str> {
        match self {
            JobVariant::Query { connection_name, .. } => Some(connection_name),
            JobVariant::Retrieve { connection_name } => Some(connection_name),
            JobVariant::Echo { connection_name } => Some(connection_name),
            _ => None,
        }
    }
}

/// One admission-queue record.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub priority: Priority,
    pub retry_counter: u32,
    pub maximum_retries: u32,
    pub retry_delay_ms: u64,
    pub maximum_concurrent_per_type: u32,
    pub is_persistent: bool,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub dicom_level: DicomLevel,
    pub reference_inserter_job_id: Option<JobId>,
    pub response_sets: Vec<ResponseSet>,
    pub variant: JobVariant,
}

impl JobRecord {
    /// `maximum_retries`/`retry_delay_ms` come from the scheduler's current
    /// `SchedulerSettings` at admission time (§6 "Configuration surface");
    /// the module constants above are only the fallback a caller that has
    /// no settings handy (tests, `Default`) can reach for.
    pub fn new(
        variant: JobVariant,
        dicom_level: DicomLevel,
        priority: Priority,
        maximum_retries: u32,
        retry_delay_ms: u64,
    ) -> Self {
        let maximum_concurrent_per_type = match variant.class() {
            JobClass::Inserter => INSERTER_MAXIMUM_CONCURRENT_PER_TYPE,
            _ => DEFAULT_MAXIMUM_CONCURRENT_PER_TYPE,
        };
        let is_persistent = matches!(variant, JobVariant::StorageListener { .. });
        Self {
            id: new_job_id(),
            status: JobStatus::Initialized,
            priority,
            retry_counter: 0,
            maximum_retries,
            retry_delay_ms,
            maximum_concurrent_per_type,
            is_persistent,
            patient_id: None,
            study_instance_uid: None,
            series_instance_uid: None,
            sop_instance_uid: None,
            dicom_level,
            reference_inserter_job_id: None,
            response_sets: Vec::new(),
            variant,
        }
    }

    /// Convenience constructor for call sites with no `SchedulerSettings` to
    /// hand (tests, one-off fixtures): falls back to the module defaults.
    #[cfg(test)]
    pub fn new_with_defaults(variant: JobVariant, dicom_level: DicomLevel, priority: Priority) -> Self {
        Self::new(variant, dicom_level, priority, DEFAULT_MAXIMUM_RETRIES, DEFAULT_RETRY_DELAY_MS)
    }

    pub fn class(&self) -> JobClass {
        self.variant.class()
    }

    /// Derived DIMSE-ish job type (§3 JobType), combining variant and level.
    pub fn job_type(&self) -> JobType {
        match &self.variant {
            JobVariant::Query { .. } => match self.dicom_level {
                DicomLevel::Patients => JobType::QueryPatients,
                DicomLevel::Studies => JobType::QueryStudies,
                DicomLevel::Series => JobType::QuerySeries,
                DicomLevel::Instances => JobType::QueryInstances,
                DicomLevel::None => JobType::None,
            },
            JobVariant::Retrieve { .. } => match self.dicom_level {
                DicomLevel::Studies => JobType::RetrieveStudy,
                DicomLevel::Series => JobType::RetrieveSeries,
                DicomLevel::Instances => JobType::RetrieveSopInstance,
                _ => JobType::None,
            },
            JobVariant::Echo { .. } => JobType::Echo,
            JobVariant::StorageListener { .. } => JobType::StoreSopInstance,
            JobVariant::Inserter { .. } => JobType::Inserter,
            JobVariant::ThumbnailGenerator => JobType::ThumbnailGenerator,
        }
    }

    /// Clone rule (§4.2): every configuration field copies across; runtime
    /// state (status, response sets) resets. `retry_counter` is intentionally
    /// left untouched here — callers pick the right constructor below so
    /// each call site's intent about the counter is explicit in the type
    /// system rather than relying on the caller to remember to zero a field
    /// (see SPEC_FULL.md §9's open-question decision).
    fn clone_base(&self) -> JobRecord {
        JobRecord {
            id: new_job_id(),
            status: JobStatus::Initialized,
            priority: self.priority,
            retry_counter: self.retry_counter,
            maximum_retries: self.maximum_retries,
            retry_delay_ms: self.retry_delay_ms,
            maximum_concurrent_per_type: self.maximum_concurrent_per_type,
            is_persistent: self.is_persistent,
            patient_id: self.patient_id.clone(),
            study_instance_uid: self.study_instance_uid.clone(),
            series_instance_uid: self.series_instance_uid.clone(),
            sop_instance_uid: self.sop_instance_uid.clone(),
            dicom_level: self.dicom_level,
            reference_inserter_job_id: None,
            response_sets: Vec::new(),
            variant: self.variant.clone(),
        }
    }

    /// Retry hand-off clone: `retry_counter = predecessor.retry_counter + 1`.
    pub fn clone_for_retry(&self) -> JobRecord {
        let mut clone = self.clone_base();
        clone.retry_counter = self.retry_counter + 1;
        clone
    }

    /// Proxy re-dispatch clone (§4.6): `retry_counter` resets to 0 and the
    /// variant's server is swapped to the proxy.
    pub fn clone_for_proxy(&self, proxy_connection_name: String) -> JobRecord {
        let mut clone = self.clone_base();
        clone.retry_counter = 0;
        clone.variant = match clone.variant {
            JobVariant::Retrieve { .. } => JobVariant::Retrieve { connection_name: proxy_connection_name },
            other => other,
        };
        clone
    }

    pub fn to_detail(&self) -> JobDetail {
        let connection_name = self.variant.connection_name().unwrap_or_default().to_string();
        JobDetail {
            job_class: self.job_type(),
            job_id: self.id.clone(),
            dicom_level: self.dicom_level,
            patient_id: self.patient_id.clone(),
            study_instance_uid: self.study_instance_uid.clone(),
            series_instance_uid: self.series_instance_uid.clone(),
            sop_instance_uid: self.sop_instance_uid.clone(),
            connection_name,
            reference_inserter_job_id: self.reference_inserter_job_id.clone(),
            number_of_datasets: self.response_sets.iter().map(|r| r.number_of_datasets()).sum(),
            queried_patient_ids: self.patient_id.clone().into_iter().collect(),
            queried_study_instance_uids: self.study_instance_uid.clone().into_iter().collect(),
            queried_series_instance_uids: self.series_instance_uid.clone().into_iter().collect(),
            queried_sop_instance_uids: self.sop_instance_uid.clone().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query_job() -> JobRecord {
        let mut job = JobRecord::new_with_defaults(
            JobVariant::Query { connection_name: "PACS1".into(), filters: HashMap::new() },
            DicomLevel::Studies,
            Priority::Normal,
        );
        job.patient_id = Some("P1".into());
        job.response_sets.push(ResponseSet::new(JobType::QueryStudies, job.id.clone(), "PACS1"));
        job
    }

    #[test]
    fn clone_law_copies_config_and_clears_response_sets() {
        let job = sample_query_job();
        let retry_clone = job.clone_for_retry();

        assert_ne!(retry_clone.id, job.id);
        assert_eq!(retry_clone.patient_id, job.patient_id);
        assert_eq!(retry_clone.dicom_level, job.dicom_level);
        assert_eq!(retry_clone.status, JobStatus::Initialized);
        assert!(retry_clone.response_sets.is_empty());
        assert_eq!(retry_clone.retry_counter, job.retry_counter + 1);

        let double_clone = retry_clone.clone_for_retry();
        assert_eq!(double_clone.patient_id, retry_clone.patient_id);
        assert_eq!(double_clone.dicom_level, retry_clone.dicom_level);
    }

    #[test]
    fn proxy_clone_zeroes_retry_counter_and_swaps_server() {
        let mut job = sample_query_job();
        job.variant = JobVariant::Retrieve { connection_name: "PACS1".into() };
        job.retry_counter = 2;

        let proxied = job.clone_for_proxy("PROXY1".into());
        assert_eq!(proxied.retry_counter, 0);
        assert_eq!(proxied.variant.connection_name(), Some("PROXY1"));
    }

    #[test]
    fn inserter_defaults_to_concurrency_cap_one() {
        let job = JobRecord::new_with_defaults(
            JobVariant::Inserter {
                database_filename: "db.sqlite".into(),
                tags_to_precache: vec![],
                tags_to_exclude_from_storage: vec![],
            },
            DicomLevel::None,
            Priority::High,
        );
        assert_eq!(job.maximum_concurrent_per_type, INSERTER_MAXIMUM_CONCURRENT_PER_TYPE);
        assert!(!job.is_persistent);
    }

    #[test]
    fn storage_listener_is_persistent() {
        let job = JobRecord::new_with_defaults(
            JobVariant::StorageListener {
                ae_title: "CTK_STORE".into(),
                port: 11112,
                connection_timeout_secs: 10,
                listener_batch_limit: 500,
            },
            DicomLevel::None,
            Priority::Low,
        );
        assert!(job.is_persistent);
    }

    #[test]
    fn job_type_derivation_matches_variant_and_level() {
        let job = sample_query_job();
        assert_eq!(job.job_type(), JobType::QueryStudies);
    }
}
