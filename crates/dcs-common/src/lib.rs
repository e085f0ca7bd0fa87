//! Shared data model for the DICOM job scheduler.
//!
//! This crate has no knowledge of networking, the job table, or the worker
//! pool — it only defines the value types that flow between `dcs-scheduler`,
//! `dcs-operation`, and whatever DICOM toolkit an embedder plugs in.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod logging;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque key for a [`Server`] in the registry; the connection name.
pub type ServerId = String;

/// A fresh, immutable identifier assigned to a job at admission time.
pub type JobId = String;

/// Allocate a fresh job id.
pub fn new_job_id() -> JobId {
    Uuid::new_v4().to_string()
}

// ============================================================================
// DicomLevel / JobType / JobStatus / Priority
// ============================================================================

/// Hierarchy level a query/retrieve operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DicomLevel {
    None,
    Patients,
    Studies,
    Series,
    Instances,
}

impl fmt::Display for DicomLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DicomLevel::None => "None",
            DicomLevel::Patients => "Patients",
            DicomLevel::Studies => "Studies",
            DicomLevel::Series => "Series",
            DicomLevel::Instances => "Instances",
        };
        write!(f, "{s}")
    }
}

/// The concrete DIMSE-ish job type, derived from the job variant and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    None,
    QueryPatients,
    QueryStudies,
    QuerySeries,
    QueryInstances,
    RetrieveStudy,
    RetrieveSeries,
    RetrieveSopInstance,
    /// An incoming C-STORE delivered by the listener, not an outgoing send.
    StoreSopInstance,
    Inserter,
    Echo,
    ThumbnailGenerator,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Lifecycle status of a [`Job`](crate::JobType) in the scheduler's table.
///
/// Terminal states: `UserStopped`, `Failed`, `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Initialized,
    Queued,
    Running,
    UserStopped,
    AttemptFailed,
    Failed,
    Finished,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::UserStopped | JobStatus::Failed | JobStatus::Finished
        )
    }
}

/// Discrete admission priority. Default `Low`; response-set insertion default `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Low
    }
}

/// Descending admission order: `Highest, High, Normal, Low, Lowest`.
pub const PRIORITY_ADMISSION_ORDER: [Priority; 5] = [
    Priority::Highest,
    Priority::High,
    Priority::Normal,
    Priority::Low,
    Priority::Lowest,
];

// ============================================================================
// Server
// ============================================================================

/// Protocol used to retrieve query results from a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrieveProtocol {
    #[serde(rename = "CGET")]
    CGet,
    #[serde(rename = "CMOVE")]
    CMove,
}

impl Default for RetrieveProtocol {
    fn default() -> Self {
        RetrieveProtocol::CGet
    }
}

impl fmt::Display for RetrieveProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl RetrieveProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieveProtocol::CGet => "CGET",
            RetrieveProtocol::CMove => "CMOVE",
        }
    }
}

impl std::str::FromStr for RetrieveProtocol {
    type Err = DcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CGET" => Ok(RetrieveProtocol::CGet),
            "CMOVE" => Ok(RetrieveProtocol::CMove),
            other => Err(DcsError::InvalidInput(format!(
                "unknown retrieve protocol: {other}"
            ))),
        }
    }
}

/// A remote DICOM peer.
///
/// Defaults (carried forward from the reference client): `port = 80`,
/// `connection_timeout = 10s`, `keep_association_open = true`,
/// `retrieve_protocol = CGET`, all three enable flags `true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub connection_name: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub host: String,
    pub port: u16,
    pub retrieve_protocol: RetrieveProtocol,
    pub move_destination_ae_title: String,
    pub keep_association_open: bool,
    pub connection_timeout_secs: u32,
    pub query_retrieve_enabled: bool,
    pub storage_enabled: bool,
    pub trusted_enabled: bool,
    /// Another server used to re-dispatch retrieves (§4.6).
    #[serde(default)]
    pub proxy: Option<Box<Server>>,
}

impl Server {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            host: String::new(),
            port: 80,
            retrieve_protocol: RetrieveProtocol::CGet,
            move_destination_ae_title: String::new(),
            keep_association_open: true,
            connection_timeout_secs: 10,
            query_retrieve_enabled: true,
            storage_enabled: true,
            trusted_enabled: true,
            proxy: None,
        }
    }

    /// Explicit deep clone, matching the reference client's `Q_INVOKABLE clone()`.
    pub fn clone_deep(&self) -> Server {
        self.clone()
    }

    pub fn has_enabled_proxy(&self) -> bool {
        self.proxy.as_deref().is_some_and(|p| p.query_retrieve_enabled)
    }
}

// ============================================================================
// ResponseSet / ResponseSetDetail
// ============================================================================

/// One opaque unit of delivery from an Operation to the Inserter.
///
/// `datasets` is deliberately opaque (`Vec<u8>` blobs keyed by UID): the
/// wire/codec layer that produces real pixel data is out of scope here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSet {
    pub job_type: JobType,
    pub job_id: JobId,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub connection_name: String,
    pub file_path: Option<String>,
    pub copy_file: bool,
    pub overwrite_existing: bool,
    /// Either a single dataset or one keyed by UID, represented uniformly.
    pub datasets: HashMap<String, Vec<u8>>,
}

impl ResponseSet {
    pub fn new(job_type: JobType, job_id: JobId, connection_name: impl Into<String>) -> Self {
        Self {
            job_type,
            job_id,
            patient_id: None,
            study_instance_uid: None,
            series_instance_uid: None,
            sop_instance_uid: None,
            connection_name: connection_name.into(),
            file_path: None,
            copy_file: false,
            overwrite_existing: false,
            datasets: HashMap::new(),
        }
    }

    pub fn number_of_datasets(&self) -> usize {
        self.datasets.len().max(usize::from(!self.datasets.is_empty() || self.file_path.is_some()))
    }
}

/// Projection of a Job and/or ResponseSet emitted as an event payload.
///
/// Pure value; carries no ownership of the job or its datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    pub job_class: JobType,
    pub job_id: JobId,
    pub dicom_level: DicomLevel,
    pub patient_id: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub connection_name: String,
    pub reference_inserter_job_id: Option<JobId>,
    pub number_of_datasets: usize,
    pub queried_patient_ids: Vec<String>,
    pub queried_study_instance_uids: Vec<String>,
    pub queried_series_instance_uids: Vec<String>,
    pub queried_sop_instance_uids: Vec<String>,
}

// ============================================================================
// Error taxonomy (§7)
// ============================================================================

/// Shared error taxonomy. Kinds, not string-matched messages.
#[derive(Debug, Error, Clone)]
pub enum DcsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("DIMSE protocol failure: {0}")]
    Protocol(String),
    #[error("operation was canceled by the user")]
    UserCanceled,
    #[error("store failure: {0}")]
    StoreFailure(String),
    #[error("retries exhausted after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_reference_client() {
        let s = Server::new("PACS1");
        assert_eq!(s.port, 80);
        assert_eq!(s.connection_timeout_secs, 10);
        assert!(s.keep_association_open);
        assert_eq!(s.retrieve_protocol, RetrieveProtocol::CGet);
        assert!(s.query_retrieve_enabled && s.storage_enabled && s.trusted_enabled);
    }

    #[test]
    fn retrieve_protocol_round_trips_as_string() {
        assert_eq!("CGET".parse::<RetrieveProtocol>().unwrap(), RetrieveProtocol::CGet);
        assert_eq!("cmove".parse::<RetrieveProtocol>().unwrap(), RetrieveProtocol::CMove);
        assert_eq!(RetrieveProtocol::CMove.as_str(), "CMOVE");
        assert!("WADO".parse::<RetrieveProtocol>().is_err());
    }

    #[test]
    fn proxy_enabled_check_short_circuits_when_absent() {
        let s = Server::new("PACS1");
        assert!(!s.has_enabled_proxy());
    }

    #[test]
    fn priority_admission_order_is_descending() {
        assert_eq!(PRIORITY_ADMISSION_ORDER[0], Priority::Highest);
        assert_eq!(PRIORITY_ADMISSION_ORDER[4], Priority::Lowest);
        assert!(Priority::Highest > Priority::Lowest);
    }

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Finished.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::UserStopped.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::AttemptFailed.is_terminal());
    }
}
