//! Trait contracts for the two external collaborators the scheduler core
//! depends on but does not implement: the DICOM wire-protocol engine
//! (`Operation`) and the local indexed store (`Store`).
//!
//! Concrete DICOM/database backends live outside this repository; the
//! `testing` module here ships the in-memory doubles the scheduler's own
//! test suite is built against.

pub mod testing;

use std::collections::HashMap;

use async_trait::async_trait;
use dcs_common::{DcsError, ResponseSet};
use thiserror::Error;

/// Errors an [`Operation`] attempt can fail with.
#[derive(Debug, Error, Clone)]
pub enum OperationError {
    #[error("association or I/O failure: {0}")]
    TransientNetwork(String),
    #[error("DIMSE status failure: {0}")]
    Protocol(String),
    #[error("operation was canceled")]
    Canceled,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl From<OperationError> for DcsError {
    fn from(e: OperationError) -> Self {
        match e {
            OperationError::TransientNetwork(m) => DcsError::TransientNetwork(m),
            OperationError::Protocol(m) => DcsError::Protocol(m),
            OperationError::Canceled => DcsError::UserCanceled,
            OperationError::InvalidInput(m) => DcsError::InvalidInput(m),
            OperationError::NotImplemented(m) => DcsError::Protocol(m),
        }
    }
}

/// Errors a [`Store`] write can fail with.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store failure: {0}")]
    Failure(String),
}

impl From<StoreError> for DcsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Failure(m) => DcsError::StoreFailure(m),
        }
    }
}

/// Connection parameters a Worker seeds into an [`Operation`] before
/// invoking it, mirroring `ctkDICOMServer`'s Q_PROPERTY surface.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    pub connection_name: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub host: String,
    pub port: u16,
    pub connection_timeout_secs: u32,
    pub move_destination_ae_title: String,
    pub keep_association_open: bool,
    pub job_id: String,
    pub filters: HashMap<String, String>,
}

/// The DICOM network action the Worker drives to completion for one Job.
///
/// Every method that performs network I/O returns `Result<(), OperationError>`
/// rather than the reference client's `bool`, so a Worker can classify a
/// failure (transient vs. protocol vs. canceled) without string matching.
/// Regardless of the returned `Result`, the Worker must additionally consult
/// [`Operation::was_canceled`] — a canceled operation is never a retry
/// candidate even if it happens to return `Ok(())` for some in-flight partial
/// work.
#[async_trait]
pub trait Operation: Send + Sync {
    fn configure(&mut self, params: ConnectionParams);

    async fn query_patients(&self) -> Result<(), OperationError>;
    async fn query_studies(&self, patient_id: &str) -> Result<(), OperationError>;
    async fn query_series(&self, patient_id: &str, study_uid: &str) -> Result<(), OperationError>;
    async fn query_instances(
        &self,
        patient_id: &str,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<(), OperationError>;

    async fn get_study(&self, study_uid: &str, patient_id: &str) -> Result<(), OperationError>;
    async fn get_series(
        &self,
        study_uid: &str,
        series_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError>;
    async fn get_sop_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError>;

    async fn move_study(&self, study_uid: &str, patient_id: &str) -> Result<(), OperationError>;
    async fn move_series(
        &self,
        study_uid: &str,
        series_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError>;
    async fn move_sop_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError>;

    async fn echo(&self) -> Result<(), OperationError>;

    /// Blocks until `cancel()` is observed. Used by the storage listener job.
    async fn listen(&self) -> Result<(), OperationError>;

    /// Thread-safe; flips the operation's internal cancel flag.
    fn cancel(&self);
    fn was_canceled(&self) -> bool;

    /// Datasets accumulated by the operation so far. Drained by the Worker
    /// after the call returns (and, for `listen()`, periodically while it
    /// runs — see the storage listener's batch-flush tick).
    fn drain_response_sets(&self) -> Vec<ResponseSet>;
}

/// Produces a fresh [`Operation`] instance per Job, the way a Worker needs
/// one Operation per run rather than a shared, stateful singleton.
pub trait OperationFactory: Send + Sync {
    fn create(&self) -> Box<dyn Operation>;
}

/// The local indexed DICOM database the Inserter writes into.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_batch(&self, sets: Vec<ResponseSet>) -> Result<(), StoreError>;
    fn tags_to_precache(&self) -> Vec<String>;
    fn tags_to_exclude_from_storage(&self) -> Vec<String>;
    fn database_filename(&self) -> String;
}

/// The thumbnail rendering engine a `ThumbnailGenerator` job drives. Kept
/// separate from `Operation` because it never touches the network — it
/// reads an already-stored instance and produces one cached image.
#[async_trait]
pub trait ThumbnailEngine: Send + Sync {
    async fn generate(&self, sop_instance_uid: &str) -> Result<(), OperationError>;
}
