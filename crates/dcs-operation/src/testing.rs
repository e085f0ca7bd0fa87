//! In-memory test doubles for [`Operation`](crate::Operation) and
//! [`Store`](crate::Store), in the spirit of the `Mediator` test fakes the
//! rest of this workspace drives its pool/manager tests against: no network,
//! fully scriptable, with a recorded call log a test can assert against.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dcs_common::ResponseSet;
use parking_lot::Mutex;

use crate::{
    ConnectionParams, Operation, OperationError, OperationFactory, Store, StoreError,
    ThumbnailEngine,
};

/// Shared state across every `StubOperation` a `StubOperationFactory`
/// produces, so a test can script "fails on attempt 1, succeeds on attempt
/// 2" even though the Worker creates a fresh `Operation` per retry clone.
struct SharedScript {
    outcomes: Mutex<VecDeque<Result<(), OperationError>>>,
    default_outcome: Result<(), OperationError>,
    calls: Mutex<Vec<String>>,
    response_sets: Mutex<Vec<ResponseSet>>,
}

/// A scriptable, in-memory stand-in for a DICOM wire-protocol engine.
pub struct StubOperation {
    script: Arc<SharedScript>,
    canceled: Arc<AtomicBool>,
    params: Mutex<ConnectionParams>,
}

impl StubOperation {
    fn record(&self, call: impl Into<String>) {
        self.script.calls.lock().push(call.into());
    }

    fn next_outcome(&self) -> Result<(), OperationError> {
        let mut outcomes = self.script.outcomes.lock();
        outcomes.pop_front().unwrap_or_else(|| self.script.default_outcome.clone())
    }

    async fn run(&self, call: impl Into<String>) -> Result<(), OperationError> {
        self.record(call);
        if self.canceled.load(Ordering::SeqCst) {
            return Err(OperationError::Canceled);
        }
        self.next_outcome()
    }
}

#[async_trait]
impl Operation for StubOperation {
    fn configure(&mut self, params: ConnectionParams) {
        *self.params.lock() = params;
    }

    async fn query_patients(&self) -> Result<(), OperationError> {
        self.run("query_patients").await
    }

    async fn query_studies(&self, patient_id: &str) -> Result<(), OperationError> {
        self.run(format!("query_studies({patient_id})")).await
    }

    async fn query_series(&self, patient_id: &str, study_uid: &str) -> Result<(), OperationError> {
        self.run(format!("query_series({patient_id},{study_uid})")).await
    }

    async fn query_instances(
        &self,
        patient_id: &str,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<(), OperationError> {
        self.run(format!("query_instances({patient_id},{study_uid},{series_uid})"))
            .await
    }

    async fn get_study(&self, study_uid: &str, patient_id: &str) -> Result<(), OperationError> {
        self.run(format!("get_study({study_uid},{patient_id})")).await
    }

    async fn get_series(
        &self,
        study_uid: &str,
        series_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError> {
        self.run(format!("get_series({study_uid},{series_uid},{patient_id})"))
            .await
    }

    async fn get_sop_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError> {
        self.run(format!(
            "get_sop_instance({study_uid},{series_uid},{sop_uid},{patient_id})"
        ))
        .await
    }

    async fn move_study(&self, study_uid: &str, patient_id: &str) -> Result<(), OperationError> {
        self.run(format!("move_study({study_uid},{patient_id})")).await
    }

    async fn move_series(
        &self,
        study_uid: &str,
        series_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError> {
        self.run(format!("move_series({study_uid},{series_uid},{patient_id})"))
            .await
    }

    async fn move_sop_instance(
        &self,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
        patient_id: &str,
    ) -> Result<(), OperationError> {
        self.run(format!(
            "move_sop_instance({study_uid},{series_uid},{sop_uid},{patient_id})"
        ))
        .await
    }

    async fn echo(&self) -> Result<(), OperationError> {
        self.run("echo").await
    }

    async fn listen(&self) -> Result<(), OperationError> {
        self.record("listen");
        while !self.canceled.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn was_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn drain_response_sets(&self) -> Vec<ResponseSet> {
        std::mem::take(&mut self.script.response_sets.lock())
    }
}

/// Builds [`StubOperation`]s that all share one scripted outcome queue and
/// call log, so multi-attempt scenarios (retry, proxy re-dispatch) can be
/// asserted against a single factory handle.
#[derive(Clone)]
pub struct StubOperationFactory {
    script: Arc<SharedScript>,
}

impl StubOperationFactory {
    /// Every call to every produced `Operation` succeeds and yields no
    /// response sets.
    pub fn always_succeeds() -> Self {
        Self {
            script: Arc::new(SharedScript {
                outcomes: Mutex::new(VecDeque::new()),
                default_outcome: Ok(()),
                calls: Mutex::new(Vec::new()),
                response_sets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Every call fails with the given error until explicitly reconfigured.
    pub fn always_fails(err: OperationError) -> Self {
        Self {
            script: Arc::new(SharedScript {
                outcomes: Mutex::new(VecDeque::new()),
                default_outcome: Err(err),
                calls: Mutex::new(Vec::new()),
                response_sets: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queues a fixed sequence of outcomes; once exhausted, later calls fall
    /// back to `Ok(())`.
    pub fn with_scripted_outcomes(outcomes: Vec<Result<(), OperationError>>) -> Self {
        Self {
            script: Arc::new(SharedScript {
                outcomes: Mutex::new(outcomes.into()),
                default_outcome: Ok(()),
                calls: Mutex::new(Vec::new()),
                response_sets: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_response_sets(self, sets: Vec<ResponseSet>) -> Self {
        *self.script.response_sets.lock() = sets;
        self
    }

    pub fn call_log(&self) -> Vec<String> {
        self.script.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.calls.lock().len()
    }
}

impl OperationFactory for StubOperationFactory {
    fn create(&self) -> Box<dyn Operation> {
        Box::new(StubOperation {
            script: self.script.clone(),
            canceled: Arc::new(AtomicBool::new(false)),
            params: Mutex::new(ConnectionParams::default()),
        })
    }
}

/// An in-memory [`Store`]. Configurable to fail, so Inserter-failure paths
/// (§7 `StoreFailure`) can be exercised without a real database.
pub struct InMemoryStore {
    inserted: Mutex<Vec<ResponseSet>>,
    fail_inserts: AtomicBool,
    database_filename: String,
}

impl InMemoryStore {
    pub fn new(database_filename: impl Into<String>) -> Self {
        Self {
            inserted: Mutex::new(Vec::new()),
            fail_inserts: AtomicBool::new(false),
            database_filename: database_filename.into(),
        }
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn inserted(&self) -> Vec<ResponseSet> {
        self.inserted.lock().clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_batch(&self, sets: Vec<ResponseSet>) -> Result<(), StoreError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Failure("simulated disk full".to_string()));
        }
        self.inserted.lock().extend(sets);
        Ok(())
    }

    fn tags_to_precache(&self) -> Vec<String> {
        Vec::new()
    }

    fn tags_to_exclude_from_storage(&self) -> Vec<String> {
        Vec::new()
    }

    fn database_filename(&self) -> String {
        self.database_filename.clone()
    }
}

/// A thumbnail engine double that always succeeds and records each UID it
/// was asked to render.
#[derive(Default)]
pub struct StubThumbnailEngine {
    rendered: Mutex<Vec<String>>,
}

impl StubThumbnailEngine {
    pub fn rendered(&self) -> Vec<String> {
        self.rendered.lock().clone()
    }
}

#[async_trait]
impl ThumbnailEngine for StubThumbnailEngine {
    async fn generate(&self, sop_instance_uid: &str) -> Result<(), OperationError> {
        self.rendered.lock().push(sop_instance_uid.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_apply_in_order_then_fall_back_to_ok() {
        let factory = StubOperationFactory::with_scripted_outcomes(vec![
            Err(OperationError::TransientNetwork("timeout".into())),
        ]);
        let op1 = factory.create();
        assert!(op1.query_patients().await.is_err());
        let op2 = factory.create();
        assert!(op2.query_patients().await.is_ok());
        assert_eq!(factory.call_count(), 2);
    }

    #[tokio::test]
    async fn cancel_short_circuits_future_calls() {
        let factory = StubOperationFactory::always_succeeds();
        let op = factory.create();
        op.cancel();
        assert!(op.was_canceled());
        assert!(matches!(op.echo().await, Err(OperationError::Canceled)));
    }

    #[tokio::test]
    async fn store_insert_can_be_made_to_fail() {
        let store = InMemoryStore::new("test.db");
        store.set_fail_inserts(true);
        let err = store.insert_batch(vec![]).await.unwrap_err();
        assert!(matches!(err, StoreError::Failure(_)));
    }
}
