//! Worker dispatch (§4.3, §4.6, §4.7): runs one Job to completion, including
//! retry-with-backoff, proxy re-chaining, and inserter hand-off.
//!
//! There is no `Worker` struct distinct from this function: the reference
//! client's Worker is the object that owns a running Operation and answers
//! `cancel()`; here that role is played by the spawned task itself plus the
//! `Arc<AtomicBool>` cancel flag threaded in from the job table, which keeps
//! the Scheduler ↔ Worker ↔ Job cycle from needing owning references in both
//! directions (§9 "cyclic references").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dcs_common::{DcsError, DicomLevel, JobId, JobStatus, Priority, ResponseSet, RetrieveProtocol, Server};
use dcs_operation::{ConnectionParams, Operation, OperationError};
use tracing::{error, info, warn};

use crate::events::SchedulerEvent;
use crate::job::{JobRecord, JobVariant};
use crate::metrics;
use crate::scheduler::SchedulerInner;

enum Outcome {
    Success { response_sets: Vec<ResponseSet>, persist_via_inserter: bool },
    ProxyRedispatch { proxy_connection_name: String },
    Canceled,
    /// The Inserter class's cancel contract is "finish anyway, partial
    /// inserts accepted" rather than the generic UserStopped path (§4.5).
    InserterCanceled,
    ListenerStopped,
    Failed(DcsError),
}

pub(crate) async fn run_job(inner: Arc<SchedulerInner>, mut record: JobRecord, cancel_flag: Arc<AtomicBool>) {
    if cancel_flag.load(Ordering::SeqCst) || !inner.running.load(Ordering::SeqCst) {
        metrics::record_job_canceled(&record.job_type().to_string());
        finalize(&inner, record, JobStatus::UserStopped, SchedulerEvent::JobCanceled);
        return;
    }

    set_status_running(&inner, &record.id);
    inner.events.emit(SchedulerEvent::JobStarted(record.to_detail()));
    let job_type = record.job_type().to_string();
    metrics::record_job_started(&job_type);
    let started_at = std::time::Instant::now();

    let outcome = match record.variant.clone() {
        JobVariant::Query { connection_name, filters } => run_query(&inner, &record, &connection_name, filters, &cancel_flag).await,
        JobVariant::Retrieve { connection_name } => run_retrieve(&inner, &record, &connection_name, &cancel_flag).await,
        JobVariant::Echo { connection_name } => run_echo(&inner, &record, &connection_name, &cancel_flag).await,
        JobVariant::StorageListener { ae_title, port, connection_timeout_secs, listener_batch_limit } => {
            run_listener(&inner, &record, &ae_title, port, connection_timeout_secs, listener_batch_limit, &cancel_flag).await
        }
        JobVariant::Inserter { .. } => run_inserter(&inner, &mut record, &cancel_flag).await,
        JobVariant::ThumbnailGenerator => run_thumbnail(&inner, &record, &cancel_flag).await,
    };

    metrics::record_job_duration(&job_type, started_at.elapsed());
    apply_outcome(&inner, &job_type, record, outcome);
}

fn set_status_running(inner: &Arc<SchedulerInner>, id: &JobId) {
    let mut jobs = inner.jobs.lock();
    if let Some(entry) = jobs.get_mut(id) {
        entry.record.status = JobStatus::Running;
    }
}

fn lookup_server(inner: &Arc<SchedulerInner>, connection_name: &str) -> Option<Server> {
    inner.registry.lock().by_name(connection_name).cloned()
}

fn connection_params(record: &JobRecord, server: &Server, filters: std::collections::HashMap<String, String>) -> ConnectionParams {
    ConnectionParams {
        connection_name: server.connection_name.clone(),
        calling_ae_title: server.calling_ae_title.clone(),
        called_ae_title: server.called_ae_title.clone(),
        host: server.host.clone(),
        port: server.port,
        connection_timeout_secs: server.connection_timeout_secs,
        move_destination_ae_title: server.move_destination_ae_title.clone(),
        keep_association_open: server.keep_association_open,
        job_id: record.id.clone(),
        filters,
    }
}

/// Bridges the scheduler-level cancel flag to `Operation::cancel()`: a real
/// DICOM engine would check this inside its own socket read loop, which we
/// can't reach into from out here, so a small watcher polls it instead.
fn spawn_cancel_watcher(op: Arc<dyn Operation>, cancel_flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while !cancel_flag.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        op.cancel();
    })
}

fn classify_error(op: &dyn Operation, err: OperationError) -> Outcome {
    if op.was_canceled() || matches!(err, OperationError::Canceled) {
        Outcome::Canceled
    } else {
        Outcome::Failed(err.into())
    }
}

async fn run_query(
    inner: &Arc<SchedulerInner>,
    record: &JobRecord,
    connection_name: &str,
    filters: std::collections::HashMap<String, String>,
    cancel_flag: &Arc<AtomicBool>,
) -> Outcome {
    let Some(server) = lookup_server(inner, connection_name) else {
        return Outcome::Failed(DcsError::InvalidInput(format!("unknown server '{connection_name}'")));
    };
    let mut op = inner.operation_factory.create();
    op.configure(connection_params(record, &server, filters));
    let op: Arc<dyn Operation> = Arc::from(op);
    let watcher = spawn_cancel_watcher(op.clone(), cancel_flag.clone());

    let result = match record.dicom_level {
        DicomLevel::Patients => op.query_patients().await,
        DicomLevel::Studies => op.query_studies(record.patient_id.as_deref().unwrap_or_default()).await,
        DicomLevel::Series => {
            op.query_series(record.patient_id.as_deref().unwrap_or_default(), record.study_instance_uid.as_deref().unwrap_or_default())
                .await
        }
        DicomLevel::Instances => {
            op.query_instances(
                record.patient_id.as_deref().unwrap_or_default(),
                record.study_instance_uid.as_deref().unwrap_or_default(),
                record.series_instance_uid.as_deref().unwrap_or_default(),
            )
            .await
        }
        DicomLevel::None => Ok(()),
    };
    watcher.abort();

    match result {
        Ok(()) => {
            let response_sets = op.drain_response_sets();
            let persist = !response_sets.is_empty();
            Outcome::Success { response_sets, persist_via_inserter: persist }
        }
        Err(e) => classify_error(op.as_ref(), e),
    }
}

async fn run_retrieve(inner: &Arc<SchedulerInner>, record: &JobRecord, connection_name: &str, cancel_flag: &Arc<AtomicBool>) -> Outcome {
    let Some(server) = lookup_server(inner, connection_name) else {
        return Outcome::Failed(DcsError::InvalidInput(format!("unknown server '{connection_name}'")));
    };

    if record.dicom_level == DicomLevel::Patients {
        warn!(job_id = %record.id, "retrieve requested at the patient level, which has no DIMSE equivalent; finishing as a no-op");
        return Outcome::Success { response_sets: Vec::new(), persist_via_inserter: false };
    }

    let mut op = inner.operation_factory.create();
    op.configure(connection_params(record, &server, Default::default()));
    let op: Arc<dyn Operation> = Arc::from(op);
    let watcher = spawn_cancel_watcher(op.clone(), cancel_flag.clone());

    let patient_id = record.patient_id.as_deref().unwrap_or_default();
    let study_uid = record.study_instance_uid.as_deref().unwrap_or_default();
    let series_uid = record.series_instance_uid.as_deref().unwrap_or_default();
    let sop_uid = record.sop_instance_uid.as_deref().unwrap_or_default();

    let result = match (server.retrieve_protocol, record.dicom_level) {
        (RetrieveProtocol::CGet, DicomLevel::Studies) => op.get_study(study_uid, patient_id).await,
        (RetrieveProtocol::CGet, DicomLevel::Series) => op.get_series(study_uid, series_uid, patient_id).await,
        (RetrieveProtocol::CGet, DicomLevel::Instances) => op.get_sop_instance(study_uid, series_uid, sop_uid, patient_id).await,
        (RetrieveProtocol::CMove, DicomLevel::Studies) => op.move_study(study_uid, patient_id).await,
        (RetrieveProtocol::CMove, DicomLevel::Series) => op.move_series(study_uid, series_uid, patient_id).await,
        (RetrieveProtocol::CMove, DicomLevel::Instances) => op.move_sop_instance(study_uid, series_uid, sop_uid, patient_id).await,
        _ => Ok(()),
    };
    watcher.abort();

    match result {
        Ok(()) => {
            if server.has_enabled_proxy() {
                let proxy_connection_name = server.proxy.as_ref().expect("has_enabled_proxy implies Some").connection_name.clone();
                return Outcome::ProxyRedispatch { proxy_connection_name };
            }
            let response_sets = op.drain_response_sets();
            let persist = server.retrieve_protocol == RetrieveProtocol::CGet && !response_sets.is_empty();
            Outcome::Success { response_sets, persist_via_inserter: persist }
        }
        Err(e) => classify_error(op.as_ref(), e),
    }
}

async fn run_echo(inner: &Arc<SchedulerInner>, record: &JobRecord, connection_name: &str, cancel_flag: &Arc<AtomicBool>) -> Outcome {
    let Some(server) = lookup_server(inner, connection_name) else {
        return Outcome::Failed(DcsError::InvalidInput(format!("unknown server '{connection_name}'")));
    };
    let mut op = inner.operation_factory.create();
    op.configure(connection_params(record, &server, Default::default()));
    let op: Arc<dyn Operation> = Arc::from(op);
    let watcher = spawn_cancel_watcher(op.clone(), cancel_flag.clone());

    let result = op.echo().await;
    watcher.abort();

    match result {
        Ok(()) => Outcome::Success { response_sets: Vec::new(), persist_via_inserter: false },
        Err(e) => classify_error(op.as_ref(), e),
    }
}

async fn run_listener(
    inner: &Arc<SchedulerInner>,
    record: &JobRecord,
    ae_title: &str,
    port: u16,
    connection_timeout_secs: u32,
    listener_batch_limit: usize,
    cancel_flag: &Arc<AtomicBool>,
) -> Outcome {
    let mut op = inner.operation_factory.create();
    op.configure(ConnectionParams {
        connection_name: ae_title.to_string(),
        calling_ae_title: ae_title.to_string(),
        called_ae_title: ae_title.to_string(),
        host: String::new(),
        port,
        connection_timeout_secs,
        move_destination_ae_title: String::new(),
        keep_association_open: true,
        job_id: record.id.clone(),
        filters: Default::default(),
    });
    let op: Arc<dyn Operation> = Arc::from(op);
    let watcher = spawn_cancel_watcher(op.clone(), cancel_flag.clone());

    let mut listen_fut = Box::pin(op.listen());
    let mut flush = tokio::time::interval(Duration::from_secs(1));
    let outcome = loop {
        tokio::select! {
            result = &mut listen_fut => {
                break match result {
                    Ok(()) if cancel_flag.load(Ordering::SeqCst) => Outcome::Canceled,
                    Ok(()) => Outcome::ListenerStopped,
                    Err(e) => classify_error(op.as_ref(), e),
                };
            }
            _ = flush.tick() => {
                let sets = op.drain_response_sets();
                if !sets.is_empty() {
                    for chunk in sets.chunks(listener_batch_limit) {
                        inner.insert_response_sets_internal(chunk.to_vec(), Priority::High);
                    }
                }
            }
        }
    };
    watcher.abort();
    outcome
}

async fn run_inserter(inner: &Arc<SchedulerInner>, record: &mut JobRecord, cancel_flag: &Arc<AtomicBool>) -> Outcome {
    if cancel_flag.load(Ordering::SeqCst) {
        return Outcome::InserterCanceled;
    }
    let response_sets = std::mem::take(&mut record.response_sets);
    // Keep a copy for the progress detail: `insert_batch` consumes its
    // argument, but `apply_outcome` needs the persisted sets to report what
    // was actually inserted (§4.5 "emit a progress_job_detail per response
    // set").
    let persisted = response_sets.clone();
    match inner.store.insert_batch(response_sets).await {
        Ok(()) => Outcome::Success { response_sets: persisted, persist_via_inserter: false },
        Err(e) => Outcome::Failed(e.into()),
    }
}

async fn run_thumbnail(inner: &Arc<SchedulerInner>, record: &JobRecord, cancel_flag: &Arc<AtomicBool>) -> Outcome {
    if cancel_flag.load(Ordering::SeqCst) {
        return Outcome::Canceled;
    }
    let sop_uid = record.sop_instance_uid.as_deref().unwrap_or_default();
    match inner.thumbnail_engine.generate(sop_uid).await {
        Ok(()) => Outcome::Success { response_sets: Vec::new(), persist_via_inserter: false },
        Err(e) => classify_thumbnail_error(e),
    }
}

fn classify_thumbnail_error(err: OperationError) -> Outcome {
    if matches!(err, OperationError::Canceled) {
        Outcome::Canceled
    } else {
        Outcome::Failed(err.into())
    }
}

fn finalize(inner: &Arc<SchedulerInner>, mut record: JobRecord, status: JobStatus, make_event: impl FnOnce(dcs_common::JobDetail) -> SchedulerEvent) {
    record.status = status;
    let detail = record.to_detail();
    {
        let mut jobs = inner.jobs.lock();
        if record.is_persistent {
            if let Some(entry) = jobs.get_mut(&record.id) {
                entry.record = record;
            }
        } else {
            jobs.shift_remove(&record.id);
        }
    }
    inner.events.emit(make_event(detail));
    inner.finish_notify.notify_waiters();
    inner.admission_notify.notify_waiters();
}

fn apply_outcome(inner: &Arc<SchedulerInner>, job_type: &str, mut record: JobRecord, outcome: Outcome) {
    match outcome {
        Outcome::Canceled => {
            info!(job_id = %record.id, "job canceled");
            metrics::record_job_canceled(job_type);
            finalize(inner, record, JobStatus::UserStopped, SchedulerEvent::JobCanceled);
        }
        Outcome::InserterCanceled => {
            metrics::record_job_canceled(job_type);
            finalize(inner, record, JobStatus::Finished, SchedulerEvent::JobCanceled);
        }
        Outcome::ListenerStopped => {
            metrics::record_job_finished(job_type);
            finalize(inner, record, JobStatus::Finished, SchedulerEvent::JobFinished);
        }
        Outcome::ProxyRedispatch { proxy_connection_name } => {
            let clone = record.clone_for_proxy(proxy_connection_name);
            inner.admit(clone);
            metrics::record_job_finished(job_type);
            finalize(inner, record, JobStatus::Finished, SchedulerEvent::JobFinished);
        }
        Outcome::Success { response_sets, persist_via_inserter } => {
            record.response_sets = response_sets.clone();
            if persist_via_inserter && !response_sets.is_empty() {
                let inserter_id = inner.insert_response_sets_internal(response_sets, Priority::High);
                record.reference_inserter_job_id = Some(inserter_id);
            }
            if !record.response_sets.is_empty() {
                inner.events.emit(SchedulerEvent::ProgressJobDetail(record.to_detail()));
            }
            metrics::record_job_finished(job_type);
            finalize(inner, record, JobStatus::Finished, SchedulerEvent::JobFinished);
        }
        Outcome::Failed(err) => {
            if record.retry_counter < record.maximum_retries {
                metrics::record_job_retried(job_type);
                let delay = Duration::from_millis(record.retry_delay_ms);
                let retry_clone = record.clone_for_retry();
                let inner2 = inner.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner2.admit(retry_clone);
                });
                finalize(inner, record, JobStatus::Finished, SchedulerEvent::JobFinished);
            } else {
                error!(job_id = %record.id, error = %err, "job failed, retries exhausted");
                metrics::record_job_failed(job_type);
                finalize(inner, record, JobStatus::Failed, SchedulerEvent::JobFailed);
            }
        }
    }
}
