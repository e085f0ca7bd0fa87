//! The Scheduler (§4.4): admission, fairness, stop/wait operations, and the
//! public entry points that create jobs.
//!
//! The job table and server registry are each guarded by their own
//! `parking_lot::Mutex`, matching §5's "single mutex" shared-resource
//! policy — `jobs_queue` and `workers` are folded into one table here
//! (`JobEntry` carries both the record and its cancellation handle) so a
//! single lock acquisition covers both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dcs_common::{DicomLevel, JobId, JobStatus, Priority, ResponseSet, Server};
use dcs_operation::{OperationFactory, Store, ThumbnailEngine};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SchedulerEvent};
use crate::job::{JobClass, JobRecord, JobVariant};
use crate::metrics as scheduler_metrics;
use crate::registry::ServerRegistry;
use crate::settings::SchedulerSettings;
use crate::worker;

pub(crate) struct JobEntry {
    pub record: JobRecord,
    /// Flipped by `stop_all`/`stop_by_uids`; observed by the job's own
    /// worker task, which is the only place a terminal event is emitted from.
    pub cancel_flag: Arc<AtomicBool>,
}

pub(crate) struct SchedulerInner {
    pub jobs: Mutex<IndexMap<JobId, JobEntry>>,
    pub registry: Mutex<ServerRegistry>,
    pub store: Arc<dyn Store>,
    pub operation_factory: Arc<dyn OperationFactory>,
    pub thumbnail_engine: Arc<dyn ThumbnailEngine>,
    pub settings: Mutex<SchedulerSettings>,
    pub events: EventBus,
    pub admission_notify: Notify,
    pub finish_notify: Notify,
    pub running: AtomicBool,
}

impl SchedulerInner {
    /// Admission path (§4.4): assign already happened at `JobRecord::new`;
    /// insert into the table and wake the admission loop.
    pub(crate) fn admit(self: &Arc<Self>, job: JobRecord) {
        let id = job.id.clone();
        debug!(job_id = %id, class = ?job.class(), priority = ?job.priority, "admitting job");
        {
            let mut jobs = self.jobs.lock();
            jobs.insert(
                id,
                JobEntry { record: job, cancel_flag: Arc::new(AtomicBool::new(false)) },
            );
        }
        self.events.emit(SchedulerEvent::QueueJobs);
        self.admission_notify.notify_waiters();
    }

    /// Builds and admits an Inserter job over `response_sets`, which the
    /// caller must already own a standalone copy of if it wants to retain
    /// visibility after this call (§4.5 "ResponseSet hand-off").
    pub(crate) fn insert_response_sets_internal(
        self: &Arc<Self>,
        response_sets: Vec<ResponseSet>,
        priority: Priority,
    ) -> JobId {
        let (maximum_retries, retry_delay_ms) = self.retry_policy();
        let mut job = JobRecord::new(
            JobVariant::Inserter {
                database_filename: self.store.database_filename(),
                tags_to_precache: self.store.tags_to_precache(),
                tags_to_exclude_from_storage: self.store.tags_to_exclude_from_storage(),
            },
            DicomLevel::None,
            priority,
            maximum_retries,
            retry_delay_ms,
        );
        job.response_sets = response_sets;
        let id = job.id.clone();
        self.admit(job);
        id
    }

    /// Current `(maximum_retries, retry_delay_ms)` from `SchedulerSettings`
    /// (§6), read fresh at each job-creation call site so a config reload
    /// takes effect for every job admitted afterward.
    pub(crate) fn retry_policy(&self) -> (u32, u64) {
        let settings = self.settings.lock();
        (settings.maximum_retries, settings.retry_delay_ms)
    }

    fn non_persistent_count(&self) -> usize {
        self.jobs.lock().values().filter(|e| !e.record.is_persistent).count()
    }

    fn non_persistent_count_matching(
        &self,
        patient_ids: &[String],
        study_uids: &[String],
        series_uids: &[String],
        sop_uids: &[String],
    ) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|e| !e.record.is_persistent)
            .filter(|e| matches_uids(&e.record, patient_ids, study_uids, series_uids, sop_uids))
            .count()
    }

    /// Admission loop (§4.4 `on_queue_jobs_in_thread_pool`). For each
    /// priority level, descending, admits every `Initialized` job of a class
    /// still under its concurrency cap, in table (insertion) order.
    fn run_admission_pass(self: &Arc<Self>) {
        let maximum_thread_count = self.settings.lock().maximum_thread_count;
        let mut jobs = self.jobs.lock();

        let total_active = jobs
            .values()
            .filter(|e| matches!(e.record.status, JobStatus::Queued | JobStatus::Running))
            .count();
        if total_active >= maximum_thread_count {
            return;
        }
        let mut free_slots = maximum_thread_count - total_active;

        for priority in dcs_common::PRIORITY_ADMISSION_ORDER {
            if free_slots == 0 {
                break;
            }
            let candidate_ids: Vec<JobId> = jobs
                .iter()
                .filter(|(_, e)| e.record.priority == priority && e.record.status == JobStatus::Initialized)
                .map(|(id, _)| id.clone())
                .collect();

            for id in candidate_ids {
                if free_slots == 0 {
                    break;
                }
                let class = jobs[&id].record.class();
                let running_count = jobs
                    .values()
                    .filter(|e| e.record.class() == class && matches!(e.record.status, JobStatus::Queued | JobStatus::Running))
                    .count();
                let cap = jobs[&id].record.maximum_concurrent_per_type as usize;
                if running_count >= cap {
                    continue;
                }

                let entry = jobs.get_mut(&id).expect("candidate id just read from this map");
                entry.record.status = JobStatus::Queued;
                let cancel_flag = entry.cancel_flag.clone();
                let record = entry.record.clone();
                free_slots -= 1;

                let inner = self.clone();
                tokio::spawn(async move {
                    worker::run_job(inner, record, cancel_flag).await;
                });
            }
        }

        let mut active_by_class: HashMap<JobClass, usize> = HashMap::new();
        for entry in jobs.values().filter(|e| matches!(e.record.status, JobStatus::Queued | JobStatus::Running)) {
            *active_by_class.entry(entry.record.class()).or_insert(0) += 1;
        }
        for (class, count) in active_by_class {
            scheduler_metrics::set_active_job_count(&format!("{class:?}"), count);
        }
    }
}

fn matches_uids(
    record: &JobRecord,
    patient_ids: &[String],
    study_uids: &[String],
    series_uids: &[String],
    sop_uids: &[String],
) -> bool {
    let dims: [(&[String], &Option<String>); 4] = [
        (patient_ids, &record.patient_id),
        (study_uids, &record.study_instance_uid),
        (series_uids, &record.series_instance_uid),
        (sop_uids, &record.sop_instance_uid),
    ];
    dims.iter()
        .any(|(list, field)| !list.is_empty() && field.as_deref().is_some_and(|v| list.iter().any(|u| u == v)))
}

/// Owns the job table, the server registry, the default retry/backoff and
/// patient-query-limit settings, and a reference to the Store.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<dyn Store>,
        operation_factory: Arc<dyn OperationFactory>,
        thumbnail_engine: Arc<dyn ThumbnailEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                jobs: Mutex::new(IndexMap::new()),
                registry: Mutex::new(ServerRegistry::new()),
                store,
                operation_factory,
                thumbnail_engine,
                settings: Mutex::new(settings),
                events: EventBus::default(),
                admission_notify: Notify::new(),
                finish_notify: Notify::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the admission loop as a background task. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }
        info!("starting scheduler admission loop");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut fallback = tokio::time::interval(Duration::from_millis(25));
            while inner.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = inner.admission_notify.notified() => {},
                    _ = fallback.tick() => {},
                }
                inner.run_admission_pass();
            }
        });
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        info!("scheduler admission loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    // -- Server registry (§4.1) ---------------------------------------

    pub fn add_server(&self, server: Server) {
        self.inner.registry.lock().add(server.clone());
        self.inner.events.emit(SchedulerEvent::ServerModified(server.connection_name));
    }

    pub fn remove_server_by_name(&self, name: &str) -> Option<Server> {
        self.inner.registry.lock().remove_by_name(name)
    }

    pub fn remove_nth_server(&self, index: usize) -> Option<Server> {
        self.inner.registry.lock().remove_nth(index)
    }

    pub fn remove_all_servers(&self) {
        self.inner.registry.lock().remove_all();
    }

    pub fn server_by_name(&self, name: &str) -> Option<Server> {
        self.inner.registry.lock().by_name(name).cloned()
    }

    pub fn nth_server(&self, index: usize) -> Option<Server> {
        self.inner.registry.lock().nth(index).cloned()
    }

    pub fn server_count(&self) -> usize {
        self.inner.registry.lock().count()
    }

    // -- Query / retrieve entry points (§2, §4.6) ----------------------

    fn fan_out_job(&self, dicom_level: DicomLevel, priority: Priority, make_variant: impl Fn(String) -> JobVariant, set_uids: impl Fn(&mut JobRecord)) -> Vec<JobId> {
        let servers = self.inner.registry.lock().query_retrieve_enabled_servers();
        let (maximum_retries, retry_delay_ms) = self.inner.retry_policy();
        let mut ids = Vec::with_capacity(servers.len());
        for server in servers {
            let mut job = JobRecord::new(make_variant(server.connection_name), dicom_level, priority, maximum_retries, retry_delay_ms);
            set_uids(&mut job);
            ids.push(job.id.clone());
            self.inner.admit(job);
        }
        ids
    }

    fn query_filters(&self) -> HashMap<String, String> {
        self.inner.settings.lock().filters.clone()
    }

    pub fn query_patients(&self, priority: Priority) -> Vec<JobId> {
        let mut filters = self.query_filters();
        // Carried into the DIMSE identifier the Operation builds, not
        // interpreted here (§3 "Filter keys").
        filters.insert("MaximumPatientsQuery".to_string(), self.inner.settings.lock().maximum_patients_query.to_string());
        self.fan_out_job(
            DicomLevel::Patients,
            priority,
            |conn| JobVariant::Query { connection_name: conn, filters: filters.clone() },
            |_| {},
        )
    }

    pub fn query_studies(&self, patient_id: impl Into<String>, priority: Priority) -> Vec<JobId> {
        let patient_id = patient_id.into();
        let filters = self.query_filters();
        self.fan_out_job(
            DicomLevel::Studies,
            priority,
            |conn| JobVariant::Query { connection_name: conn, filters: filters.clone() },
            |job| job.patient_id = Some(patient_id.clone()),
        )
    }

    pub fn query_series(&self, patient_id: impl Into<String>, study_uid: impl Into<String>, priority: Priority) -> Vec<JobId> {
        let (patient_id, study_uid) = (patient_id.into(), study_uid.into());
        let filters = self.query_filters();
        self.fan_out_job(
            DicomLevel::Series,
            priority,
            |conn| JobVariant::Query { connection_name: conn, filters: filters.clone() },
            |job| {
                job.patient_id = Some(patient_id.clone());
                job.study_instance_uid = Some(study_uid.clone());
            },
        )
    }

    pub fn query_instances(
        &self,
        patient_id: impl Into<String>,
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        priority: Priority,
    ) -> Vec<JobId> {
        let (patient_id, study_uid, series_uid) = (patient_id.into(), study_uid.into(), series_uid.into());
        let filters = self.query_filters();
        self.fan_out_job(
            DicomLevel::Instances,
            priority,
            |conn| JobVariant::Query { connection_name: conn, filters: filters.clone() },
            |job| {
                job.patient_id = Some(patient_id.clone());
                job.study_instance_uid = Some(study_uid.clone());
                job.series_instance_uid = Some(series_uid.clone());
            },
        )
    }

    pub fn retrieve_study(&self, patient_id: impl Into<String>, study_uid: impl Into<String>, priority: Priority) -> Vec<JobId> {
        let (patient_id, study_uid) = (patient_id.into(), study_uid.into());
        self.fan_out_job(
            DicomLevel::Studies,
            priority,
            |conn| JobVariant::Retrieve { connection_name: conn },
            |job| {
                job.patient_id = Some(patient_id.clone());
                job.study_instance_uid = Some(study_uid.clone());
            },
        )
    }

    pub fn retrieve_series(
        &self,
        patient_id: impl Into<String>,
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        priority: Priority,
    ) -> Vec<JobId> {
        let (patient_id, study_uid, series_uid) = (patient_id.into(), study_uid.into(), series_uid.into());
        self.fan_out_job(
            DicomLevel::Series,
            priority,
            |conn| JobVariant::Retrieve { connection_name: conn },
            |job| {
                job.patient_id = Some(patient_id.clone());
                job.study_instance_uid = Some(study_uid.clone());
                job.series_instance_uid = Some(series_uid.clone());
            },
        )
    }

    pub fn retrieve_sop_instance(
        &self,
        patient_id: impl Into<String>,
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        sop_uid: impl Into<String>,
        priority: Priority,
    ) -> Vec<JobId> {
        let (patient_id, study_uid, series_uid, sop_uid) =
            (patient_id.into(), study_uid.into(), series_uid.into(), sop_uid.into());
        self.fan_out_job(
            DicomLevel::Instances,
            priority,
            |conn| JobVariant::Retrieve { connection_name: conn },
            |job| {
                job.patient_id = Some(patient_id.clone());
                job.study_instance_uid = Some(study_uid.clone());
                job.series_instance_uid = Some(series_uid.clone());
                job.sop_instance_uid = Some(sop_uid.clone());
            },
        )
    }

    /// Echo targets exactly one named server, unlike the query/retrieve
    /// entry points which fan out across every query-retrieve-enabled one.
    pub fn echo(&self, connection_name: impl Into<String>, priority: Priority) -> Option<JobId> {
        let connection_name = connection_name.into();
        if self.inner.registry.lock().by_name(&connection_name).is_none() {
            warn!(connection_name = %connection_name, "echo requested against unknown server");
            return None;
        }
        let (maximum_retries, retry_delay_ms) = self.inner.retry_policy();
        let job = JobRecord::new(JobVariant::Echo { connection_name }, DicomLevel::None, priority, maximum_retries, retry_delay_ms);
        let id = job.id.clone();
        self.inner.admit(job);
        Some(id)
    }

    pub fn start_listener(&self, port: u16, ae_title: impl Into<String>, priority: Priority) -> JobId {
        let listener_batch_limit = self.inner.settings.lock().listener_batch_limit;
        let (maximum_retries, retry_delay_ms) = self.inner.retry_policy();
        let job = JobRecord::new(
            JobVariant::StorageListener {
                ae_title: ae_title.into(),
                port,
                connection_timeout_secs: 10,
                listener_batch_limit,
            },
            DicomLevel::None,
            priority,
            maximum_retries,
            retry_delay_ms,
        );
        let id = job.id.clone();
        self.inner.admit(job);
        id
    }

    pub fn is_storage_listener_active(&self) -> bool {
        self.inner
            .jobs
            .lock()
            .values()
            .any(|e| e.record.class() == JobClass::StorageListener && matches!(e.record.status, JobStatus::Queued | JobStatus::Running))
    }

    /// Enqueues an Inserter job over `response_sets`, returning its id. This
    /// is both a public entry point (callers ingesting externally-acquired
    /// datasets) and what Workers call internally after a successful run.
    pub fn insert_response_sets(&self, response_sets: Vec<ResponseSet>, priority: Priority) -> JobId {
        self.inner.insert_response_sets_internal(response_sets, priority)
    }

    // -- Stop / wait / priority operations (§4.4) -----------------------

    pub fn stop_all(&self, include_persistent: bool) {
        let mut jobs = self.inner.jobs.lock();
        jobs.retain(|_, e| e.record.status != JobStatus::Initialized);
        for entry in jobs.values_mut() {
            let active = matches!(entry.record.status, JobStatus::Queued | JobStatus::Running);
            if active && (include_persistent || !entry.record.is_persistent) {
                entry.record.status = JobStatus::UserStopped;
                entry.cancel_flag.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn stop_by_uids(&self, patient_ids: &[String], study_uids: &[String], series_uids: &[String], sop_uids: &[String]) {
        let mut jobs = self.inner.jobs.lock();
        let matching: Vec<JobId> = jobs
            .iter()
            .filter(|(_, e)| matches_uids(&e.record, patient_ids, study_uids, series_uids, sop_uids))
            .map(|(id, _)| id.clone())
            .collect();

        for id in matching {
            let Some(entry) = jobs.get_mut(&id) else { continue };
            match entry.record.status {
                JobStatus::Initialized => {
                    jobs.shift_remove(&id);
                }
                JobStatus::Queued | JobStatus::Running => {
                    entry.record.status = JobStatus::UserStopped;
                    entry.cancel_flag.store(true, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    pub fn raise_priority_for_series(&self, series_uids: &[String], priority: Priority) {
        let mut jobs = self.inner.jobs.lock();
        for entry in jobs.values_mut() {
            if entry.record.is_persistent {
                continue;
            }
            let matches = entry
                .record
                .series_instance_uid
                .as_deref()
                .is_some_and(|s| series_uids.iter().any(|u| u == s));
            entry.record.priority = if matches { priority } else { Priority::Low };
        }
        drop(jobs);
        self.inner.admission_notify.notify_waiters();
    }

    /// Blocks until the number of non-persistent jobs in the table reaches
    /// zero, alternating short waits with polling (§5).
    pub async fn wait_for_finish(&self) {
        loop {
            if self.inner.non_persistent_count() == 0 {
                return;
            }
            tokio::select! {
                _ = self.inner.finish_notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(20)) => {},
            }
        }
    }

    pub async fn wait_for_finish_by_uids(
        &self,
        patient_ids: &[String],
        study_uids: &[String],
        series_uids: &[String],
        sop_uids: &[String],
    ) {
        loop {
            if self.inner.non_persistent_count_matching(patient_ids, study_uids, series_uids, sop_uids) == 0 {
                // Re-scan once more under the mutex before declaring done: a
                // retry clone may have been admitted after the first zero
                // reading but before this check (see SPEC_FULL.md §9).
                tokio::task::yield_now().await;
                if self.inner.non_persistent_count_matching(patient_ids, study_uids, series_uids, sop_uids) == 0 {
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = self.inner.finish_notify.notified() => {},
                _ = tokio::time::sleep(Duration::from_millis(20)) => {},
            }
        }
    }
}
