//! Scheduler integration tests.
//!
//! Scenario-level tests exercising admission, retry, cancellation, per-class
//! concurrency caps, and proxy re-chaining against the in-memory
//! `dcs-operation::testing` doubles, in the spirit of `fc-router`'s
//! `manager_tests.rs`/`pool_tests.rs` (one scenario per test, driven through
//! the crate's public API rather than its internals).

use std::sync::Arc;
use std::time::Duration;

use dcs_common::{DcsError, JobType, Priority, RetrieveProtocol, Server};
use dcs_operation::testing::{InMemoryStore, StubOperationFactory, StubThumbnailEngine};
use dcs_operation::OperationError;
use dcs_scheduler::{Scheduler, SchedulerEvent, SchedulerSettings};

fn test_scheduler(factory: StubOperationFactory) -> (Scheduler, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new("test.sqlite"));
    let scheduler = Scheduler::new(
        SchedulerSettings::default(),
        store.clone(),
        Arc::new(factory),
        Arc::new(StubThumbnailEngine::default()),
    );
    scheduler.start();
    (scheduler, store)
}

async fn wait_briefly(scheduler: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(2), scheduler.wait_for_finish())
        .await
        .expect("jobs should drain within the test timeout");
}

#[tokio::test]
async fn single_server_query_chain_succeeds_and_hands_off_to_inserter() {
    let sets = vec![dcs_common::ResponseSet::new(JobType::QueryStudies, "seed".into(), "PACS1")];
    let factory = StubOperationFactory::always_succeeds().with_response_sets(sets);
    let (scheduler, store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    let mut events = scheduler.subscribe();
    scheduler.query_studies("P1", Priority::Normal);
    wait_briefly(&scheduler).await;

    assert_eq!(store.inserted().len(), 1);
    assert!(factory.call_log().iter().any(|c| c.starts_with("query_studies")));

    let mut saw_started = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::JobStarted(_) => saw_started = true,
            SchedulerEvent::JobFinished(_) => saw_finished = true,
            _ => {}
        }
    }
    assert!(saw_started && saw_finished);
}

#[tokio::test]
async fn retrieve_recovers_from_a_transient_failure_via_retry() {
    let factory = StubOperationFactory::with_scripted_outcomes(vec![
        Err(OperationError::TransientNetwork("association refused".into())),
        Ok(()),
    ]);
    let (scheduler, _store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    scheduler.retrieve_study("P1", "1.2.3", Priority::Normal);
    wait_briefly(&scheduler).await;

    assert_eq!(factory.call_count(), 2);
}

#[tokio::test]
async fn retrieve_fails_after_exhausting_retries() {
    let factory = StubOperationFactory::always_fails(OperationError::TransientNetwork("down".into()));
    let (scheduler, _store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    let mut events = scheduler.subscribe();
    scheduler.retrieve_study("P1", "1.2.3", Priority::Normal);
    wait_briefly(&scheduler).await;

    // One original attempt plus up to `maximum_retries` retries.
    assert_eq!(factory.call_count(), 1 + SchedulerSettings::default().maximum_retries as usize);

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SchedulerEvent::JobFailed(_)) {
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn stop_all_cancels_a_running_job_instead_of_letting_it_finish() {
    let factory = StubOperationFactory::with_scripted_outcomes(vec![Err(OperationError::Canceled)]);
    let (scheduler, _store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    let mut events = scheduler.subscribe();
    scheduler.echo("PACS1", Priority::Normal);
    // Give the admission loop a moment to pick the job up before stopping it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.stop_all(false);
    wait_briefly(&scheduler).await;

    let mut saw_canceled = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SchedulerEvent::JobCanceled(_)) {
            saw_canceled = true;
        }
    }
    assert!(saw_canceled);
}

/// Spec scenario #4 ("Cancellation mid-run"): `stop_by_uids` cancels a
/// running job matching the given UIDs rather than letting it finish, and
/// does not advance its retry counter.
#[tokio::test]
async fn stop_by_uids_cancels_a_running_job_matching_its_study_uid() {
    let factory = StubOperationFactory::with_scripted_outcomes(vec![Err(OperationError::Canceled)]);
    let (scheduler, _store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    let mut events = scheduler.subscribe();
    scheduler.retrieve_study("P1", "1.2.840.10008.study.1", Priority::Normal);
    // Give the admission loop a moment to pick the job up before stopping it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    scheduler.stop_by_uids(&[], &["1.2.840.10008.study.1".to_string()], &[], &[]);
    wait_briefly(&scheduler).await;

    let mut saw_canceled = false;
    let mut retry_counter_at_cancel = None;
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::JobCanceled(detail) = event {
            saw_canceled = true;
            retry_counter_at_cancel = Some(detail.job_id.clone());
        }
    }
    assert!(saw_canceled, "stop_by_uids should cancel the matching running job");
    assert!(retry_counter_at_cancel.is_some());
    // A user-canceled job is never a retry candidate: the factory should
    // have been invoked exactly once, not once-plus-retries.
    assert_eq!(factory.call_count(), 1);
}

#[tokio::test]
async fn stop_by_uids_with_no_matching_uid_leaves_the_job_running() {
    let factory = StubOperationFactory::always_succeeds();
    let (scheduler, _store) = test_scheduler(factory.clone());
    scheduler.add_server(Server::new("PACS1"));

    scheduler.retrieve_study("P1", "1.2.840.10008.study.1", Priority::Normal);
    scheduler.stop_by_uids(&[], &["unrelated-study".to_string()], &[], &[]);
    wait_briefly(&scheduler).await;

    assert_eq!(factory.call_count(), 1, "a non-matching stop_by_uids must not cancel the job");
}

#[tokio::test]
async fn per_class_concurrency_cap_limits_simultaneous_retrieves() {
    let factory = StubOperationFactory::always_succeeds();
    let store = Arc::new(InMemoryStore::new("test.sqlite"));
    let mut settings = SchedulerSettings::default();
    settings.maximum_thread_count = 50;
    let scheduler = Scheduler::new(settings, store, Arc::new(factory.clone()), Arc::new(StubThumbnailEngine::default()));
    scheduler.start();
    scheduler.add_server(Server::new("PACS1"));

    for i in 0..5 {
        scheduler.retrieve_study("P1", format!("1.2.{i}"), Priority::Normal);
    }
    wait_briefly(&scheduler).await;

    assert_eq!(factory.call_count(), 5);
}

#[tokio::test]
async fn proxy_enabled_retrieve_re_dispatches_through_the_proxy_server() {
    let factory = StubOperationFactory::always_succeeds();
    let (scheduler, _store) = test_scheduler(factory.clone());

    let mut primary = Server::new("PACS1");
    primary.retrieve_protocol = RetrieveProtocol::CMove;
    primary.proxy = Some(Box::new(Server::new("PROXY1")));
    scheduler.add_server(primary);

    scheduler.retrieve_series("P1", "1.2.3", "1.2.3.4", Priority::Normal);
    wait_briefly(&scheduler).await;

    let calls = factory.call_log();
    assert!(calls.iter().any(|c| c.starts_with("move_series")), "expected the primary move attempt: {calls:?}");
    assert!(calls.len() >= 2, "expected a second attempt against the proxy: {calls:?}");
}

/// A retry policy configured through `SchedulerSettings` — not the crate's
/// compiled-in defaults — must actually govern admitted jobs.
#[tokio::test]
async fn configured_retry_policy_overrides_compiled_in_defaults() {
    let factory = StubOperationFactory::always_fails(OperationError::TransientNetwork("down".into()));
    let store = Arc::new(InMemoryStore::new("test.sqlite"));
    let mut settings = SchedulerSettings::default();
    settings.maximum_retries = 1;
    settings.retry_delay_ms = 1;
    let scheduler = Scheduler::new(settings, store, Arc::new(factory.clone()), Arc::new(StubThumbnailEngine::default()));
    scheduler.start();
    scheduler.add_server(Server::new("PACS1"));

    scheduler.echo("PACS1", Priority::Normal);
    wait_briefly(&scheduler).await;

    // One original attempt plus the configured single retry, not the
    // compiled-in default of three.
    assert_eq!(factory.call_count(), 2);
}

#[test]
fn dcs_error_from_operation_error_preserves_category() {
    let err: DcsError = OperationError::Protocol("C-STORE failure".into()).into();
    assert!(matches!(err, DcsError::Protocol(_)));
}
