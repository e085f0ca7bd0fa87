//! Demo harness for the DICOM scheduler.
//!
//! Wires a [`Scheduler`] to in-memory stand-ins (no real DIMSE engine or
//! on-disk index ships in this repository — see SPEC_FULL.md's Non-goals),
//! registers one or two demo servers, runs a short scenario, and prints
//! every [`SchedulerEvent`] as it's emitted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use dcs_common::{logging, Priority, RetrieveProtocol, Server};
use dcs_config::DcsConfig;
use dcs_operation::testing::{InMemoryStore, StubOperationFactory, StubThumbnailEngine};
use dcs_operation::OperationError;
use dcs_scheduler::{Scheduler, SchedulerEvent};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dcs-demo")]
#[command(about = "Runs a canned query/retrieve/echo scenario against the DICOM scheduler")]
struct Args {
    /// Path to a dcs.toml config file. Falls back to the standard search
    /// paths and DCS_* environment variables when omitted.
    #[arg(long, env = "DCS_CONFIG")]
    config: Option<String>,

    /// Induce one transient failure on the first retrieve attempt, to
    /// exercise the retry path.
    #[arg(long, env = "DCS_DEMO_INDUCE_FAILURE", default_value = "false")]
    induce_failure: bool,
}

/// Installs the Prometheus recorder and starts its own HTTP listener
/// (default `0.0.0.0:9000`, serving `/metrics`), gated behind the
/// `prometheus` feature so a plain build never forces a global recorder.
#[cfg(feature = "prometheus")]
fn install_prometheus_recorder() {
    use metrics_exporter_prometheus::PrometheusBuilder;
    match PrometheusBuilder::new().install() {
        Ok(()) => info!("prometheus exporter listening on http://0.0.0.0:9000/metrics"),
        Err(e) => tracing::warn!(error = %e, "failed to install prometheus recorder"),
    }
}

#[cfg(not(feature = "prometheus"))]
fn install_prometheus_recorder() {}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging("dcs-demo");
    install_prometheus_recorder();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DcsConfig::from_file(path)?,
        None => DcsConfig::load()?,
    };

    let mut outcomes = Vec::new();
    if args.induce_failure {
        outcomes.push(Err(OperationError::TransientNetwork("simulated association timeout".into())));
    }
    outcomes.push(Ok(()));
    let factory = StubOperationFactory::with_scripted_outcomes(outcomes);
    let store = Arc::new(InMemoryStore::new("dcs-demo.sqlite"));

    let scheduler = Scheduler::new(config.scheduler.clone(), store.clone(), Arc::new(factory), Arc::new(StubThumbnailEngine::default()));

    let mut servers = config.servers.clone();
    if servers.is_empty() {
        let mut demo = Server::new("DEMO_PACS");
        demo.retrieve_protocol = RetrieveProtocol::CGet;
        servers.push(demo);
    }
    for server in servers {
        info!(connection_name = %server.connection_name, "registering server");
        scheduler.add_server(server);
    }

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    scheduler.start();

    scheduler.echo("DEMO_PACS", Priority::Normal);
    scheduler.query_studies("PATIENT1", Priority::Normal);
    scheduler.retrieve_study("PATIENT1", "1.2.840.10008.demo.1", Priority::High);

    tokio::time::timeout(Duration::from_secs(10), scheduler.wait_for_finish()).await.ok();
    scheduler.stop();

    info!(datasets_stored = store.inserted().len(), "demo scenario complete");
    Ok(())
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::JobStarted(detail) => info!(job_id = %detail.job_id, class = ?detail.job_class, "job started"),
        SchedulerEvent::ProgressJobDetail(detail) => {
            info!(job_id = %detail.job_id, datasets = detail.number_of_datasets, "job progress")
        }
        SchedulerEvent::JobFinished(detail) => info!(job_id = %detail.job_id, "job finished"),
        SchedulerEvent::JobCanceled(detail) => info!(job_id = %detail.job_id, "job canceled"),
        SchedulerEvent::JobFailed(detail) => info!(job_id = %detail.job_id, "job failed"),
        SchedulerEvent::ServerModified(name) => info!(connection_name = %name, "server modified"),
        SchedulerEvent::QueueJobs => {}
    }
}
