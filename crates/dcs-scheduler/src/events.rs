//! Change-event fan-out (§4.4, §9 "Signals/slots → events").
//!
//! The reference client uses Qt signals/slots. This crate replaces that with
//! a `tokio::sync::broadcast` channel owned by the Scheduler: every
//! subscriber gets every event in emission order, which preserves the
//! per-job ordering guarantee (`started` before any `progress_job_detail`,
//! before exactly one terminal event) as long as all three are sent from the
//! same task — which they are, since a Job's lifecycle is driven end to end
//! by one spawned worker task.

use dcs_common::JobDetail;
use tokio::sync::broadcast;

/// One observable scheduler event.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    JobStarted(JobDetail),
    ProgressJobDetail(JobDetail),
    JobFinished(JobDetail),
    JobCanceled(JobDetail),
    JobFailed(JobDetail),
    ServerModified(String),
    QueueJobs,
}

/// Thin wrapper around a broadcast sender. Cloning is cheap (it clones the
/// sender handle, not the channel).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Broadcast sends are fire-and-forget: with no subscribers the send
    /// returns an error that is not a scheduler bug, just an unobserved tick.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
