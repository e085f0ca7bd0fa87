//! Job admission, fairness, and dispatch for a DICOM client workstation.
//!
//! The public surface is [`Scheduler`]: register [`dcs_common::Server`]s,
//! issue query/retrieve/echo/listener requests, subscribe to
//! [`events::SchedulerEvent`]s, and wait for outstanding work to drain.
//!
//! Scenario-level tests (admission, retry, cancellation, proxy re-chaining)
//! live in `tests/scheduler_tests.rs`, driven through this public API; each
//! module here keeps its own narrower unit tests alongside its source.

mod events;
mod job;
mod metrics;
mod registry;
mod scheduler;
mod settings;
mod worker;

pub use events::SchedulerEvent;
pub use job::{JobClass, JobRecord, JobVariant};
pub use registry::ServerRegistry;
pub use scheduler::Scheduler;
pub use settings::SchedulerSettings;
