//! longterm-scheduler: recurring experiment scheduling and machine locking.
//!
//! Owns the task lifecycle and decides which machine a task runs on. The
//! analysis itself happens elsewhere; this crate only records what should
//! run next and where.
//!
//! - [`ExperimentScheduler`]: create experiments, schedule the next
//!   occurrence, start/pause/terminate tasks, record results
//! - [`MachineLocks`]: bind a machine to an experiment while its task runs,
//!   release it afterwards, count what is free
//!
//! # Lifecycle
//!
//! ```text
//! pending ──┬──► scheduled ───┐
//!           └──► unscheduled  ├──► running ──► completed / failed
//! pending ────────────────────┘                   │
//!                                                 └─ recurrent: successor (scheduled)
//! ```
//!
//! Every operation runs inside a single state store write transaction, so
//! operations on the same experiment are serialized and a lock flip is
//! atomic with respect to availability counting.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use longterm_state::Timestamp;

pub mod error;
pub mod lifecycle;
pub mod locks;

pub use error::{SchedulerError, SchedulerResult};
pub use lifecycle::{
    ExperimentScheduler, ExperimentSummary, NewExperiment, Outcome, Removal, ScheduleState,
    Termination,
};
pub use locks::MachineLocks;

/// Source of "now" for lifecycle timestamps.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(epoch_secs)
}
