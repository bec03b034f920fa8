//! Scheduler error types.

use thiserror::Error;

use longterm_state::{StateError, TaskId, TaskStatus};

/// Errors that can occur during scheduling and locking operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("no tasks for experiment: {0}")]
    NoTasksForExperiment(String),

    #[error("experiment already exists: {0}")]
    DuplicateExperimentName(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("machine unavailable: {0}")]
    MachineUnavailable(String),

    #[error("machine {machine} conflicts with existing machine {existing}")]
    DuplicateMachine { machine: String, existing: String },

    #[error("experiment {experiment} already holds machine {machine}")]
    AlreadyHoldsMachine { experiment: String, machine: String },

    #[error("cannot {action} task {task} while {status}")]
    InvalidState {
        task: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
