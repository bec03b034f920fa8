use thiserror::Error;

use longterm_core::AllocError;
use longterm_scheduler::SchedulerError;
use longterm_state::StateError;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("machine registration failed: {0}")]
    Register(#[from] SchedulerError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
