//! Workflow error types.

use thiserror::Error;

use armada_scheduler::SchedulerError;
use armada_state::StateError;

use crate::runtime::RuntimeError;

/// Errors that can end a workflow step.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The operation or its deployment was cancelled; stop without further
    /// runtime actions.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl WorkflowError {
    /// Whether re-reading and re-running the step may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::State(e) => e.is_retryable(),
            WorkflowError::Scheduler(e) => e.is_retryable(),
            WorkflowError::Runtime(e) => e.is_retryable(),
            WorkflowError::Cancelled(_) => false,
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
