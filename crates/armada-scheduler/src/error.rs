//! Scheduler error types.

use thiserror::Error;

use armada_state::StateError;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("insufficient resources for meta instance {meta_instance}: {reason}")]
    InsufficientResources { meta_instance: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl SchedulerError {
    /// Whether a later attempt may succeed once capacity frees up or the
    /// conflicting writer is done.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::InsufficientResources { .. } => true,
            SchedulerError::State(e) => e.is_retryable(),
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
