//! Error → HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use armada_scheduler::SchedulerError;
use armada_state::StateError;
use armada_workflow::WorkflowError;

use crate::ApiResponse;

/// A failed request: status code plus the message put in the envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound { .. } => StatusCode::NOT_FOUND,
        StateError::AlreadyExists { .. } | StateError::VersionConflict { .. } => StatusCode::CONFLICT,
        StateError::InvalidStateTransition(_) => StatusCode::UNPROCESSABLE_ENTITY,
        StateError::InsufficientResources(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self::new(state_status(&e), e.to_string())
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let status = match &e {
            WorkflowError::State(inner) | WorkflowError::Scheduler(SchedulerError::State(inner)) => state_status(inner),
            WorkflowError::Scheduler(SchedulerError::InsufficientResources { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            WorkflowError::Runtime(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::Cancelled(_) => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_to_http() {
        let cases = [
            (StateError::NotFound { kind: "node", key: "n".into() }, StatusCode::NOT_FOUND),
            (StateError::AlreadyExists { kind: "node", key: "n".into() }, StatusCode::CONFLICT),
            (
                StateError::VersionConflict { kind: "node", id: "n".into(), expected: 1, actual: 2 },
                StatusCode::CONFLICT,
            ),
            (StateError::InvalidStateTransition("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (StateError::InsufficientResources("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (StateError::Write("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn workflow_errors_unwrap_to_the_ledger_cause() {
        let err = WorkflowError::Scheduler(SchedulerError::State(StateError::NotFound {
            kind: "meta instance",
            key: "mi".into(),
        }));
        assert_eq!(ApiError::from(err).status, StatusCode::NOT_FOUND);

        let err = WorkflowError::Scheduler(SchedulerError::InsufficientResources {
            meta_instance: "web-0".into(),
            reason: "full".into(),
        });
        assert_eq!(ApiError::from(err).status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
