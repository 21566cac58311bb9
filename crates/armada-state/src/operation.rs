//! Operation state machine.
//!
//! ```text
//! PREPARING ──► PENDING_APPROVAL ──► APPROVED ──► SUCCEEDED
//!     │                │                 │
//!     └───────┬────────┴────────┬────────┘
//!             ▼                 ▼
//!          FAILED           CANCELLED
//! ```
//!
//! Terminal states never change again, and APPROVED is only reachable
//! through PENDING_APPROVAL.

use crate::error::{StateError, StateResult};
use crate::types::OperationState;

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }

    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        match (self, next) {
            (Preparing, PendingApproval) => true,
            (PendingApproval, Approved) => true,
            (Approved, Succeeded) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Reject any transition outside the fixed order.
pub fn validate_transition(from: OperationState, to: OperationState) -> StateResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StateError::InvalidStateTransition(format!(
            "operation cannot move from {from:?} to {to:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationState::*;

    const ALL: [OperationState; 6] = [
        Preparing,
        PendingApproval,
        Approved,
        Succeeded,
        Failed,
        Cancelled,
    ];

    #[test]
    fn happy_path_is_legal() {
        assert!(validate_transition(Preparing, PendingApproval).is_ok());
        assert!(validate_transition(PendingApproval, Approved).is_ok());
        assert!(validate_transition(Approved, Succeeded).is_ok());
    }

    #[test]
    fn approval_cannot_be_skipped_or_repeated() {
        assert!(validate_transition(Preparing, Approved).is_err());
        assert!(validate_transition(Approved, Approved).is_err());
        assert!(validate_transition(PendingApproval, Succeeded).is_err());
        assert!(validate_transition(Preparing, Succeeded).is_err());
    }

    #[test]
    fn failure_reachable_from_every_live_state() {
        for from in [Preparing, PendingApproval, Approved] {
            assert!(from.can_transition_to(Failed), "{from:?} -> Failed");
            assert!(from.can_transition_to(Cancelled), "{from:?} -> Cancelled");
        }
    }

    #[test]
    fn terminal_states_are_frozen() {
        for from in [Succeeded, Failed, Cancelled] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn no_backward_edges() {
        assert!(!Approved.can_transition_to(PendingApproval));
        assert!(!PendingApproval.can_transition_to(Preparing));
        assert!(!Approved.can_transition_to(Preparing));
    }
}
