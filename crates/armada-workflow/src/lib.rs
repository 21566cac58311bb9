//! Armada orchestration: deployment reconciliation and approval-gated
//! operation workflows.
//!
//! A deployment fans out one operation per meta instance. Each operation runs
//! as its own task through `PREPARING → PENDING_APPROVAL → APPROVED →
//! SUCCEEDED | FAILED`, parking on an external approval signal in between.
//! All progress is recorded in the ledger, so [`Orchestrator::recover`] can
//! re-drive in-flight work after a restart.
//!
//! # Components
//!
//! - **`orchestrator`**: Entry points: request, approve, cancel, recover
//! - **`reconcile`**: Deployment fan-out and completion
//! - **`operation`**: Per-operation sub-workflow
//! - **`durable`**: Step retries and signal suspension
//! - **`runtime`**: Placement runtime collaborator

pub mod durable;
pub mod error;
pub mod operation;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;

pub use durable::{Executor, RetryPolicy, WorkflowConfig};
pub use error::{WorkflowError, WorkflowResult};
pub use operation::{operation_id, placement_id};
pub use orchestrator::Orchestrator;
pub use reconcile::ReconcileOutcome;
pub use runtime::{InMemoryRuntime, PlacementRuntime, RuntimeError, RuntimeFuture, RuntimeResult};
