//! Operation sub-workflow.
//!
//! One task per operation. Each pass of the loop re-reads the operation from
//! the ledger and runs the phase its persisted state calls for:
//!
//! ```text
//! PREPARING ──allocate──▶ PENDING_APPROVAL ──signal──▶ APPROVED ──execute──▶ SUCCEEDED
//!     └───────────────────────────┴────────────────────────┴──error──▶ FAILED
//! ```
//!
//! Because the ledger is the checkpoint, a task re-driven after a crash
//! picks up at the phase it died in. Every step inside a phase checks what
//! is already done before acting, so replaying a phase converges on the
//! same records.

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use armada_state::*;

use crate::durable::epoch_secs;
use crate::error::{WorkflowError, WorkflowResult};
use crate::orchestrator::Orchestrator;
use crate::runtime::{ensure_started, ensure_stopped};

/// Deterministic operation id for an intent acting on a meta instance.
pub fn operation_id(intent_id: &str, meta_instance_id: &str) -> String {
    format!("{intent_id}-{meta_instance_id}")
}

/// Id of the placement an operation allocates.
pub fn placement_id(operation_id: &str) -> String {
    format!("{operation_id}-rt")
}

fn invalid(message: String) -> WorkflowError {
    StateError::InvalidStateTransition(message).into()
}

fn find_operation(meta: &MetaInstance, operation_id: &str) -> StateResult<Operation> {
    meta.operation(operation_id)
        .cloned()
        .ok_or_else(|| StateError::NotFound {
            kind: "operation",
            key: operation_id.to_string(),
        })
}

/// Reason the deployment that issued an operation was cancelled, if it was.
/// Operations whose intent names no deployment of the plan never match.
pub(crate) fn deployment_cancellation(
    plans: &Ledger<DeploymentPlan>,
    meta: &MetaInstance,
    intent_id: &str,
) -> StateResult<Option<String>> {
    let plan = match plans.get(&meta.deployment_plan_id) {
        Ok(plan) => plan,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(plan
        .deployment(intent_id)
        .filter(|d| d.status.state == DeploymentState::Cancelled)
        .map(|d| {
            if d.status.message.is_empty() {
                format!("deployment {} cancelled", d.id)
            } else {
                d.status.message.clone()
            }
        }))
}

fn placement_of(op: &Operation) -> WorkflowResult<String> {
    op.runtime_instance_id
        .clone()
        .ok_or_else(|| invalid(format!("operation {} names no runtime instance", op.id)))
}

impl Orchestrator {
    pub(crate) fn spawn_operation(
        &self,
        meta_instance_id: String,
        operation_id: String,
    ) -> JoinHandle<WorkflowResult<OperationState>> {
        let this = self.clone();
        tokio::spawn(async move { this.run_operation(&meta_instance_id, &operation_id).await })
    }

    /// Drive an operation to a terminal state and return that state.
    ///
    /// Step failures are recorded on the operation as FAILED with the error
    /// text; they are not returned as errors. An operation whose deployment
    /// was cancelled is recorded as CANCELLED at its next checkpoint.
    pub async fn run_operation(&self, meta_instance_id: &str, operation_id: &str) -> WorkflowResult<OperationState> {
        loop {
            let (meta, op) = self.load_operation(meta_instance_id, operation_id).await?;
            debug!(meta_instance = %meta.name, operation = %op.id, state = ?op.status.state, "operation checkpoint");

            if op.is_terminal() {
                return Ok(op.status.state);
            }

            match self.advance(&meta, &op).await {
                Ok(()) => {}
                Err(WorkflowError::Cancelled(reason)) => {
                    info!(meta_instance = %meta.name, operation = %op.id, %reason, "operation cancelled");
                    let status = Status::with_message(OperationState::Cancelled, reason);
                    return self.settle(meta_instance_id, operation_id, status).await;
                }
                Err(e) => {
                    error!(meta_instance = %meta_instance_id, operation = %operation_id, error = %e, "operation failed");
                    let status = Status::with_message(OperationState::Failed, e.to_string());
                    return self.settle(meta_instance_id, operation_id, status).await;
                }
            }
        }
    }

    async fn load_operation(&self, meta_instance_id: &str, operation_id: &str) -> WorkflowResult<(MetaInstance, Operation)> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("load operation", || -> StateResult<_> {
                let meta = metas.get(meta_instance_id)?;
                let op = find_operation(&meta, operation_id)?;
                Ok((meta, op))
            })
            .await
    }

    // ── Phases ─────────────────────────────────────────────────────

    /// Run the phase the persisted state calls for, unless the issuing
    /// deployment was cancelled.
    async fn advance(&self, meta: &MetaInstance, op: &Operation) -> WorkflowResult<()> {
        self.ensure_deployment_live(meta, &op.intent_id).await?;
        match op.status.state {
            OperationState::Preparing => self.prepare(meta, op).await,
            OperationState::PendingApproval => self.await_approval(meta, op).await,
            OperationState::Approved => self.execute(meta, op).await,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled => Ok(()),
        }
    }

    /// Set up preconditions, then ask for approval.
    async fn prepare(&self, meta: &MetaInstance, op: &Operation) -> WorkflowResult<()> {
        let meta_id = meta.metadata.id.as_str();
        match op.op_type {
            OperationType::Create => {
                let placement = placement_of(op)?;
                self.allocate(meta_id, &placement, true).await?;
            }
            OperationType::Relocate => {
                let placement = placement_of(op)?;
                if meta.runtime_instance(&placement).is_none() && meta.active_runtime_instance().is_none() {
                    return Err(invalid(format!("meta instance {} has no active placement to relocate", meta.name)));
                }
                self.allocate(meta_id, &placement, false).await?;
            }
            OperationType::Update | OperationType::Restart | OperationType::Stop => {
                let placement = placement_of(op)?;
                if meta.runtime_instance(&placement).is_none_or(RuntimeInstance::is_terminated) {
                    return Err(invalid(format!("runtime instance {placement} is not live")));
                }
            }
            OperationType::Delete => {}
        }
        self.transition(meta_id, &op.id, OperationState::Preparing, OperationState::PendingApproval)
            .await
    }

    /// Park until the operation leaves PENDING_APPROVAL.
    async fn await_approval(&self, meta: &MetaInstance, op: &Operation) -> WorkflowResult<()> {
        let meta_id = meta.metadata.id.as_str();
        let pending = PendingSignal {
            key: PendingSignal::approval_key(meta_id, &op.id),
            meta_instance_id: meta_id.to_string(),
            operation_id: op.id.clone(),
            created_at: epoch_secs(),
        };
        let metas = self.state().meta_instances();
        let plans = self.state().deployment_plans();
        self.executor()
            .await_signal(pending, || {
                let meta = metas.get(meta_id)?;
                if deployment_cancellation(&plans, &meta, &op.intent_id)?.is_some() {
                    return Ok(true);
                }
                Ok(meta
                    .operation(&op.id)
                    .is_none_or(|o| o.status.state != OperationState::PendingApproval))
            })
            .await
    }

    /// Perform the approved action, then mark the operation SUCCEEDED.
    async fn execute(&self, meta: &MetaInstance, op: &Operation) -> WorkflowResult<()> {
        let meta_id = meta.metadata.id.as_str();
        let op_id = op.id.as_str();
        info!(meta_instance = %meta.name, operation = %op_id, op_type = ?op.op_type, "executing operation");

        match op.op_type {
            OperationType::Create => {
                let placement = placement_of(op)?;
                self.start_runtime(meta_id, op_id, &placement).await?;
                self.set_meta_state(meta_id, MetaInstanceState::Active).await?;
            }
            OperationType::Update => {
                let placement = placement_of(op)?;
                self.start_runtime(meta_id, op_id, &placement).await?;
            }
            OperationType::Restart => {
                let placement = placement_of(op)?;
                self.checkpoint(meta_id, op_id).await?;
                self.stop_placement(meta_id, &placement).await?;
                self.start_runtime(meta_id, op_id, &placement).await?;
            }
            OperationType::Stop => {
                let placement = placement_of(op)?;
                self.retire(meta_id, op_id, &placement).await?;
                self.set_meta_state(meta_id, MetaInstanceState::Inactive).await?;
            }
            OperationType::Relocate => {
                let placement = placement_of(op)?;
                self.relocate(meta_id, op_id, &placement).await?;
            }
            OperationType::Delete => {
                self.delete_meta_instance(meta_id, op_id).await?;
            }
        }

        self.transition(meta_id, op_id, OperationState::Approved, OperationState::Succeeded)
            .await?;
        info!(meta_instance = %meta.name, operation = %op_id, "operation succeeded");
        Ok(())
    }

    /// Start the new placement, swap activity, then retire the old one.
    async fn relocate(&self, meta_id: &str, op_id: &str, new_id: &str) -> WorkflowResult<()> {
        self.start_runtime(meta_id, op_id, new_id).await?;

        let meta = self.state().meta_instances().get(meta_id)?;
        let old = meta
            .live_runtime_instances()
            .find(|r| r.id != new_id)
            .cloned();

        if let Some(old) = &old {
            self.set_active(meta_id, &old.id, false).await?;
        }
        self.set_active(meta_id, new_id, true).await?;
        if let Some(old) = old {
            self.retire(meta_id, op_id, &old.id).await?;
        }
        Ok(())
    }

    async fn delete_meta_instance(&self, meta_id: &str, op_id: &str) -> WorkflowResult<()> {
        let meta = self.state().meta_instances().get(meta_id)?;
        for rt in &meta.runtime_instances {
            self.retire(meta_id, op_id, &rt.id).await?;
        }

        let metas = self.state().meta_instances();
        let deleted = self
            .executor()
            .run_sync_step("delete meta instance", || -> StateResult<MetaInstance> {
                let meta = metas.get(meta_id)?;
                if meta.is_deleted {
                    return Ok(meta);
                }
                metas.delete(&meta.metadata)
            })
            .await?;
        info!(meta_instance = %deleted.name, "meta instance deleted");
        Ok(())
    }

    /// Record a terminal status on the operation unless it already finished.
    /// Returns the state the operation ended in.
    async fn settle(
        &self,
        meta_instance_id: &str,
        operation_id: &str,
        status: Status<OperationState>,
    ) -> WorkflowResult<OperationState> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("settle operation", || -> StateResult<OperationState> {
                let meta = metas.get(meta_instance_id)?;
                let op = find_operation(&meta, operation_id)?;
                if op.is_terminal() {
                    return Ok(op.status.state);
                }
                metas.update_operation_status(&meta.metadata, operation_id, status.clone())?;
                Ok(status.state)
            })
            .await
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Move `from` → `to`. A replay that finds `to` already reached, or an
    /// operation finished by someone else, is a no-op.
    async fn transition(&self, meta_id: &str, op_id: &str, from: OperationState, to: OperationState) -> WorkflowResult<()> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("transition operation", || -> StateResult<()> {
                let meta = metas.get(meta_id)?;
                let current = find_operation(&meta, op_id)?.status.state;
                if current == to || current.is_terminal() {
                    return Ok(());
                }
                if current != from {
                    return Err(StateError::InvalidStateTransition(format!(
                        "operation {op_id} is {current:?}, expected {from:?}"
                    )));
                }
                metas.update_operation_status(&meta.metadata, op_id, Status::new(to))?;
                Ok(())
            })
            .await
    }

    /// Stop further runtime actions once the operation is no longer APPROVED
    /// or its deployment was cancelled.
    async fn checkpoint(&self, meta_id: &str, op_id: &str) -> WorkflowResult<()> {
        let (meta, op) = self.load_operation(meta_id, op_id).await?;
        match op.status.state {
            OperationState::Approved => self.ensure_deployment_live(&meta, &op.intent_id).await,
            OperationState::Cancelled => Err(WorkflowError::Cancelled(if op.status.message.is_empty() {
                format!("operation {op_id} cancelled")
            } else {
                op.status.message
            })),
            other => Err(invalid(format!("operation {op_id} is {other:?}, expected APPROVED"))),
        }
    }

    async fn ensure_deployment_live(&self, meta: &MetaInstance, intent_id: &str) -> WorkflowResult<()> {
        let plans = self.state().deployment_plans();
        let cancelled = self
            .executor()
            .run_sync_step("check deployment", || deployment_cancellation(&plans, meta, intent_id))
            .await?;
        match cancelled {
            Some(reason) => Err(WorkflowError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    async fn allocate(&self, meta_id: &str, placement: &str, is_active: bool) -> WorkflowResult<()> {
        let scheduler = self.scheduler();
        self.executor()
            .run_sync_step("allocate runtime instance", || {
                scheduler.allocate_runtime_instance(meta_id, placement, is_active)
            })
            .await?;
        Ok(())
    }

    async fn start_placement(&self, meta_id: &str, placement: &str) -> WorkflowResult<()> {
        let runtime = self.runtime();
        self.executor()
            .run_step("start placement", move || ensure_started(runtime, meta_id, placement))
            .await
    }

    async fn stop_placement(&self, meta_id: &str, placement: &str) -> WorkflowResult<()> {
        let runtime = self.runtime();
        self.executor()
            .run_step("stop placement", move || ensure_stopped(runtime, meta_id, placement))
            .await
    }

    /// Start a placement and record it RUNNING.
    async fn start_runtime(&self, meta_id: &str, op_id: &str, placement: &str) -> WorkflowResult<()> {
        let meta = self.state().meta_instances().get(meta_id)?;
        match meta.runtime_instance(placement) {
            Some(rt) if !rt.is_terminated() => {}
            _ => return Err(invalid(format!("runtime instance {placement} is not live"))),
        }
        self.checkpoint(meta_id, op_id).await?;
        self.start_placement(meta_id, placement).await?;
        self.set_runtime_status(meta_id, placement, RuntimeState::Running).await
    }

    /// Stop a placement, mark it TERMINATED, release its reservation, and
    /// drop it from the meta instance.
    async fn retire(&self, meta_id: &str, op_id: &str, placement: &str) -> WorkflowResult<()> {
        let meta = self.state().meta_instances().get(meta_id)?;
        let Some(rt) = meta.runtime_instance(placement).cloned() else {
            debug!(meta_instance = %meta.name, runtime_instance = %placement, "already retired");
            return Ok(());
        };

        if !rt.is_terminated() {
            self.checkpoint(meta_id, op_id).await?;
            self.stop_placement(meta_id, placement).await?;
            self.set_runtime_status(meta_id, placement, RuntimeState::Terminated)
                .await?;
        }

        let scheduler = self.scheduler();
        self.executor()
            .run_sync_step("release resources", || {
                scheduler.release_runtime_instance(&rt.node_id, placement)
            })
            .await?;

        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("remove runtime instance", || -> StateResult<MetaInstance> {
                let meta = metas.get(meta_id)?;
                if meta.runtime_instance(placement).is_none() {
                    return Ok(meta);
                }
                metas.remove_runtime_instance(&meta.metadata, placement)
            })
            .await?;
        info!(meta_instance = %meta.name, runtime_instance = %placement, node = %rt.node_id, "runtime instance retired");
        Ok(())
    }

    async fn set_runtime_status(&self, meta_id: &str, placement: &str, state: RuntimeState) -> WorkflowResult<()> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("update runtime status", || -> StateResult<()> {
                let meta = metas.get(meta_id)?;
                match meta.runtime_instance(placement) {
                    Some(rt) if rt.status.state != state => {
                        metas.update_runtime_status(&meta.metadata, placement, Status::new(state))?;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await
    }

    async fn set_active(&self, meta_id: &str, placement: &str, is_active: bool) -> WorkflowResult<()> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("update runtime active state", || -> StateResult<()> {
                let meta = metas.get(meta_id)?;
                match meta.runtime_instance(placement) {
                    Some(rt) if rt.is_active != is_active => {
                        metas.update_runtime_active_state(&meta.metadata, placement, is_active)?;
                    }
                    _ => {}
                }
                Ok(())
            })
            .await
    }

    async fn set_meta_state(&self, meta_id: &str, state: MetaInstanceState) -> WorkflowResult<()> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("update meta instance status", || -> StateResult<()> {
                let meta = metas.get(meta_id)?;
                if meta.status.state != state {
                    metas.update_status(&meta.metadata, Status::new(state))?;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic() {
        assert_eq!(operation_id("dep-1", "mi-7"), "dep-1-mi-7");
        assert_eq!(placement_id("dep-1-mi-7"), "dep-1-mi-7-rt");
    }
}
