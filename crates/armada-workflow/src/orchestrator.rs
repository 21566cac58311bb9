//! Orchestrator: entry points of the lifecycle engine.
//!
//! Owns the collaborators every workflow needs (ledger, scheduler, placement
//! runtime, step executor) and exposes the external triggers: request an
//! operation, approve or cancel it, cancel a deployment, and re-drive
//! in-flight work after a restart. Deployment reconciliation lives in
//! [`crate::reconcile`], the per-operation sub-workflow in
//! [`crate::operation`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use armada_scheduler::Scheduler;
use armada_state::*;

use crate::durable::{Executor, WorkflowConfig};
use crate::error::{WorkflowError, WorkflowResult};
use crate::operation::{operation_id, placement_id};
use crate::runtime::PlacementRuntime;

/// Drives meta instances through their operations.
#[derive(Clone)]
pub struct Orchestrator {
    state: StateStore,
    scheduler: Scheduler,
    runtime: Arc<dyn PlacementRuntime>,
    executor: Executor,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        scheduler: Scheduler,
        runtime: Arc<dyn PlacementRuntime>,
        config: &WorkflowConfig,
    ) -> Self {
        let executor = Executor::new(state.clone(), config);
        Self {
            state,
            scheduler,
            runtime,
            executor,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn runtime(&self) -> &dyn PlacementRuntime {
        self.runtime.as_ref()
    }

    /// Operations currently parked on approval.
    pub fn pending_approvals(&self) -> WorkflowResult<Vec<PendingSignal>> {
        Ok(self.state.list_pending_signals()?)
    }

    /// Append a user-requested operation and start its sub-workflow.
    ///
    /// The operation id is derived from `intent_id`, so repeating a request
    /// returns the existing operation instead of adding a second one.
    pub async fn request_operation(
        &self,
        meta_instance_id: &str,
        op_type: OperationType,
        intent_id: &str,
    ) -> WorkflowResult<Operation> {
        let metas = self.state.meta_instances();
        let op_id = operation_id(intent_id, meta_instance_id);

        let (op, added) = self
            .executor
            .run_sync_step("add operation", || -> WorkflowResult<(Operation, bool)> {
                let meta = metas.get(meta_instance_id)?;
                if let Some(existing) = meta.operation(&op_id) {
                    return Ok((existing.clone(), false));
                }
                let op = new_operation(&meta, &op_id, op_type, intent_id)?;
                metas.add_operation(&meta.metadata, op.clone())?;
                Ok((op, true))
            })
            .await?;

        if added {
            info!(meta_instance = %meta_instance_id, operation = %op.id, op_type = ?op.op_type, "operation requested");
            self.spawn_operation(meta_instance_id.to_string(), op.id.clone());
        } else {
            debug!(meta_instance = %meta_instance_id, operation = %op.id, "operation already requested");
        }
        Ok(op)
    }

    /// The external approval signal: PENDING_APPROVAL → APPROVED.
    pub async fn approve_operation(&self, meta_instance_id: &str, operation_id: &str) -> WorkflowResult<MetaInstance> {
        let meta = self
            .set_operation_status(
                "approve operation",
                meta_instance_id,
                operation_id,
                Status::new(OperationState::Approved),
            )
            .await?;
        self.executor
            .signal(&PendingSignal::approval_key(meta_instance_id, operation_id));
        info!(meta_instance = %meta.name, operation = %operation_id, "operation approved");
        Ok(meta)
    }

    /// Cancel an in-flight operation. Its sub-workflow exits at the next
    /// checkpoint; placements already allocated are left in place.
    pub async fn cancel_operation(
        &self,
        meta_instance_id: &str,
        operation_id: &str,
        reason: &str,
    ) -> WorkflowResult<MetaInstance> {
        let meta = self
            .set_operation_status(
                "cancel operation",
                meta_instance_id,
                operation_id,
                Status::with_message(OperationState::Cancelled, reason),
            )
            .await?;
        self.executor
            .signal(&PendingSignal::approval_key(meta_instance_id, operation_id));
        info!(meta_instance = %meta.name, operation = %operation_id, %reason, "operation cancelled");
        Ok(meta)
    }

    /// Mark a deployment CANCELLED and cancel every in-flight operation it
    /// requested. Returns the number of operations cancelled.
    pub async fn cancel_deployment(&self, plan_id: &str, deployment_id: &str) -> WorkflowResult<usize> {
        let plans = self.state.deployment_plans();
        self.executor
            .run_sync_step("cancel deployment", || -> StateResult<()> {
                let plan = plans.get(plan_id)?;
                let deployment = plan.deployment(deployment_id).ok_or_else(|| StateError::NotFound {
                    kind: "deployment",
                    key: deployment_id.to_string(),
                })?;
                if deployment.status.state != DeploymentState::Cancelled {
                    plans.update_deployment_status(
                        &plan.metadata,
                        deployment_id,
                        Status::new(DeploymentState::Cancelled),
                    )?;
                }
                Ok(())
            })
            .await?;

        let reason = format!("deployment {deployment_id} cancelled");
        let members = self
            .state
            .meta_instances()
            .list(&Filter::new().field("deployment_id", deployment_id))?;
        let mut cancelled = 0;
        for meta in members {
            let in_flight = meta
                .operations
                .iter()
                .filter(|o| o.intent_id == deployment_id && !o.is_terminal());
            for op in in_flight {
                match self.cancel_operation(&meta.metadata.id, &op.id, &reason).await {
                    Ok(_) => cancelled += 1,
                    // Finished between the read and the cancel.
                    Err(WorkflowError::State(StateError::InvalidStateTransition(_))) => {
                        debug!(operation = %op.id, "operation already finished");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(plan = %plan_id, deployment = %deployment_id, cancelled, "deployment cancelled");
        Ok(cancelled)
    }

    /// Re-drive every non-terminal operation from its persisted state and
    /// drop pending-signal markers nobody is waiting on anymore.
    pub fn recover(&self) -> WorkflowResult<Vec<JoinHandle<WorkflowResult<OperationState>>>> {
        let metas = self
            .state
            .meta_instances()
            .list(&Filter::new().include_deleted(true))?;

        // Before spawning: a resumed task may park and write a fresh marker.
        for signal in self.state.list_pending_signals()? {
            let waiting = metas
                .iter()
                .find(|m| m.metadata.id == signal.meta_instance_id)
                .and_then(|m| m.operation(&signal.operation_id))
                .is_some_and(|o| o.status.state == OperationState::PendingApproval);
            if !waiting {
                warn!(key = %signal.key, "dropping stale pending signal");
                self.state.remove_pending_signal(&signal.key)?;
            }
        }

        let mut handles = Vec::new();
        for meta in &metas {
            if let Some(op) = meta.in_flight_operation() {
                info!(meta_instance = %meta.name, operation = %op.id, state = ?op.status.state, "resuming operation");
                handles.push(self.spawn_operation(meta.metadata.id.clone(), op.id.clone()));
            }
        }

        info!(resumed = handles.len(), "recovery complete");
        Ok(handles)
    }

    async fn set_operation_status(
        &self,
        step: &str,
        meta_instance_id: &str,
        operation_id: &str,
        status: Status<OperationState>,
    ) -> WorkflowResult<MetaInstance> {
        let metas = self.state.meta_instances();
        self.executor
            .run_sync_step(step, || {
                let meta = metas.get(meta_instance_id)?;
                metas.update_operation_status(&meta.metadata, operation_id, status.clone())
            })
            .await
    }
}

/// Build a PREPARING operation of `op_type` against the current aggregate.
pub(crate) fn new_operation(
    meta: &MetaInstance,
    op_id: &str,
    op_type: OperationType,
    intent_id: &str,
) -> StateResult<Operation> {
    if meta.is_deleted {
        return Err(StateError::InvalidStateTransition(format!(
            "meta instance {} is deleted",
            meta.name
        )));
    }
    let active = meta.active_runtime_instance().map(|r| r.id.clone());
    let runtime_instance_id = match op_type {
        OperationType::Create => {
            if meta.live_runtime_instances().next().is_some() {
                return Err(StateError::InvalidStateTransition(format!(
                    "meta instance {} already has a placement",
                    meta.name
                )));
            }
            Some(placement_id(op_id))
        }
        OperationType::Relocate => {
            if active.is_none() {
                return Err(StateError::InvalidStateTransition(format!(
                    "meta instance {} has no active placement to relocate",
                    meta.name
                )));
            }
            Some(placement_id(op_id))
        }
        OperationType::Update | OperationType::Restart | OperationType::Stop => {
            if active.is_none() {
                return Err(StateError::InvalidStateTransition(format!(
                    "meta instance {} has no active placement",
                    meta.name
                )));
            }
            active
        }
        OperationType::Delete => None,
    };

    let mut op = Operation::new(op_id, op_type, intent_id);
    op.runtime_instance_id = runtime_instance_id;
    Ok(op)
}
