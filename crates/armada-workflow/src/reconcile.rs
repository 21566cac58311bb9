//! Deployment reconciliation.
//!
//! Brings the meta instances of a plan in line with one deployment: create
//! missing meta instances, tag every member with the deployment, fan out one
//! CREATE or UPDATE operation per member, join them, and mark the deployment
//! COMPLETED once every operation succeeded.

use std::collections::HashSet;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use armada_state::*;

use crate::error::{WorkflowError, WorkflowResult};
use crate::operation::{deployment_cancellation, operation_id};
use crate::orchestrator::{Orchestrator, new_operation};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    /// Meta instances created to reach the target count.
    pub created: u32,
    /// Meta instances newly tagged with the deployment.
    pub retagged: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: u32,
    /// Members skipped because another operation was in flight.
    pub deferred: u32,
    /// Whether the deployment was marked COMPLETED.
    pub completed: bool,
}

impl ReconcileOutcome {
    fn tally(&mut self, state: OperationState) {
        match state {
            OperationState::Succeeded => self.succeeded += 1,
            OperationState::Failed => self.failed += 1,
            OperationState::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }

    fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0 && self.deferred == 0
    }
}

enum Enqueued {
    /// Fresh or still running: drive it.
    Run(String),
    /// Settled by an earlier pass.
    Finished(OperationState),
    /// Another operation holds the member.
    Busy(String),
    /// Live placements but none active: needs an operator.
    Unplaceable,
}

impl Orchestrator {
    /// Reconcile one deployment of a plan. Safe to re-run: meta instance
    /// names and operation ids are deterministic, so a second pass finds
    /// the work of the first instead of repeating it.
    pub async fn reconcile_deployment(&self, plan_id: &str, deployment_id: &str) -> WorkflowResult<ReconcileOutcome> {
        let plan = self.state().deployment_plans().get(plan_id)?;
        let deployment = plan
            .deployment(deployment_id)
            .cloned()
            .ok_or_else(|| StateError::NotFound {
                kind: "deployment",
                key: deployment_id.to_string(),
            })?;
        info!(plan = %plan.name, deployment = %deployment_id, target = deployment.instance_count, "reconciling deployment");

        self.set_deployment_state(plan_id, deployment_id, DeploymentState::InProgress)
            .await?;

        let created = self
            .create_missing(&plan, deployment.instance_count as usize)
            .await?;
        let mut outcome = ReconcileOutcome {
            created,
            ..ReconcileOutcome::default()
        };

        let metas = self.state().meta_instances();
        let members = metas.list(&Filter::new().field("deployment_plan_id", plan_id))?;

        for meta in &members {
            if meta.deployment_id.as_deref() != Some(deployment_id) {
                self.retag(&meta.metadata.id, deployment_id).await?;
                outcome.retagged += 1;
            }
        }

        let mut tasks = JoinSet::new();
        for meta in &members {
            let meta_id = meta.metadata.id.clone();
            let enqueued = match self.enqueue(&meta_id, deployment_id).await {
                Ok(enqueued) => enqueued,
                Err(WorkflowError::Cancelled(reason)) => {
                    // Operations already spawned observe the cancellation themselves.
                    info!(deployment = %deployment_id, %reason, "deployment cancelled, no further operations");
                    break;
                }
                Err(e) => return Err(e),
            };
            match enqueued {
                Enqueued::Run(op_id) => {
                    let this = self.clone();
                    tasks.spawn(async move { this.run_operation(&meta_id, &op_id).await });
                }
                Enqueued::Finished(state) => {
                    debug!(meta_instance = %meta.name, ?state, "operation settled in an earlier pass");
                    outcome.tally(state);
                }
                Enqueued::Busy(other) => {
                    warn!(meta_instance = %meta.name, operation = %other, "meta instance busy, deferring");
                    outcome.deferred += 1;
                }
                Enqueued::Unplaceable => {
                    warn!(meta_instance = %meta.name, "meta instance has no active placement, deferring");
                    outcome.deferred += 1;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(state)) => outcome.tally(state),
                Ok(Err(e)) => {
                    error!(deployment = %deployment_id, error = %e, "operation workflow aborted");
                    outcome.failed += 1;
                }
                Err(e) => {
                    error!(deployment = %deployment_id, error = %e, "operation task panicked");
                    outcome.failed += 1;
                }
            }
        }

        if outcome.is_clean() {
            match self
                .set_deployment_state(plan_id, deployment_id, DeploymentState::Completed)
                .await
            {
                Ok(()) => outcome.completed = true,
                Err(WorkflowError::Cancelled(reason)) => info!(deployment = %deployment_id, %reason, "not completing"),
                Err(e) => return Err(e),
            }
        }

        info!(
            deployment = %deployment_id,
            created = outcome.created,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            deferred = outcome.deferred,
            completed = outcome.completed,
            "reconciliation finished"
        );
        Ok(outcome)
    }

    /// Move the deployment to `state`. A cancelled deployment stays cancelled.
    async fn set_deployment_state(&self, plan_id: &str, deployment_id: &str, state: DeploymentState) -> WorkflowResult<()> {
        let plans = self.state().deployment_plans();
        self.executor()
            .run_sync_step("update deployment status", || -> WorkflowResult<()> {
                let plan = plans.get(plan_id)?;
                let current = plan
                    .deployment(deployment_id)
                    .map(|d| d.status.state)
                    .ok_or_else(|| StateError::NotFound {
                        kind: "deployment",
                        key: deployment_id.to_string(),
                    })?;
                if current == state {
                    return Ok(());
                }
                if current == DeploymentState::Cancelled {
                    return Err(WorkflowError::Cancelled(format!("deployment {deployment_id} is cancelled")));
                }
                plans.update_deployment_status(&plan.metadata, deployment_id, Status::new(state))?;
                Ok(())
            })
            .await
    }

    /// Create `{plan}-{index}` meta instances until the plan has `target`.
    async fn create_missing(&self, plan: &DeploymentPlan, target: usize) -> WorkflowResult<u32> {
        let metas = self.state().meta_instances();
        let plan_id = plan.metadata.id.as_str();
        let existing = metas.list(&Filter::new().field("deployment_plan_id", plan_id))?;
        let mut taken: HashSet<String> = existing.iter().map(|m| m.name.clone()).collect();
        let mut have = existing.len();
        let mut created = 0;
        let mut index = 0;

        while have < target {
            let name = format!("{}-{index}", plan.name);
            index += 1;
            if !taken.insert(name.clone()) {
                continue;
            }
            let result = self
                .executor()
                .run_sync_step("create meta instance", || metas.create(MetaInstance::new(name.as_str(), plan_id)))
                .await;
            match result {
                Ok(meta) => {
                    info!(meta_instance = %meta.name, id = %meta.metadata.id, "meta instance created");
                    created += 1;
                    have += 1;
                }
                Err(WorkflowError::State(e)) if e.is_already_exists() => {
                    // Same name held by a record created concurrently, or by another plan.
                    if metas.get_by_name(&name)?.deployment_plan_id == plan_id {
                        have += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(created)
    }

    async fn retag(&self, meta_id: &str, deployment_id: &str) -> WorkflowResult<()> {
        let metas = self.state().meta_instances();
        self.executor()
            .run_sync_step("tag meta instance", || -> StateResult<()> {
                let meta = metas.get(meta_id)?;
                if meta.deployment_id.as_deref() != Some(deployment_id) {
                    metas.update_deployment_id(&meta.metadata, deployment_id)?;
                }
                Ok(())
            })
            .await
    }

    /// Append this deployment's operation to a member, or report why not.
    /// A cancelled deployment takes no new operations.
    async fn enqueue(&self, meta_id: &str, deployment_id: &str) -> WorkflowResult<Enqueued> {
        let metas = self.state().meta_instances();
        let plans = self.state().deployment_plans();
        let op_id = operation_id(deployment_id, meta_id);
        self.executor()
            .run_sync_step("enqueue operation", || -> WorkflowResult<Enqueued> {
                let meta = metas.get(meta_id)?;
                if let Some(reason) = deployment_cancellation(&plans, &meta, deployment_id)? {
                    return Err(WorkflowError::Cancelled(reason));
                }
                if let Some(op) = meta.operation(&op_id) {
                    return Ok(if op.is_terminal() {
                        Enqueued::Finished(op.status.state)
                    } else {
                        Enqueued::Run(op_id.clone())
                    });
                }
                if let Some(other) = meta.in_flight_operation() {
                    return Ok(Enqueued::Busy(other.id.clone()));
                }
                let op_type = if meta.active_runtime_instance().is_some() {
                    OperationType::Update
                } else if meta.live_runtime_instances().next().is_none() {
                    OperationType::Create
                } else {
                    return Ok(Enqueued::Unplaceable);
                };
                let op = new_operation(&meta, &op_id, op_type, deployment_id)?;
                metas.add_operation(&meta.metadata, op)?;
                Ok(Enqueued::Run(op_id.clone()))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_clean_only_without_failures_or_deferrals() {
        let mut outcome = ReconcileOutcome::default();
        outcome.tally(OperationState::Succeeded);
        outcome.tally(OperationState::Approved);
        assert!(outcome.is_clean());
        assert_eq!(outcome.succeeded, 1);

        outcome.deferred = 1;
        assert!(!outcome.is_clean());

        let mut outcome = ReconcileOutcome::default();
        outcome.tally(OperationState::Cancelled);
        assert!(!outcome.is_clean());
    }
}
