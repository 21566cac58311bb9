//! Deployment mutators on the deployment-plan ledger.

use tracing::info;

use crate::error::{StateError, StateResult};
use crate::ledger::Ledger;
use crate::types::*;

impl Ledger<DeploymentPlan> {
    /// Append a deployment. Its id must be unique within the plan.
    pub fn add_deployment(&self, expected: &Metadata, deployment: Deployment) -> StateResult<DeploymentPlan> {
        let deployment_id = deployment.id.clone();
        let plan = self.compare_and_swap(expected, |plan| {
            if plan.deployment(&deployment.id).is_some() {
                return Err(StateError::already_exists("deployment", deployment.id.as_str()));
            }
            plan.deployments.push(deployment);
            Ok(())
        })?;
        info!(plan = %plan.name, deployment = %deployment_id, "deployment added");
        Ok(plan)
    }

    pub fn update_deployment_status(
        &self,
        expected: &Metadata,
        deployment_id: &str,
        status: Status<DeploymentState>,
    ) -> StateResult<DeploymentPlan> {
        let state = status.state;
        let plan = self.compare_and_swap(expected, |plan| {
            let deployment = plan
                .deployment_mut(deployment_id)
                .ok_or_else(|| StateError::not_found("deployment", deployment_id))?;
            deployment.status = status;
            Ok(())
        })?;
        info!(plan = %plan.name, deployment = %deployment_id, ?state, "deployment status updated");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    #[test]
    fn deployments_are_unique_per_plan() {
        let store = StateStore::open_in_memory().unwrap();
        let plans = store.deployment_plans();
        let plan = plans.create(DeploymentPlan::new("web", "prod")).unwrap();

        let plan = plans.add_deployment(&plan.metadata, Deployment::new("d1", 3)).unwrap();
        assert_eq!(plan.metadata.version, 2);

        let err = plans
            .add_deployment(&plan.metadata, Deployment::new("d1", 5))
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn deployment_status_goes_through_plan_cas() {
        let store = StateStore::open_in_memory().unwrap();
        let plans = store.deployment_plans();
        let plan = plans.create(DeploymentPlan::new("web", "prod")).unwrap();
        let plan = plans.add_deployment(&plan.metadata, Deployment::new("d1", 1)).unwrap();

        let updated = plans
            .update_deployment_status(&plan.metadata, "d1", Status::new(DeploymentState::Completed))
            .unwrap();
        assert_eq!(updated.deployment("d1").unwrap().status.state, DeploymentState::Completed);

        let err = plans
            .update_deployment_status(&plan.metadata, "d1", Status::new(DeploymentState::Cancelled))
            .unwrap_err();
        assert!(err.is_version_conflict());

        let err = plans
            .update_deployment_status(&updated.metadata, "missing", Status::new(DeploymentState::Cancelled))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
