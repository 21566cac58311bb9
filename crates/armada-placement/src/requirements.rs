//! Placement requirements derived from ledger records.
//!
//! Bridges `armada_state::{DeploymentPlan, MetaInstance}` to the
//! constraints the placer evaluates.

use serde::{Deserialize, Serialize};

use armada_state::{DeploymentPlan, MetaInstance, Resources};

/// What a new runtime instance needs from its node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequirements {
    /// Reservation held on the chosen node.
    pub resources: Resources,
    /// Allowed clusters. Empty means any cluster.
    pub cluster_ids: Vec<String>,
    /// Capabilities the node must carry, all of them.
    pub capability_ids: Vec<String>,
    /// Nodes that must not be chosen.
    pub exclude_node_ids: Vec<String>,
}

impl PlacementRequirements {
    pub fn new(resources: Resources) -> Self {
        Self {
            resources,
            ..Default::default()
        }
    }

    /// Requirements for one more placement of `meta` under `plan`.
    ///
    /// Nodes already hosting a live placement of the same meta instance are
    /// excluded, so a relocation always lands somewhere else.
    pub fn for_meta_instance(plan: &DeploymentPlan, meta: &MetaInstance) -> Self {
        Self {
            resources: plan.required_resources(),
            cluster_ids: plan.matching_compute_capabilities.cluster_ids.clone(),
            capability_ids: plan.matching_compute_capabilities.capability_ids.clone(),
            exclude_node_ids: meta
                .live_runtime_instances()
                .map(|r| r.node_id.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_state::*;

    #[test]
    fn requirements_follow_plan_constraints() {
        let mut plan = DeploymentPlan::new("web", "prod");
        plan.matching_compute_capabilities = MatchingComputeCapabilities {
            cluster_ids: vec!["c1".to_string()],
            capability_ids: vec!["gpu".to_string()],
        };
        plan.applications.push(Application {
            name: "api".to_string(),
            artifact: String::new(),
            resources: Resources::new(2, 1024),
        });

        let mut meta = MetaInstance::new("web-0", "plan-1");
        meta.runtime_instances
            .push(RuntimeInstance::new("rt-1", "n1", true, Resources::new(2, 1024)));
        let mut gone = RuntimeInstance::new("rt-0", "n0", false, Resources::ZERO);
        gone.status = Status::new(RuntimeState::Terminated);
        meta.runtime_instances.push(gone);

        let req = PlacementRequirements::for_meta_instance(&plan, &meta);
        assert_eq!(req.resources, Resources::new(2, 1024));
        assert_eq!(req.cluster_ids, ["c1"]);
        assert_eq!(req.capability_ids, ["gpu"]);
        assert_eq!(req.exclude_node_ids, ["n1"]);
    }
}
