//! Candidate filtering.
//!
//! A node is a candidate when it is live, active, inside the allowed
//! clusters, carries every required capability, is not excluded, and has
//! enough remaining resources for the reservation.

use std::fmt;

use armada_state::{Node, NodeState};

use crate::requirements::PlacementRequirements;

/// Why a node was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Deleted,
    NotActive,
    WrongCluster,
    MissingCapabilities,
    Excluded,
    InsufficientResources,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::Deleted => "deleted",
            Rejection::NotActive => "not active",
            Rejection::WrongCluster => "outside allowed clusters",
            Rejection::MissingCapabilities => "missing capabilities",
            Rejection::Excluded => "excluded",
            Rejection::InsufficientResources => "insufficient resources",
        };
        f.write_str(reason)
    }
}

/// Check a single node. `None` means the node can host the placement.
pub fn check_node(node: &Node, req: &PlacementRequirements) -> Option<Rejection> {
    if node.is_deleted {
        return Some(Rejection::Deleted);
    }
    if node.status.state != NodeState::Active {
        return Some(Rejection::NotActive);
    }
    if !req.cluster_ids.is_empty() && !req.cluster_ids.contains(&node.cluster_id) {
        return Some(Rejection::WrongCluster);
    }
    if !node.has_capabilities(&req.capability_ids) {
        return Some(Rejection::MissingCapabilities);
    }
    if req.exclude_node_ids.iter().any(|id| *id == node.metadata.id) {
        return Some(Rejection::Excluded);
    }
    if !node.remaining_resources.covers(&req.resources) {
        return Some(Rejection::InsufficientResources);
    }
    None
}

/// Nodes that can host the placement, ordered by name.
pub fn candidates<'a>(nodes: &'a [Node], req: &PlacementRequirements) -> Vec<&'a Node> {
    let mut eligible: Vec<&Node> = nodes
        .iter()
        .filter(|n| check_node(n, req).is_none())
        .collect();
    eligible.sort_by(|a, b| a.name.cmp(&b.name));
    eligible
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_state::{Resources, Status};

    fn node(id: &str, cluster: &str, cores: u32) -> Node {
        let mut n = Node::new(id, cluster, Resources::new(cores, 4096), Resources::ZERO);
        n.metadata.id = id.to_string();
        n
    }

    fn req(cores: u32) -> PlacementRequirements {
        PlacementRequirements::new(Resources::new(cores, 1024))
    }

    #[test]
    fn healthy_node_passes() {
        assert_eq!(check_node(&node("n1", "c1", 4), &req(2)), None);
    }

    #[test]
    fn exact_fit_passes() {
        assert_eq!(check_node(&node("n1", "c1", 2), &req(2)), None);
    }

    #[test]
    fn rejects_small_node() {
        assert_eq!(
            check_node(&node("n1", "c1", 1), &req(2)),
            Some(Rejection::InsufficientResources)
        );
    }

    #[test]
    fn rejects_inactive_and_deleted() {
        let mut inactive = node("n1", "c1", 4);
        inactive.status = Status::new(NodeState::Inactive);
        assert_eq!(check_node(&inactive, &req(1)), Some(Rejection::NotActive));

        let mut deleted = node("n2", "c1", 4);
        deleted.is_deleted = true;
        assert_eq!(check_node(&deleted, &req(1)), Some(Rejection::Deleted));
    }

    #[test]
    fn cluster_list_restricts_only_when_set() {
        let mut r = req(1);
        assert_eq!(check_node(&node("n1", "c2", 4), &r), None);

        r.cluster_ids = vec!["c1".to_string()];
        assert_eq!(check_node(&node("n1", "c2", 4), &r), Some(Rejection::WrongCluster));
        assert_eq!(check_node(&node("n1", "c1", 4), &r), None);
    }

    #[test]
    fn all_capabilities_required() {
        let mut r = req(1);
        r.capability_ids = vec!["gpu".to_string(), "ssd".to_string()];

        let partial = node("n1", "c1", 4).with_capabilities(vec!["gpu".to_string()]);
        assert_eq!(check_node(&partial, &r), Some(Rejection::MissingCapabilities));

        let full = node("n2", "c1", 4).with_capabilities(vec!["ssd".to_string(), "gpu".to_string()]);
        assert_eq!(check_node(&full, &r), None);
    }

    #[test]
    fn excluded_node_rejected() {
        let mut r = req(1);
        r.exclude_node_ids = vec!["n1".to_string()];
        assert_eq!(check_node(&node("n1", "c1", 4), &r), Some(Rejection::Excluded));
    }

    #[test]
    fn candidates_sorted_by_name() {
        let nodes = vec![node("n3", "c1", 4), node("n1", "c1", 1), node("n2", "c1", 4)];
        let found: Vec<_> = candidates(&nodes, &req(2)).iter().map(|n| n.name.as_str()).collect();
        assert_eq!(found, ["n2", "n3"]);
    }
}
