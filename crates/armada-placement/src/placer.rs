//! Placement engine: first-fit node selection.
//!
//! Pure function of a node snapshot: the scheduler reads the nodes, asks
//! for a decision, and commits the reservation with a compare-and-swap.
//! If the snapshot goes stale, it reads again and asks again.

use tracing::{debug, warn};

use armada_state::Node;

use crate::filter::{Rejection, candidates, check_node};
use crate::requirements::PlacementRequirements;

/// Pick the first candidate in name order. `None` if nothing fits.
pub fn first_fit<'a>(nodes: &'a [Node], req: &PlacementRequirements) -> Option<&'a Node> {
    let chosen = candidates(nodes, req).into_iter().next();
    match chosen {
        Some(node) => debug!(node = %node.name, resources = ?req.resources, "first fit"),
        None => warn!(
            nodes = nodes.len(),
            resources = ?req.resources,
            "no node can host the placement"
        ),
    }
    chosen
}

/// Every rejected node with its reason, for diagnostics.
pub fn explain<'a>(nodes: &'a [Node], req: &PlacementRequirements) -> Vec<(&'a Node, Rejection)> {
    nodes
        .iter()
        .filter_map(|n| check_node(n, req).map(|r| (n, r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_state::Resources;

    fn make_node(name: &str, cores: u32, memory_mb: u64) -> Node {
        let mut n = Node::new(name, "c1", Resources::new(cores, memory_mb), Resources::ZERO);
        n.metadata.id = format!("id-{name}");
        n
    }

    #[test]
    fn picks_first_by_name_not_best_fit() {
        let nodes = vec![make_node("b", 2, 2048), make_node("a", 16, 65536)];
        let req = PlacementRequirements::new(Resources::new(2, 1024));

        assert_eq!(first_fit(&nodes, &req).unwrap().name, "a");
    }

    #[test]
    fn skips_nodes_without_room() {
        let nodes = vec![make_node("a", 1, 512), make_node("b", 4, 4096)];
        let req = PlacementRequirements::new(Resources::new(2, 1024));

        assert_eq!(first_fit(&nodes, &req).unwrap().name, "b");
    }

    #[test]
    fn memory_also_constrains() {
        let nodes = vec![make_node("a", 8, 512)];
        let req = PlacementRequirements::new(Resources::new(1, 1024));

        assert!(first_fit(&nodes, &req).is_none());
        let reasons = explain(&nodes, &req);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].1, Rejection::InsufficientResources);
    }

    #[test]
    fn empty_cluster_yields_none() {
        let req = PlacementRequirements::new(Resources::new(1, 1));
        assert!(first_fit(&[], &req).is_none());
    }

    #[test]
    fn zero_requirement_fits_any_active_node() {
        let nodes = vec![make_node("a", 0, 0)];
        assert!(first_fit(&nodes, &PlacementRequirements::default()).is_some());
    }
}
