//! Scheduler: reserves node capacity for new runtime instances.
//!
//! Node `remaining_resources` is the one piece of state that independent
//! allocations fight over. It is protected only by the ledger's version
//! check: pick a node from a fresh snapshot, reserve with a compare-and-swap,
//! and start over from a new snapshot if another writer got there first.
//!
//! Every reservation is keyed by runtime instance id, so an allocation that
//! is re-invoked after a crash finds its earlier reservation instead of
//! booking a second one.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use armada_placement::{PlacementRequirements, explain, first_fit};
use armada_state::*;

use crate::error::{SchedulerError, SchedulerResult};

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Compare-and-swap attempts before giving up on a contended allocation.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_attempts: 8 }
    }
}

/// A committed placement and the aggregate that now holds it.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub meta_instance: MetaInstance,
    pub runtime_instance: RuntimeInstance,
}

/// Allocates runtime instances onto nodes.
#[derive(Clone)]
pub struct Scheduler {
    state: StateStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(state: StateStore, config: SchedulerConfig) -> Self {
        Self { state, config }
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Reserve capacity for `runtime_instance_id` and append it to the meta
    /// instance in state PENDING.
    ///
    /// Returns the existing placement if the meta instance already holds
    /// one with this id.
    pub fn allocate_runtime_instance(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
        is_active: bool,
    ) -> SchedulerResult<Allocation> {
        let metas = self.state.meta_instances();
        let nodes = self.state.nodes();
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let meta = metas.get(meta_instance_id)?;
            if let Some(existing) = meta.runtime_instance(runtime_instance_id) {
                debug!(meta_instance = %meta.name, runtime_instance = %runtime_instance_id, "already allocated");
                return Ok(Allocation {
                    runtime_instance: existing.clone(),
                    meta_instance: meta,
                });
            }
            if meta.is_deleted {
                return Err(StateError::InvalidStateTransition(format!(
                    "meta instance {} is deleted",
                    meta.name
                ))
                .into());
            }

            let plan = self.state.deployment_plans().get(&meta.deployment_plan_id)?;
            let snapshot = nodes.list(&Filter::default())?;

            let held = snapshot.iter().find_map(|n| {
                n.allocations
                    .get(runtime_instance_id)
                    .map(|r| (n.clone(), *r))
            });
            let (node, resources) = match held {
                Some(found) => {
                    debug!(node = %found.0.name, runtime_instance = %runtime_instance_id, "reusing earlier reservation");
                    found
                }
                None => {
                    let req = PlacementRequirements::for_meta_instance(&plan, &meta);
                    let Some(candidate) = first_fit(&snapshot, &req) else {
                        for (n, why) in explain(&snapshot, &req) {
                            debug!(node = %n.name, reason = %why, "node rejected");
                        }
                        return Err(SchedulerError::InsufficientResources {
                            meta_instance: meta.name.clone(),
                            reason: format!("no candidate node has {:?} remaining", req.resources),
                        });
                    };

                    let reserved = nodes.compare_and_swap(&candidate.metadata, |n| {
                        n.reserve(runtime_instance_id, req.resources).map(|_| ())
                    });
                    match reserved {
                        Ok(node) => {
                            info!(
                                node = %node.name,
                                runtime_instance = %runtime_instance_id,
                                remaining = ?node.remaining_resources,
                                "resources reserved"
                            );
                            (node, req.resources)
                        }
                        Err(e) if e.is_version_conflict() => {
                            if attempt < max_attempts {
                                warn!(attempt, node = %candidate.name, "node changed during reservation, retrying");
                                continue;
                            }
                            return Err(SchedulerError::InsufficientResources {
                                meta_instance: meta.name.clone(),
                                reason: format!("gave up after {attempt} contended attempts"),
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            let placement = RuntimeInstance::new(
                runtime_instance_id,
                node.metadata.id.as_str(),
                is_active,
                resources,
            );
            match metas.add_runtime_instance(&meta.metadata, placement.clone()) {
                Ok(meta) => {
                    info!(
                        meta_instance = %meta.name,
                        runtime_instance = %runtime_instance_id,
                        node = %node.name,
                        is_active,
                        "runtime instance allocated"
                    );
                    return Ok(Allocation {
                        meta_instance: meta,
                        runtime_instance: placement,
                    });
                }
                // The reservation stays; the next attempt picks it up.
                Err(e) if e.is_version_conflict() && attempt < max_attempts => {
                    warn!(attempt, meta_instance = %meta.name, "meta instance changed during allocation, retrying");
                }
                Err(e) => {
                    self.release_runtime_instance(&node.metadata.id, runtime_instance_id)?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Return a placement's reservation to its node.
    ///
    /// Returns false if the node held no reservation for it.
    pub fn release_runtime_instance(&self, node_id: &str, runtime_instance_id: &str) -> SchedulerResult<bool> {
        let nodes = self.state.nodes();
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let node = nodes.get(node_id)?;
            if !node.allocations.contains_key(runtime_instance_id) {
                debug!(node = %node.name, runtime_instance = %runtime_instance_id, "nothing to release");
                return Ok(false);
            }
            let released = nodes.compare_and_swap(&node.metadata, |n| {
                n.release(runtime_instance_id);
                Ok(())
            });
            match released {
                Ok(node) => {
                    info!(
                        node = %node.name,
                        runtime_instance = %runtime_instance_id,
                        remaining = ?node.remaining_resources,
                        "resources released"
                    );
                    return Ok(true);
                }
                Err(e) if e.is_version_conflict() && attempt < max_attempts => {
                    warn!(attempt, node = %node.name, "node changed during release, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
