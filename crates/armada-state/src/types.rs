//! Domain types for the Armada ledger.
//!
//! Every mutable record carries a [`Metadata`] whose `version` is the
//! optimistic-concurrency token. Nested collections (deployments inside a
//! plan, runtime instances and operations inside a meta instance) have no
//! version of their own: they change only through a compare-and-swap on the
//! owning record.

use std::collections::BTreeMap;
use std::iter::Sum;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

pub type ClusterId = String;
pub type NodeId = String;
pub type DeploymentPlanId = String;
pub type DeploymentId = String;
pub type MetaInstanceId = String;
pub type RuntimeInstanceId = String;
pub type OperationId = String;

// ── Common ────────────────────────────────────────────────────────

/// Identity and concurrency token of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    /// Incremented by exactly one on every committed mutation.
    pub version: u64,
}

impl Metadata {
    pub fn new(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

/// A closed state plus a free-form, human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status<S> {
    pub state: S,
    #[serde(default)]
    pub message: String,
}

impl<S> Status<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            message: String::new(),
        }
    }

    pub fn with_message(state: S, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

impl<S: Default> Default for Status<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

/// CPU cores and memory, used for capacity, reservations, and requirements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    pub memory_mb: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cores: 0,
        memory_mb: 0,
    };

    pub fn new(cores: u32, memory_mb: u64) -> Self {
        Self { cores, memory_mb }
    }

    /// Whether `self` is large enough to hold `other`.
    pub fn covers(&self, other: &Resources) -> bool {
        self.cores >= other.cores && self.memory_mb >= other.memory_mb
    }

    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cores: self.cores.checked_sub(other.cores)?,
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
        })
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cores: self.cores.saturating_sub(other.cores),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cores: self.cores.saturating_add(other.cores),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
        }
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Self {
        iter.fold(Resources::ZERO, |acc, r| acc.saturating_add(&r))
    }
}

impl<'a> Sum<&'a Resources> for Resources {
    fn sum<I: Iterator<Item = &'a Resources>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

// ── Cluster ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    #[default]
    Unknown,
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    #[serde(default)]
    pub status: Status<ClusterState>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::default(),
            name: name.into(),
            status: Status::new(ClusterState::Active),
            is_deleted: false,
        }
    }
}

// ── Compute capability ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityState {
    #[default]
    Unknown,
    Active,
    Inactive,
}

/// A named trait a node can carry (`gpu`, `ssd`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeCapability {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Status<CapabilityState>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl ComputeCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::default(),
            name: name.into(),
            description: String::new(),
            status: Status::new(CapabilityState::Active),
            is_deleted: false,
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Unknown,
    Active,
    Inactive,
}

/// A host with finite resources onto which runtime instances are placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub update_domain: String,
    pub total_resources: Resources,
    #[serde(default)]
    pub system_reserved_resources: Resources,
    pub remaining_resources: Resources,
    /// Ids of the compute capabilities this node provides.
    #[serde(default)]
    pub capability_ids: Vec<String>,
    /// Reservations held by placements hosted here, keyed by runtime instance id.
    #[serde(default)]
    pub allocations: BTreeMap<RuntimeInstanceId, Resources>,
    #[serde(default)]
    pub status: Status<NodeState>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        cluster_id: impl Into<String>,
        total_resources: Resources,
        system_reserved_resources: Resources,
    ) -> Self {
        Self {
            metadata: Metadata::default(),
            name: name.into(),
            cluster_id: cluster_id.into(),
            update_domain: String::new(),
            total_resources,
            system_reserved_resources,
            remaining_resources: total_resources.saturating_sub(&system_reserved_resources),
            capability_ids: Vec::new(),
            allocations: BTreeMap::new(),
            status: Status::new(NodeState::Active),
            is_deleted: false,
        }
    }

    pub fn with_capabilities(mut self, capability_ids: Vec<String>) -> Self {
        self.capability_ids = capability_ids;
        self
    }

    pub fn with_update_domain(mut self, update_domain: impl Into<String>) -> Self {
        self.update_domain = update_domain.into();
        self
    }

    /// Sum of all reservations currently held on this node.
    pub fn allocated_resources(&self) -> Resources {
        self.allocations.values().sum()
    }

    /// `total - system_reserved - Σ allocations`, or `None` if oversold.
    pub fn expected_remaining(&self) -> Option<Resources> {
        self.total_resources
            .checked_sub(&self.system_reserved_resources)?
            .checked_sub(&self.allocated_resources())
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capability_ids.contains(c))
    }

    /// Reserve `amount` for a runtime instance.
    ///
    /// Returns `Ok(false)` when the runtime instance already holds a
    /// reservation here, so a replayed reservation never double-books.
    pub fn reserve(&mut self, runtime_instance_id: &str, amount: Resources) -> StateResult<bool> {
        if self.allocations.contains_key(runtime_instance_id) {
            return Ok(false);
        }
        let remaining = self.remaining_resources.checked_sub(&amount).ok_or_else(|| {
            StateError::InsufficientResources(format!(
                "node {} has {:?} remaining, {:?} requested",
                self.name, self.remaining_resources, amount
            ))
        })?;
        self.remaining_resources = remaining;
        self.allocations
            .insert(runtime_instance_id.to_string(), amount);
        Ok(true)
    }

    /// Release the reservation of a runtime instance. Returns false if none was held.
    pub fn release(&mut self, runtime_instance_id: &str) -> bool {
        match self.allocations.remove(runtime_instance_id) {
            Some(amount) => {
                self.remaining_resources = self.remaining_resources.saturating_add(&amount);
                true
            }
            None => false,
        }
    }
}

// ── Deployment plan ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentPlanState {
    #[default]
    Unknown,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

/// Placement constraints of a plan. Empty lists impose no constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingComputeCapabilities {
    /// Nodes must belong to one of these clusters.
    #[serde(default)]
    pub cluster_ids: Vec<ClusterId>,
    /// Nodes must carry every one of these capabilities.
    #[serde(default)]
    pub capability_ids: Vec<String>,
}

/// A workload co-located in every runtime instance of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    #[serde(default)]
    pub artifact: String,
    pub resources: Resources,
}

/// A declared target instance count; the reconciliation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub instance_count: u32,
    #[serde(default)]
    pub status: Status<DeploymentState>,
    /// Application name → payload version.
    #[serde(default)]
    pub payload_coordinates: BTreeMap<String, String>,
}

impl Deployment {
    pub fn new(id: impl Into<String>, instance_count: u32) -> Self {
        Self {
            id: id.into(),
            instance_count,
            status: Status::new(DeploymentState::Pending),
            payload_coordinates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub matching_compute_capabilities: MatchingComputeCapabilities,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub status: Status<DeploymentPlanState>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl DeploymentPlan {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::default(),
            name: name.into(),
            namespace: namespace.into(),
            service_name: String::new(),
            matching_compute_capabilities: MatchingComputeCapabilities::default(),
            applications: Vec::new(),
            deployments: Vec::new(),
            status: Status::new(DeploymentPlanState::Active),
            is_deleted: false,
        }
    }

    /// Reservation needed by one runtime instance: all applications together.
    pub fn required_resources(&self) -> Resources {
        self.applications.iter().map(|a| &a.resources).sum()
    }

    pub fn deployment(&self, deployment_id: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.id == deployment_id)
    }

    pub fn deployment_mut(&mut self, deployment_id: &str) -> Option<&mut Deployment> {
        self.deployments.iter_mut().find(|d| d.id == deployment_id)
    }
}

// ── Meta instance ─────────────────────────────────────────────────

/// Lifecycle of the logical instance. The physical lifecycle lives on
/// [`RuntimeState`]; the two vocabularies are deliberately distinct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaInstanceState {
    #[default]
    Pending,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeState {
    #[default]
    Pending,
    Running,
    Failed,
    Terminated,
}

/// One physical placement of a meta instance on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInstance {
    pub id: RuntimeInstanceId,
    pub node_id: NodeId,
    pub is_active: bool,
    /// Reservation held on the node for this placement.
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub status: Status<RuntimeState>,
}

impl RuntimeInstance {
    pub fn new(
        id: impl Into<String>,
        node_id: impl Into<String>,
        is_active: bool,
        resources: Resources,
    ) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            is_active,
            resources,
            status: Status::new(RuntimeState::Pending),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status.state == RuntimeState::Terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Restart,
    Stop,
    Relocate,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    #[default]
    Preparing,
    PendingApproval,
    Approved,
    Succeeded,
    Failed,
    Cancelled,
}

/// A requested lifecycle action on a meta instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// The deployment or user action that requested this operation.
    pub intent_id: String,
    /// The placement this operation allocated or acts on.
    #[serde(default)]
    pub runtime_instance_id: Option<RuntimeInstanceId>,
    #[serde(default)]
    pub status: Status<OperationState>,
}

impl Operation {
    pub fn new(id: impl Into<String>, op_type: OperationType, intent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            op_type,
            intent_id: intent_id.into(),
            runtime_instance_id: None,
            status: Status::new(OperationState::Preparing),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }
}

/// Logical, durable identity of one workload copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaInstance {
    #[serde(default)]
    pub metadata: Metadata,
    pub name: String,
    pub deployment_plan_id: DeploymentPlanId,
    #[serde(default)]
    pub deployment_id: Option<DeploymentId>,
    #[serde(default)]
    pub status: Status<MetaInstanceState>,
    #[serde(default)]
    pub runtime_instances: Vec<RuntimeInstance>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl MetaInstance {
    pub fn new(name: impl Into<String>, deployment_plan_id: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::default(),
            name: name.into(),
            deployment_plan_id: deployment_plan_id.into(),
            deployment_id: None,
            status: Status::new(MetaInstanceState::Pending),
            runtime_instances: Vec::new(),
            operations: Vec::new(),
            is_deleted: false,
        }
    }

    pub fn runtime_instance(&self, id: &str) -> Option<&RuntimeInstance> {
        self.runtime_instances.iter().find(|r| r.id == id)
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.id == id)
    }

    /// The active, non-terminated placement, if any.
    pub fn active_runtime_instance(&self) -> Option<&RuntimeInstance> {
        self.runtime_instances
            .iter()
            .find(|r| r.is_active && !r.is_terminated())
    }

    /// The single non-terminal operation, if any.
    pub fn in_flight_operation(&self) -> Option<&Operation> {
        self.operations.iter().find(|o| !o.is_terminal())
    }

    pub fn live_runtime_instances(&self) -> impl Iterator<Item = &RuntimeInstance> {
        self.runtime_instances.iter().filter(|r| !r.is_terminated())
    }
}

// ── Pending signals ───────────────────────────────────────────────

/// Durable marker of a workflow suspended on an external signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignal {
    pub key: String,
    pub meta_instance_id: MetaInstanceId,
    pub operation_id: OperationId,
    /// Unix timestamp (seconds) when the workflow suspended.
    pub created_at: u64,
}

impl PendingSignal {
    /// Signal key of the approval gate of an operation.
    pub fn approval_key(meta_instance_id: &str, operation_id: &str) -> String {
        format!("approval:{meta_instance_id}:{operation_id}")
    }
}
