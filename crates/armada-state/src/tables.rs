//! redb table definitions for the Armada ledger.
//!
//! Every resource kind owns two tables: records keyed by `{id}` and a name
//! index keyed by `{name}` holding the id of the live (non-deleted) record.
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

pub type Table = TableDefinition<'static, &'static str, &'static [u8]>;
pub type NameIndex = TableDefinition<'static, &'static str, &'static str>;

pub const CLUSTERS: Table = TableDefinition::new("clusters");
pub const CLUSTER_NAMES: NameIndex = TableDefinition::new("cluster_names");

pub const COMPUTE_CAPABILITIES: Table = TableDefinition::new("compute_capabilities");
pub const COMPUTE_CAPABILITY_NAMES: NameIndex = TableDefinition::new("compute_capability_names");

pub const NODES: Table = TableDefinition::new("nodes");
pub const NODE_NAMES: NameIndex = TableDefinition::new("node_names");

pub const DEPLOYMENT_PLANS: Table = TableDefinition::new("deployment_plans");
pub const DEPLOYMENT_PLAN_NAMES: NameIndex = TableDefinition::new("deployment_plan_names");

pub const META_INSTANCES: Table = TableDefinition::new("meta_instances");
pub const META_INSTANCE_NAMES: NameIndex = TableDefinition::new("meta_instance_names");

/// Operations suspended on an external signal, keyed by `{signal_key}`.
pub const PENDING_SIGNALS: Table = TableDefinition::new("pending_signals");
