//! Ledger: the generic, versioned record store.
//!
//! One [`Ledger<R>`] exists per resource kind. The kind's schema lives in
//! its [`LedgerRecord`] impl: which tables hold it, how to reach its
//! metadata and status, which named fields can be filtered on, and which
//! invariants must hold before a write.
//!
//! Every mutation is a compare-and-swap executed inside a single redb write
//! transaction: read the stored record, compare its version with the one
//! the caller observed, apply the change, validate, write, commit. redb
//! serializes write transactions, so no other writer can interleave between
//! the version check and the write. A failed check or failed validation
//! drops the transaction uncommitted.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::filter::Filter;
use crate::tables::{self, NameIndex, Table};
use crate::types::*;

/// Per-kind schema descriptor for the generic ledger.
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type State: Copy + Eq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Human-readable kind, used in errors and logs.
    const KIND: &'static str;

    fn table() -> Table;
    fn name_index() -> NameIndex;

    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
    fn name(&self) -> &str;
    fn status(&self) -> &Status<Self::State>;
    fn set_status(&mut self, status: Status<Self::State>);
    fn is_deleted(&self) -> bool;

    /// Flag the record deleted and move it to its retired state.
    fn mark_deleted(&mut self);

    /// Field mapper: value of a named scalar field for equality filters.
    fn field(&self, _name: &str) -> Option<&str> {
        None
    }

    /// Invariants checked before every write of this record.
    fn validate(&self) -> StateResult<()> {
        Ok(())
    }
}

macro_rules! ledger_record {
    (
        $ty:ty, $state:ty, $kind:literal, $table:path, $names:path, retired = $retired:expr
        $(, fields { $($field:literal => |$r:ident| $value:expr),* $(,)? })?
        $(, validate = $validate:path)?
    ) => {
        impl LedgerRecord for $ty {
            type State = $state;
            const KIND: &'static str = $kind;

            fn table() -> Table {
                $table
            }

            fn name_index() -> NameIndex {
                $names
            }

            fn metadata(&self) -> &Metadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut Metadata {
                &mut self.metadata
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn status(&self) -> &Status<$state> {
                &self.status
            }

            fn set_status(&mut self, status: Status<$state>) {
                self.status = status;
            }

            fn is_deleted(&self) -> bool {
                self.is_deleted
            }

            fn mark_deleted(&mut self) {
                self.is_deleted = true;
                self.status.state = $retired;
            }

            $(
                fn field(&self, name: &str) -> Option<&str> {
                    $(
                        if name == $field {
                            let $r = self;
                            return $value;
                        }
                    )*
                    None
                }
            )?

            $(
                fn validate(&self) -> StateResult<()> {
                    $validate(self)
                }
            )?
        }
    };
}

ledger_record!(
    Cluster, ClusterState, "cluster", tables::CLUSTERS, tables::CLUSTER_NAMES,
    retired = ClusterState::Inactive
);

ledger_record!(
    ComputeCapability, CapabilityState, "compute capability",
    tables::COMPUTE_CAPABILITIES, tables::COMPUTE_CAPABILITY_NAMES,
    retired = CapabilityState::Inactive
);

ledger_record!(
    Node, NodeState, "node", tables::NODES, tables::NODE_NAMES,
    retired = NodeState::Inactive,
    fields {
        "cluster_id" => |n| Some(n.cluster_id.as_str()),
        "update_domain" => |n| Some(n.update_domain.as_str()),
    },
    validate = validate_node
);

ledger_record!(
    DeploymentPlan, DeploymentPlanState, "deployment plan",
    tables::DEPLOYMENT_PLANS, tables::DEPLOYMENT_PLAN_NAMES,
    retired = DeploymentPlanState::Inactive,
    fields {
        "namespace" => |p| Some(p.namespace.as_str()),
        "service_name" => |p| Some(p.service_name.as_str()),
    },
    validate = validate_plan
);

ledger_record!(
    MetaInstance, MetaInstanceState, "meta instance",
    tables::META_INSTANCES, tables::META_INSTANCE_NAMES,
    retired = MetaInstanceState::Inactive,
    fields {
        "deployment_plan_id" => |m| Some(m.deployment_plan_id.as_str()),
        "deployment_id" => |m| m.deployment_id.as_deref(),
    },
    validate = crate::aggregate::validate_meta_instance
);

/// Remaining capacity must equal what the reservations leave over.
fn validate_node(node: &Node) -> StateResult<()> {
    match node.expected_remaining() {
        Some(expected) if expected == node.remaining_resources => Ok(()),
        Some(expected) => Err(StateError::InvalidStateTransition(format!(
            "node {} remaining {:?} does not match capacity minus reservations {:?}",
            node.name, node.remaining_resources, expected
        ))),
        None => Err(StateError::InsufficientResources(format!(
            "node {} reservations exceed its capacity",
            node.name
        ))),
    }
}

fn validate_plan(plan: &DeploymentPlan) -> StateResult<()> {
    for (i, deployment) in plan.deployments.iter().enumerate() {
        if plan.deployments[..i].iter().any(|d| d.id == deployment.id) {
            return Err(StateError::InvalidStateTransition(format!(
                "deployment plan {} lists deployment {} twice",
                plan.name, deployment.id
            )));
        }
    }
    Ok(())
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Typed, versioned store for one resource kind.
pub struct Ledger<R> {
    db: Arc<Database>,
    _kind: PhantomData<fn() -> R>,
}

impl<R> Clone for Ledger<R> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            _kind: PhantomData,
        }
    }
}

impl<R: LedgerRecord> Ledger<R> {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            _kind: PhantomData,
        }
    }

    /// Insert a new record at version 1.
    ///
    /// An empty `metadata.id` is replaced by a fresh UUID; a caller-supplied
    /// id is kept, so replaying a create with the same id yields
    /// `AlreadyExists` instead of a duplicate.
    pub fn create(&self, mut record: R) -> StateResult<R> {
        if record.metadata().id.is_empty() {
            record.metadata_mut().id = Uuid::new_v4().to_string();
        }
        record.metadata_mut().version = 1;
        record.validate()?;

        let id = record.metadata().id.clone();
        let name = record.name().to_string();
        let value = encode(&record)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(R::table()).map_err(map_err!(Table))?;
            let mut names = txn.open_table(R::name_index()).map_err(map_err!(Table))?;
            if table.get(id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::already_exists(R::KIND, id));
            }
            if names.get(name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::already_exists(R::KIND, name));
            }
            table
                .insert(id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            names
                .insert(name.as_str(), id.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %id, %name, "record created");
        Ok(record)
    }

    /// Get a record by id. Deleted records are still returned.
    pub fn get(&self, id: &str) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::table()).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Err(StateError::not_found(R::KIND, id)),
        }
    }

    /// Get the live record holding `name`.
    pub fn get_by_name(&self, name: &str) -> StateResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let names = txn.open_table(R::name_index()).map_err(map_err!(Table))?;
        let id = match names.get(name).map_err(map_err!(Read))? {
            Some(guard) => guard.value().to_string(),
            None => return Err(StateError::not_found(R::KIND, name)),
        };
        let table = txn.open_table(R::table()).map_err(map_err!(Table))?;
        match table.get(id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => decode(guard.value()),
            None => Err(StateError::not_found(R::KIND, name)),
        }
    }

    /// List records passing `filter`, ordered by name.
    pub fn list(&self, filter: &Filter<R::State>) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::table()).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: R = decode(value.value())?;
            if filter.matches(&record) {
                results.push(record);
            }
        }
        results.sort_by(|a, b| a.name().cmp(b.name()));
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Replace the status. The ledger accepts any target state; transition
    /// rules belong to the caller.
    pub fn update_status(&self, expected: &Metadata, status: Status<R::State>) -> StateResult<R> {
        self.compare_and_swap(expected, |record| {
            record.set_status(status);
            Ok(())
        })
    }

    /// Soft-delete: flag the record, retire its state, and free its name.
    pub fn delete(&self, expected: &Metadata) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(R::table()).map_err(map_err!(Table))?;
            let mut names = txn.open_table(R::name_index()).map_err(map_err!(Table))?;
            let mut record = load_checked::<R, _>(&table, expected)?;
            if record.is_deleted() {
                return Err(StateError::not_found(R::KIND, expected.id.as_str()));
            }
            record.mark_deleted();
            record.metadata_mut().version = expected.version + 1;
            let value = encode(&record)?;
            table
                .insert(expected.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            names.remove(record.name()).map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, id = %expected.id, "record deleted");
        Ok(record)
    }

    /// Atomically apply `mutate` if the stored version equals `expected.version`.
    ///
    /// On success the version is incremented by exactly one and the new
    /// record is returned. A stale version yields `VersionConflict`; an error
    /// from `mutate` or from [`LedgerRecord::validate`] aborts without a write.
    pub fn compare_and_swap<F>(&self, expected: &Metadata, mutate: F) -> StateResult<R>
    where
        F: FnOnce(&mut R) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(R::table()).map_err(map_err!(Table))?;
            let mut record = load_checked::<R, _>(&table, expected)?;
            let name = record.name().to_string();
            mutate(&mut record)?;
            if record.name() != name {
                return Err(StateError::InvalidStateTransition(format!(
                    "{} {} cannot be renamed",
                    R::KIND,
                    expected.id
                )));
            }
            record.validate()?;
            *record.metadata_mut() = Metadata::new(expected.id.as_str(), expected.version + 1);
            let value = encode(&record)?;
            table
                .insert(expected.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            kind = R::KIND,
            id = %expected.id,
            version = expected.version + 1,
            "record updated"
        );
        Ok(record)
    }
}

/// Read a record inside a write transaction and check its version.
fn load_checked<R, T>(table: &T, expected: &Metadata) -> StateResult<R>
where
    R: LedgerRecord,
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let record: R = match table.get(expected.id.as_str()).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value())?,
        None => return Err(StateError::not_found(R::KIND, expected.id.as_str())),
    };
    let actual = record.metadata().version;
    if actual != expected.version {
        return Err(StateError::VersionConflict {
            kind: R::KIND,
            id: expected.id.clone(),
            expected: expected.version,
            actual,
        });
    }
    Ok(record)
}
