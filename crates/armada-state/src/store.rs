//! StateStore: redb-backed persistence for Armada.
//!
//! Owns the database handle and hands out one typed [`Ledger`] per resource
//! kind. Also stores the pending-signal markers of suspended workflows. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::ledger::{Ledger, LedgerRecord, decode, encode};
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [CLUSTERS, COMPUTE_CAPABILITIES, NODES, DEPLOYMENT_PLANS, META_INSTANCES, PENDING_SIGNALS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        for index in [
            CLUSTER_NAMES,
            COMPUTE_CAPABILITY_NAMES,
            NODE_NAMES,
            DEPLOYMENT_PLAN_NAMES,
            META_INSTANCE_NAMES,
        ] {
            txn.open_table(index).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Ledger for any record kind.
    pub fn ledger<R: LedgerRecord>(&self) -> Ledger<R> {
        Ledger::new(Arc::clone(&self.db))
    }

    pub fn clusters(&self) -> Ledger<Cluster> {
        self.ledger()
    }

    pub fn compute_capabilities(&self) -> Ledger<ComputeCapability> {
        self.ledger()
    }

    pub fn nodes(&self) -> Ledger<Node> {
        self.ledger()
    }

    pub fn deployment_plans(&self) -> Ledger<DeploymentPlan> {
        self.ledger()
    }

    pub fn meta_instances(&self) -> Ledger<MetaInstance> {
        self.ledger()
    }

    // ── Pending signals ────────────────────────────────────────────

    /// Record that a workflow is suspended on `signal.key`.
    pub fn put_pending_signal(&self, signal: &PendingSignal) -> StateResult<()> {
        let value = encode(signal)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PENDING_SIGNALS).map_err(map_err!(Table))?;
            table
                .insert(signal.key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %signal.key, "pending signal stored");
        Ok(())
    }

    pub fn get_pending_signal(&self, key: &str) -> StateResult<Option<PendingSignal>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING_SIGNALS).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List every suspended workflow.
    pub fn list_pending_signals(&self) -> StateResult<Vec<PendingSignal>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PENDING_SIGNALS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Clear a pending signal. Returns true if it existed.
    pub fn remove_pending_signal(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PENDING_SIGNALS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "pending signal removed");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Filter, VersionRange};

    fn test_node(name: &str, cluster: &str) -> Node {
        Node::new(name, cluster, Resources::new(4, 4096), Resources::new(1, 512))
    }

    // ── Create / get ───────────────────────────────────────────────

    #[test]
    fn create_assigns_id_and_version_one() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = store.clusters().create(Cluster::new("east")).unwrap();

        assert!(!cluster.metadata.id.is_empty());
        assert_eq!(cluster.metadata.version, 1);
        assert_eq!(store.clusters().get(&cluster.metadata.id).unwrap(), cluster);
        assert_eq!(store.clusters().get_by_name("east").unwrap(), cluster);
    }

    #[test]
    fn create_keeps_caller_id_and_rejects_replay() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cluster = Cluster::new("east");
        cluster.metadata.id = "c-1".to_string();

        let created = store.clusters().create(cluster.clone()).unwrap();
        assert_eq!(created.metadata.id, "c-1");

        let err = store.clusters().create(cluster).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn duplicate_live_name_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.nodes().create(test_node("n1", "c1")).unwrap();

        let err = store.nodes().create(test_node("n1", "c2")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists { kind: "node", .. }));
    }

    #[test]
    fn missing_record_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.nodes().get("nope").unwrap_err().is_not_found());
        assert!(store.nodes().get_by_name("nope").unwrap_err().is_not_found());
    }

    // ── Compare-and-swap ───────────────────────────────────────────

    #[test]
    fn update_status_increments_version() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let cluster = ledger.create(Cluster::new("east")).unwrap();

        let updated = ledger
            .update_status(&cluster.metadata, Status::with_message(ClusterState::Inactive, "drained"))
            .unwrap();
        assert_eq!(updated.metadata.version, 2);
        assert_eq!(updated.status.state, ClusterState::Inactive);
        assert_eq!(updated.status.message, "drained");
    }

    #[test]
    fn stale_version_conflicts_and_leaves_record_untouched() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let cluster = ledger.create(Cluster::new("east")).unwrap();
        ledger
            .update_status(&cluster.metadata, Status::new(ClusterState::Inactive))
            .unwrap();

        let err = ledger
            .update_status(&cluster.metadata, Status::new(ClusterState::Unknown))
            .unwrap_err();
        match err {
            StateError::VersionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected VersionConflict, got {other:?}"),
        }
        let stored = ledger.get(&cluster.metadata.id).unwrap();
        assert_eq!(stored.status.state, ClusterState::Inactive);
        assert_eq!(stored.metadata.version, 2);
    }

    #[test]
    fn concurrent_cas_on_same_version_has_one_winner() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.nodes().create(test_node("n1", "c1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = store.nodes();
                let expected = node.metadata.clone();
                std::thread::spawn(move || {
                    ledger.compare_and_swap(&expected, |n| {
                        n.reserve(&format!("rt-{i}"), Resources::new(1, 256))?;
                        Ok(())
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(StateError::is_version_conflict)
        );

        let stored = store.nodes().get(&node.metadata.id).unwrap();
        assert_eq!(stored.metadata.version, 2);
        assert_eq!(stored.allocations.len(), 1);
        assert_eq!(stored.remaining_resources, Resources::new(2, 3328));
    }

    #[test]
    fn cas_cannot_break_node_accounting() {
        let store = StateStore::open_in_memory().unwrap();
        let node = store.nodes().create(test_node("n1", "c1")).unwrap();

        let err = store
            .nodes()
            .compare_and_swap(&node.metadata, |n| {
                n.remaining_resources = Resources::new(100, 100);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));
        assert_eq!(store.nodes().get(&node.metadata.id).unwrap().metadata.version, 1);
    }

    #[test]
    fn cas_cannot_rename() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = store.clusters().create(Cluster::new("east")).unwrap();

        let err = store
            .clusters()
            .compare_and_swap(&cluster.metadata, |c| {
                c.name = "west".to_string();
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[test]
    fn soft_delete_frees_name_and_hides_from_list() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let cluster = ledger.create(Cluster::new("east")).unwrap();

        let deleted = ledger.delete(&cluster.metadata).unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.metadata.version, 2);
        assert_eq!(deleted.status.state, ClusterState::Inactive);

        assert!(ledger.get(&cluster.metadata.id).unwrap().is_deleted);
        assert!(ledger.list(&Filter::default()).unwrap().is_empty());
        assert_eq!(ledger.list(&Filter::new().include_deleted(true)).unwrap().len(), 1);
        assert!(ledger.get_by_name("east").unwrap_err().is_not_found());

        let again = ledger.create(Cluster::new("east")).unwrap();
        assert_ne!(again.metadata.id, cluster.metadata.id);
    }

    #[test]
    fn delete_twice_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let cluster = ledger.create(Cluster::new("east")).unwrap();
        let deleted = ledger.delete(&cluster.metadata).unwrap();

        assert!(ledger.delete(&deleted.metadata).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_with_stale_version_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let cluster = ledger.create(Cluster::new("east")).unwrap();
        ledger
            .update_status(&cluster.metadata, Status::new(ClusterState::Active))
            .unwrap();

        assert!(ledger.delete(&cluster.metadata).unwrap_err().is_version_conflict());
    }

    // ── List filters ───────────────────────────────────────────────

    #[test]
    fn list_filters_by_field_state_and_version() {
        let store = StateStore::open_in_memory().unwrap();
        let nodes = store.nodes();
        let a = nodes.create(test_node("a", "c1")).unwrap();
        nodes.create(test_node("b", "c2")).unwrap();
        nodes.create(test_node("c", "c1")).unwrap();
        nodes
            .update_status(&a.metadata, Status::new(NodeState::Inactive))
            .unwrap();

        let in_c1 = nodes.list(&Filter::new().field("cluster_id", "c1")).unwrap();
        let names: Vec<_> = in_c1.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);

        let active = nodes.list(&Filter::new().states([NodeState::Active])).unwrap();
        assert_eq!(active.len(), 2);

        let not_inactive = nodes
            .list(&Filter::new().exclude_states([NodeState::Inactive]))
            .unwrap();
        assert!(not_inactive.iter().all(|n| n.name != "a"));

        let bumped = nodes
            .list(&Filter::new().version(VersionRange {
                gte: Some(2),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(bumped.len(), 1);
        assert_eq!(bumped[0].name, "a");

        let limited = nodes.list(&Filter::new().limit(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].name, "a");
    }

    #[test]
    fn list_by_ids_and_names() {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.clusters();
        let east = ledger.create(Cluster::new("east")).unwrap();
        ledger.create(Cluster::new("west")).unwrap();

        let by_id = ledger.list(&Filter::new().ids([east.metadata.id.clone()])).unwrap();
        assert_eq!(by_id, vec![east]);

        let by_name = ledger.list(&Filter::new().names(["west"])).unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name, "west");
    }

    #[test]
    fn unknown_field_matches_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.nodes().create(test_node("a", "c1")).unwrap();

        let none = store.nodes().list(&Filter::new().field("colour", "blue")).unwrap();
        assert!(none.is_empty());
    }

    // ── Pending signals ────────────────────────────────────────────

    #[test]
    fn pending_signal_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();
        let signal = PendingSignal {
            key: PendingSignal::approval_key("mi-1", "op-1"),
            meta_instance_id: "mi-1".to_string(),
            operation_id: "op-1".to_string(),
            created_at: 1000,
        };

        store.put_pending_signal(&signal).unwrap();
        assert_eq!(store.get_pending_signal(&signal.key).unwrap(), Some(signal.clone()));
        assert_eq!(store.list_pending_signals().unwrap().len(), 1);

        assert!(store.remove_pending_signal(&signal.key).unwrap());
        assert!(!store.remove_pending_signal(&signal.key).unwrap());
        assert!(store.list_pending_signals().unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("armada.redb");

        let id = {
            let store = StateStore::open(&db_path).unwrap();
            let plan = store
                .deployment_plans()
                .create(DeploymentPlan::new("web", "prod"))
                .unwrap();
            store
                .deployment_plans()
                .add_deployment(&plan.metadata, Deployment::new("d1", 2))
                .unwrap();
            plan.metadata.id
        };

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let plan = store.deployment_plans().get(&id).unwrap();
        assert_eq!(plan.metadata.version, 2);
        assert_eq!(plan.deployment("d1").unwrap().instance_count, 2);
    }
}
