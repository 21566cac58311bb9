//! Meta-instance aggregate.
//!
//! A [`MetaInstance`] owns its runtime instances and operations as plain
//! value collections. Every mutator here is one compare-and-swap against
//! the aggregate's own version: load, apply a single element-level change
//! in memory, re-validate the aggregate, persist. An invariant violation
//! aborts before anything is written.

use tracing::info;

use crate::error::{StateError, StateResult};
use crate::ledger::Ledger;
use crate::operation::validate_transition;
use crate::types::*;

/// Aggregate-wide invariants, checked before every write.
///
/// - runtime instance ids and operation ids are unique
/// - at most one non-terminated runtime instance is active
/// - at most two non-terminated runtime instances exist (active + passive)
/// - at most one operation is in flight
pub(crate) fn validate_meta_instance(meta: &MetaInstance) -> StateResult<()> {
    for (i, rt) in meta.runtime_instances.iter().enumerate() {
        if meta.runtime_instances[..i].iter().any(|r| r.id == rt.id) {
            return Err(invalid(meta, format!("duplicate runtime instance {}", rt.id)));
        }
    }
    for (i, op) in meta.operations.iter().enumerate() {
        if meta.operations[..i].iter().any(|o| o.id == op.id) {
            return Err(invalid(meta, format!("duplicate operation {}", op.id)));
        }
    }

    let active = meta
        .live_runtime_instances()
        .filter(|r| r.is_active)
        .count();
    if active > 1 {
        return Err(invalid(meta, format!("{active} active runtime instances")));
    }

    let live = meta.live_runtime_instances().count();
    if live > 2 {
        return Err(invalid(meta, format!("{live} non-terminated runtime instances")));
    }

    let in_flight = meta.operations.iter().filter(|o| !o.is_terminal()).count();
    if in_flight > 1 {
        return Err(invalid(meta, format!("{in_flight} operations in flight")));
    }
    Ok(())
}

fn invalid(meta: &MetaInstance, detail: String) -> StateError {
    StateError::InvalidStateTransition(format!("meta instance {}: {detail}", meta.name))
}

fn runtime_mut<'a>(meta: &'a mut MetaInstance, id: &str) -> StateResult<&'a mut RuntimeInstance> {
    meta.runtime_instances
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| StateError::not_found("runtime instance", id))
}

fn operation_mut<'a>(meta: &'a mut MetaInstance, id: &str) -> StateResult<&'a mut Operation> {
    meta.operations
        .iter_mut()
        .find(|o| o.id == id)
        .ok_or_else(|| StateError::not_found("operation", id))
}

impl Ledger<MetaInstance> {
    /// Append a placement.
    ///
    /// A second non-terminated placement is only accepted while a RELOCATE
    /// is in flight.
    pub fn add_runtime_instance(
        &self,
        expected: &Metadata,
        runtime_instance: RuntimeInstance,
    ) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            if meta.runtime_instance(&runtime_instance.id).is_some() {
                return Err(StateError::already_exists(
                    "runtime instance",
                    runtime_instance.id.as_str(),
                ));
            }
            let relocating = meta
                .in_flight_operation()
                .is_some_and(|o| o.op_type == OperationType::Relocate);
            if meta.live_runtime_instances().count() >= 1 && !relocating {
                return Err(invalid(
                    meta,
                    "a second placement requires an in-flight RELOCATE".to_string(),
                ));
            }
            meta.runtime_instances.push(runtime_instance);
            Ok(())
        })
    }

    pub fn update_runtime_status(
        &self,
        expected: &Metadata,
        runtime_instance_id: &str,
        status: Status<RuntimeState>,
    ) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            let rt = runtime_mut(meta, runtime_instance_id)?;
            if rt.is_terminated() && status.state != RuntimeState::Terminated {
                return Err(StateError::InvalidStateTransition(format!(
                    "runtime instance {runtime_instance_id} is terminated"
                )));
            }
            rt.status = status;
            Ok(())
        })
    }

    pub fn update_runtime_active_state(
        &self,
        expected: &Metadata,
        runtime_instance_id: &str,
        is_active: bool,
    ) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            let rt = runtime_mut(meta, runtime_instance_id)?;
            if is_active && rt.is_terminated() {
                return Err(StateError::InvalidStateTransition(format!(
                    "terminated runtime instance {runtime_instance_id} cannot become active"
                )));
            }
            rt.is_active = is_active;
            Ok(())
        })
    }

    /// Remove a placement. A RUNNING placement must be stopped first.
    pub fn remove_runtime_instance(
        &self,
        expected: &Metadata,
        runtime_instance_id: &str,
    ) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            let rt = runtime_mut(meta, runtime_instance_id)?;
            if rt.status.state == RuntimeState::Running {
                return Err(StateError::InvalidStateTransition(format!(
                    "runtime instance {runtime_instance_id} is still running"
                )));
            }
            meta.runtime_instances.retain(|r| r.id != runtime_instance_id);
            Ok(())
        })
    }

    /// Append an operation. It must start in PREPARING and no other
    /// operation may be in flight.
    pub fn add_operation(&self, expected: &Metadata, operation: Operation) -> StateResult<MetaInstance> {
        let op_id = operation.id.clone();
        let op_type = operation.op_type;
        let updated = self.compare_and_swap(expected, |meta| {
            if meta.operation(&operation.id).is_some() {
                return Err(StateError::already_exists("operation", operation.id.as_str()));
            }
            if operation.status.state != OperationState::Preparing {
                return Err(StateError::InvalidStateTransition(format!(
                    "operation {} must be created in PREPARING, not {:?}",
                    operation.id, operation.status.state
                )));
            }
            if let Some(current) = meta.in_flight_operation() {
                return Err(invalid(
                    meta,
                    format!("operation {} is already in flight", current.id),
                ));
            }
            meta.operations.push(operation);
            Ok(())
        })?;
        info!(meta_instance = %updated.name, operation = %op_id, ?op_type, "operation added");
        Ok(updated)
    }

    /// The single entry point for operation transitions.
    pub fn update_operation_status(
        &self,
        expected: &Metadata,
        operation_id: &str,
        status: Status<OperationState>,
    ) -> StateResult<MetaInstance> {
        let to = status.state;
        let updated = self.compare_and_swap(expected, |meta| {
            let op = operation_mut(meta, operation_id)?;
            validate_transition(op.status.state, status.state)?;
            op.status = status;
            Ok(())
        })?;
        info!(meta_instance = %updated.name, operation = %operation_id, state = ?to, "operation transitioned");
        Ok(updated)
    }

    /// Remove a finished operation.
    pub fn remove_operation(&self, expected: &Metadata, operation_id: &str) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            let op = operation_mut(meta, operation_id)?;
            if !op.is_terminal() {
                return Err(StateError::InvalidStateTransition(format!(
                    "operation {operation_id} is still in flight"
                )));
            }
            meta.operations.retain(|o| o.id != operation_id);
            Ok(())
        })
    }

    /// Tag the meta instance to a deployment.
    pub fn update_deployment_id(&self, expected: &Metadata, deployment_id: &str) -> StateResult<MetaInstance> {
        self.compare_and_swap(expected, |meta| {
            meta.deployment_id = Some(deployment_id.to_string());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateStore;

    fn setup() -> (Ledger<MetaInstance>, MetaInstance) {
        let store = StateStore::open_in_memory().unwrap();
        let ledger = store.meta_instances();
        let meta = ledger.create(MetaInstance::new("web-0", "plan-1")).unwrap();
        (ledger, meta)
    }

    fn running(id: &str, node: &str, active: bool) -> RuntimeInstance {
        let mut rt = RuntimeInstance::new(id, node, active, Resources::new(1, 256));
        rt.status = Status::new(RuntimeState::Running);
        rt
    }

    #[test]
    fn nested_mutations_bump_aggregate_version() {
        let (ledger, meta) = setup();
        assert_eq!(meta.metadata.version, 1);

        let meta = ledger
            .add_runtime_instance(&meta.metadata, RuntimeInstance::new("rt-1", "n1", true, Resources::ZERO))
            .unwrap();
        assert_eq!(meta.metadata.version, 2);

        let meta = ledger
            .update_runtime_status(&meta.metadata, "rt-1", Status::new(RuntimeState::Running))
            .unwrap();
        assert_eq!(meta.metadata.version, 3);
        assert_eq!(meta.runtime_instances[0].status.state, RuntimeState::Running);
    }

    #[test]
    fn nested_mutation_with_stale_version_conflicts() {
        let (ledger, meta) = setup();
        let stale = meta.metadata.clone();
        ledger.update_deployment_id(&meta.metadata, "dep-1").unwrap();

        let err = ledger
            .add_operation(&stale, Operation::new("op-1", OperationType::Create, "dep-1"))
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert!(ledger.get(&meta.metadata.id).unwrap().operations.is_empty());
    }

    #[test]
    fn second_active_instance_rejected_without_write() {
        let (ledger, meta) = setup();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-1", "n1", true)).unwrap();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-1", OperationType::Relocate, "user"))
            .unwrap();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-2", "n2", false)).unwrap();

        let err = ledger
            .update_runtime_active_state(&meta.metadata, "rt-2", true)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));

        let stored = ledger.get(&meta.metadata.id).unwrap();
        assert_eq!(stored.metadata.version, meta.metadata.version);
        assert!(!stored.runtime_instance("rt-2").unwrap().is_active);
    }

    #[test]
    fn passive_placement_requires_relocate_in_flight() {
        let (ledger, meta) = setup();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-1", "n1", true)).unwrap();

        let err = ledger
            .add_runtime_instance(&meta.metadata, RuntimeInstance::new("rt-2", "n2", false, Resources::ZERO))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));
    }

    #[test]
    fn relocate_swap_keeps_single_active() {
        let (ledger, meta) = setup();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-a", "n1", true)).unwrap();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-1", OperationType::Relocate, "user"))
            .unwrap();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-b", "n2", false)).unwrap();

        let meta = ledger.update_runtime_active_state(&meta.metadata, "rt-a", false).unwrap();
        let meta = ledger.update_runtime_active_state(&meta.metadata, "rt-b", true).unwrap();
        let meta = ledger
            .update_runtime_status(&meta.metadata, "rt-a", Status::new(RuntimeState::Terminated))
            .unwrap();
        let meta = ledger.remove_runtime_instance(&meta.metadata, "rt-a").unwrap();

        assert_eq!(meta.runtime_instances.len(), 1);
        assert_eq!(meta.active_runtime_instance().unwrap().node_id, "n2");
    }

    #[test]
    fn running_instance_cannot_be_removed() {
        let (ledger, meta) = setup();
        let meta = ledger.add_runtime_instance(&meta.metadata, running("rt-1", "n1", true)).unwrap();

        let err = ledger.remove_runtime_instance(&meta.metadata, "rt-1").unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));
    }

    #[test]
    fn approving_preparing_operation_is_rejected_and_unchanged() {
        let (ledger, meta) = setup();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-1", OperationType::Create, "dep-1"))
            .unwrap();

        let err = ledger
            .update_operation_status(&meta.metadata, "op-1", Status::new(OperationState::Approved))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));

        let stored = ledger.get(&meta.metadata.id).unwrap();
        assert_eq!(stored.operation("op-1").unwrap().status.state, OperationState::Preparing);
        assert_eq!(stored.metadata.version, meta.metadata.version);
    }

    #[test]
    fn only_one_operation_in_flight() {
        let (ledger, meta) = setup();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-1", OperationType::Create, "dep-1"))
            .unwrap();

        let err = ledger
            .add_operation(&meta.metadata, Operation::new("op-2", OperationType::Stop, "user"))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));

        let meta = ledger
            .update_operation_status(&meta.metadata, "op-1", Status::with_message(OperationState::Failed, "boom"))
            .unwrap();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-2", OperationType::Stop, "user"))
            .unwrap();
        assert_eq!(meta.operations.len(), 2);
    }

    #[test]
    fn operation_must_start_preparing() {
        let (ledger, meta) = setup();
        let mut op = Operation::new("op-1", OperationType::Create, "dep-1");
        op.status = Status::new(OperationState::Approved);

        let err = ledger.add_operation(&meta.metadata, op).unwrap_err();
        assert!(matches!(err, StateError::InvalidStateTransition(_)));
    }

    #[test]
    fn only_terminal_operations_are_removable() {
        let (ledger, meta) = setup();
        let meta = ledger
            .add_operation(&meta.metadata, Operation::new("op-1", OperationType::Create, "dep-1"))
            .unwrap();
        assert!(ledger.remove_operation(&meta.metadata, "op-1").is_err());

        let meta = ledger
            .update_operation_status(&meta.metadata, "op-1", Status::new(OperationState::Cancelled))
            .unwrap();
        let meta = ledger.remove_operation(&meta.metadata, "op-1").unwrap();
        assert!(meta.operations.is_empty());
    }

    #[test]
    fn missing_nested_elements_are_not_found() {
        let (ledger, meta) = setup();
        assert!(ledger
            .update_runtime_status(&meta.metadata, "nope", Status::new(RuntimeState::Running))
            .unwrap_err()
            .is_not_found());
        assert!(ledger
            .update_operation_status(&meta.metadata, "nope", Status::new(OperationState::Failed))
            .unwrap_err()
            .is_not_found());
    }
}
