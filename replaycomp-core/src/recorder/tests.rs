//! Tests for the operation recorder scopes

use super::*;
use crate::stub::StubProvider;
use crate::value::TypeDescriptor;

fn key(receiver: &ProviderRef, name: &str, arg: i32) -> OperationKey {
    OperationKey::new(
        receiver.clone(),
        Operation::new(name, &["int"]),
        vec![Value::Int(arg)],
    )
}

fn receiver() -> ProviderRef {
    StubProvider::new(TypeDescriptor::new("Resolver"), "resolver").into_ref()
}

#[test]
fn test_memoized_result_is_stable() {
    let recorder = OperationRecorder::new();
    let _unit = recorder.enter_unit_scope();
    let recv = receiver();

    recorder.record_return(key(&recv, "lookup", 1), Value::str("A"));

    for _ in 0..2 {
        assert_eq!(
            recorder.get_result_or_marker(&key(&recv, "lookup", 1)),
            ResultOrMarker::Value(Value::str("A"))
        );
    }
    assert!(recorder.get_result_or_marker(&key(&recv, "lookup", 2)).is_no_result());
}

#[test]
fn test_last_write_wins() {
    let recorder = OperationRecorder::new();
    let recv = receiver();

    recorder.record_return(key(&recv, "lookup", 1), Value::Int(1));
    recorder.record_return(key(&recv, "lookup", 1), Value::Int(2));

    assert_eq!(
        recorder.get_result_or_marker(&key(&recv, "lookup", 1)),
        ResultOrMarker::Value(Value::Int(2))
    );
    assert_eq!(recorder.global_len(), 1);
}

#[test]
fn test_unit_reads_fall_back_to_global() {
    let recorder = OperationRecorder::new();
    let recv = receiver();
    recorder.record_return(key(&recv, "init", 0), Value::Bool(true));

    let unit = recorder.enter_unit_scope();
    assert_eq!(
        recorder.get_result_or_marker(&key(&recv, "init", 0)),
        ResultOrMarker::Value(Value::Bool(true))
    );

    recorder.record_return(key(&recv, "lookup", 3), Value::Null);
    drop(unit);

    // unit entries vanish with the scope
    assert!(recorder.get_result_or_marker(&key(&recv, "lookup", 3)).is_no_result());
}

#[test]
fn test_scope_stacking_restores_previous_scope() {
    let recorder = OperationRecorder::new();
    assert_eq!(recorder.current_scope(), ScopeKind::Global);

    let unit = recorder.enter_unit_scope();
    assert_eq!(recorder.current_scope(), ScopeKind::Unit);
    {
        let _ignored = recorder.enter_ignored_scope();
        assert_eq!(recorder.current_scope(), ScopeKind::Ignored);
        {
            let _inner = recorder.enter_unit_scope();
            assert_eq!(recorder.current_scope(), ScopeKind::Unit);
        }
        assert_eq!(recorder.current_scope(), ScopeKind::Ignored);
    }
    assert_eq!(recorder.current_scope(), ScopeKind::Unit);
    drop(unit);
    assert_eq!(recorder.current_scope(), ScopeKind::Global);
}

#[test]
fn test_ignored_scope_suppresses_reads_and_writes() {
    let recorder = OperationRecorder::new();
    let recv = receiver();
    recorder.record_return(key(&recv, "global", 0), Value::Int(7));

    let _unit = recorder.enter_unit_scope();
    {
        let _ignored = recorder.enter_ignored_scope();
        assert!(recorder.get_result_or_marker(&key(&recv, "global", 0)).is_no_result());
        recorder.record_return(key(&recv, "template", 1), Value::Int(1));
    }
    recorder.record_return(key(&recv, "unit", 2), Value::Int(2));

    let operations = recorder.current_recorded_operations().unwrap();
    let names: Vec<_> = operations.iter().map(|op| op.operation.name()).collect();
    assert_eq!(names, vec!["global", "unit"]);
}

#[test]
fn test_recorded_operations_require_unit_scope() {
    let recorder = OperationRecorder::new();
    assert!(matches!(
        recorder.current_recorded_operations(),
        Err(ReplayCompError::ScopeViolation(_))
    ));

    let _unit = recorder.enter_unit_scope();
    let _ignored = recorder.enter_ignored_scope();
    assert!(recorder.current_recorded_operations().is_err());
}

#[test]
fn test_global_entries_keep_insertion_order() {
    let recorder = OperationRecorder::new();
    let recv = receiver();
    for i in 0..10 {
        recorder.record_return(key(&recv, "step", i), Value::Int(i));
    }

    let _unit = recorder.enter_unit_scope();
    let args: Vec<_> = recorder
        .current_recorded_operations()
        .unwrap()
        .iter()
        .map(|op| op.args[0].clone())
        .collect();
    assert_eq!(args, (0..10).map(Value::Int).collect::<Vec<_>>());
}

#[test]
fn test_unit_overrides_global_entry() {
    let recorder = OperationRecorder::new();
    let recv = receiver();
    recorder.record_return(key(&recv, "lookup", 1), Value::Int(1));

    let _unit = recorder.enter_unit_scope();
    recorder.record_exception(
        key(&recv, "lookup", 1),
        ThrownError::new("LinkageError", None),
    );

    let operations = recorder.current_recorded_operations().unwrap();
    assert_eq!(operations.len(), 1);
    assert!(matches!(
        operations[0].result.to_outcome(),
        Some(Err(ref e)) if e.class() == "LinkageError"
    ));
}

#[test]
fn test_scopes_are_per_recorder() {
    let first = OperationRecorder::new();
    let second = OperationRecorder::new();

    let _unit = first.enter_unit_scope();
    assert_eq!(first.current_scope(), ScopeKind::Unit);
    assert_eq!(second.current_scope(), ScopeKind::Global);
}

#[test]
fn test_scopes_are_per_thread() {
    let recorder = Arc::new(OperationRecorder::new());
    let _unit = recorder.enter_unit_scope();

    let shared = Arc::clone(&recorder);
    let scope = std::thread::spawn(move || shared.current_scope())
        .join()
        .unwrap();
    assert_eq!(scope, ScopeKind::Global);
}

#[test]
fn test_out_of_order_release_removes_frame() {
    let recorder = OperationRecorder::new();
    let unit = recorder.enter_unit_scope();
    let ignored = recorder.enter_ignored_scope();

    drop(unit);
    assert_eq!(recorder.current_scope(), ScopeKind::Ignored);
    drop(ignored);
    assert_eq!(recorder.current_scope(), ScopeKind::Global);
}
