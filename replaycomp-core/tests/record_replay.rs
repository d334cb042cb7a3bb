//! End-to-end record and replay through trace files

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use replaycomp_core::prelude::*;
use replaycomp_core::value::{DIVERGENCE_ERROR_CLASS, TO_STRING};

fn naming() -> TypeDescriptor {
    TypeDescriptor::new("Naming")
}

fn name_of() -> Operation {
    Operation::new("nameOf", &["int"])
}

fn members() -> Operation {
    Operation::new("members", &[])
}

fn declarations() -> Arc<Declarations> {
    Arc::new(
        Declarations::builder()
            .register(RegistrationBuilder::new(naming()))
            .unwrap()
            .build(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Recorded {
    path: PathBuf,
    stub: Arc<StubProvider>,
    calls_after_recording: usize,
}

/// Run one unit against a stub answering `nameOf(1)` with "Foo" and save it
fn record(dir: &Path) -> Recorded {
    init_tracing();
    let declarations = declarations();
    let proxies = RecordingProxies::new(Arc::clone(&declarations), Arc::new(OperationRecorder::new()));
    let persistence = TracePersistence::new(&declarations).unwrap();

    let child = StubProvider::new(naming(), "Naming#2").into_ref();
    let stub = Arc::new(
        StubProvider::new(naming(), "Naming#1")
            .with_result(&name_of(), Value::str("Foo"))
            .with_result(&members(), Value::list([Value::Provider(child), Value::Null])),
    );
    let real = ProviderRef::from_shared(&stub);

    let config = RecordingConfig {
        enabled: true,
        filter: None,
        output_dir: dir.to_path_buf(),
    };
    let session = RecordingSession::begin(&config, &proxies, "Unit.run", 1)
        .unwrap()
        .unwrap();
    let proxy = session.proxify(&real).unwrap();
    assert_eq!(proxy.invoke(&name_of(), &[Value::Int(1)]), Ok(Value::str("Foo")));
    // memoized: the stub only sees the first call
    assert_eq!(proxy.invoke(&name_of(), &[Value::Int(1)]), Ok(Value::str("Foo")));
    assert_eq!(stub.calls_of(&name_of()), 1);
    proxy.invoke(&members(), &[]).unwrap();

    let (_, path) = session
        .finish_and_save(&persistence, &real, "default", Some("ret".to_string()))
        .unwrap();
    Recorded {
        path,
        calls_after_recording: stub.call_count(),
        stub,
    }
}

fn receiver(loaded: &LoadedUnit) -> ProviderRef {
    loaded.unit.receiver.as_provider().unwrap().clone()
}

#[test]
fn test_replay_answers_from_trace_without_real_provider() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = record(dir.path());

    let loaded = TraceLoader::new(declarations()).unwrap().load(&recorded.path).unwrap();
    assert_eq!(loaded.unit.unit_id, 1);
    assert_eq!(loaded.unit.final_artifact.as_deref(), Some("ret"));

    let receiver = receiver(&loaded);
    assert!(receiver.is_proxy());
    assert_eq!(receiver.invoke(&name_of(), &[Value::Int(1)]), Ok(Value::str("Foo")));
    assert_eq!(receiver.invoke(&TO_STRING, &[]), Ok(Value::str("Naming#1")));

    let Value::List(items) = receiver.invoke(&members(), &[]).unwrap() else {
        panic!("members should replay as a list");
    };
    let child = items[0].as_provider().unwrap();
    assert!(child.is_proxy());
    assert_eq!(child.invoke(&TO_STRING, &[]), Ok(Value::str("Naming#2")));
    assert!(items[1].is_null());

    assert_eq!(recorded.stub.call_count(), recorded.calls_after_recording);
}

#[test]
fn test_trace_gives_each_instance_one_id() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = record(dir.path());
    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&recorded.path).unwrap()).unwrap();

    let receiver = &document["receiver"];
    let operations = document["operations"].as_array().unwrap();
    let root_calls: Vec<_> = operations
        .iter()
        .filter(|op| op["recv"] == *receiver)
        .map(|op| op["method"][0].as_str().unwrap())
        .collect();
    assert_eq!(root_calls.len(), 3, "{:?}", root_calls);
    for method in ["nameOf", "members", "toString"] {
        assert!(root_calls.contains(&method), "{} missing from {:?}", method, root_calls);
    }
}

#[test]
fn test_missing_entry_diverges_in_strict_mode() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = record(dir.path());
    let strict = || {
        TraceLoader::new(declarations())
            .unwrap()
            .with_options(ReplayOptions::strict())
    };

    // every recorded call replays while the trace is intact
    let original = strict().load(&recorded.path).unwrap();
    let root = receiver(&original);
    assert_eq!(root.invoke(&name_of(), &[Value::Int(1)]), Ok(Value::str("Foo")));
    assert!(root.invoke(&members(), &[]).is_ok());
    assert_eq!(root.invoke(&TO_STRING, &[]), Ok(Value::str("Naming#1")));
    assert_eq!(TraceVerifier.replay(&original).unwrap(), None);

    let mut document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&recorded.path).unwrap()).unwrap();
    let operations = document["operations"].as_array_mut().unwrap();
    let before = operations.len();
    operations.retain(|op| op["method"][0] != "nameOf");
    assert_eq!(operations.len(), before - 1);
    let edited = dir.path().join("2.json");
    fs::write(&edited, serde_json::to_string_pretty(&document).unwrap()).unwrap();

    let loaded = strict().load(&edited).unwrap();
    let root = receiver(&loaded);
    let err = root.invoke(&name_of(), &[Value::Int(1)]).unwrap_err();
    assert_eq!(err.class(), DIVERGENCE_ERROR_CLASS);
    let Some(ReplayCompError::Divergence(divergence)) = err.framework_cause() else {
        panic!("expected a divergence, got {:?}", err);
    };
    assert_eq!(divergence.operation.name(), "nameOf");
    assert!(divergence.recorded_keys.is_empty());
    assert!(divergence.to_string().contains("nameOf"));

    // the rest of the receiver's calls still replay
    assert_eq!(root.invoke(&TO_STRING, &[]), Ok(Value::str("Naming#1")));
}

#[test]
fn test_batch_replay_of_directory() {
    let dir = tempfile::tempdir().unwrap();
    record(dir.path());

    let traces = discover_traces(dir.path(), "json").unwrap();
    assert_eq!(traces, vec![dir.path().join("1.json")]);

    let loader = TraceLoader::new(declarations())
        .unwrap()
        .with_options(ReplayOptions::strict());
    let summary = run_replay(&loader, &TraceVerifier, &traces, true);
    assert!(summary.passed());
    assert_eq!(summary.successes(), 1);
}
