//! Tests for trace persistence

use serde_json::json;
use std::sync::Arc;

use super::*;
use crate::declarations::RegistrationBuilder;
use crate::proxy::{ReplayOptions, ReplayProxies};
use crate::recorder::RecordedOperation;
use crate::stub::StubProvider;
use crate::value::{
    ArrayValue, ElementType, GraphRef, Operation, ProfiledType, Record, StackFrame, ThrownError,
    TriState, TypeProfile, ExactF64,
};

fn resolver() -> TypeDescriptor {
    TypeDescriptor::new("Resolver")
}

fn runtime() -> TypeDescriptor {
    TypeDescriptor::new("Runtime")
}

fn declarations() -> Arc<Declarations> {
    Arc::new(
        Declarations::builder()
            .register(RegistrationBuilder::new(resolver()))
            .unwrap()
            .register(RegistrationBuilder::new(runtime()).singleton(true))
            .unwrap()
            .build(),
    )
}

struct Fixture {
    declarations: Arc<Declarations>,
    persistence: TracePersistence,
}

impl Fixture {
    fn new() -> Self {
        let declarations = declarations();
        let persistence = TracePersistence::new(&declarations).unwrap();
        Self {
            declarations,
            persistence,
        }
    }

    fn factory(&self) -> ReplayProxies {
        ReplayProxies::new(Arc::clone(&self.declarations), ReplayOptions::default())
    }

    fn proxy(&self, factory: &ReplayProxies, ty: &TypeDescriptor) -> ProviderRef {
        let registration = self.declarations.registration(ty).unwrap();
        factory.create_proxy(registration).unwrap()
    }

    fn round_trip(&self, value: &Value) -> Value {
        let json = self.persistence.write_value(value).unwrap();
        self.persistence.read_value(&json, &self.factory()).unwrap()
    }
}

#[test]
fn test_numbers_are_written_as_bit_patterns() {
    let fixture = Fixture::new();
    let write = |v: Value| fixture.persistence.write_value(&v).unwrap();

    assert_eq!(
        write(Value::Byte(-1)),
        json!({"tag": "number", "class": "Byte", "value": "ffffffff"})
    );
    assert_eq!(write(Value::Int(1))["value"], "1");
    assert_eq!(write(Value::Long(-2))["value"], "fffffffffffffffe");
    assert_eq!(write(Value::Double(1.0))["value"], "3ff0000000000000");
    assert_eq!(write(Value::Float(-0.0))["value"], "80000000");
    assert_eq!(write(Value::Null), Json::Null);
}

#[test]
fn test_scalars_survive_bit_for_bit() {
    let fixture = Fixture::new();
    let values = vec![
        Value::Bool(true),
        Value::Byte(i8::MIN),
        Value::Short(-300),
        Value::Int(i32::MIN),
        Value::Long(i64::MAX),
        Value::Float(f32::NAN),
        Value::Float(f32::NEG_INFINITY),
        Value::Double(-0.0),
        Value::Double(f64::from_bits(0x7ff8_0000_dead_beef)),
        Value::Double(f64::INFINITY),
        Value::str("tab\tand \"quotes\""),
        Value::Bytes(vec![0u8, 1, 0xfe, 0xff].into()),
        Value::Doubles(vec![f64::NAN, -0.0, 1.5].into()),
        Value::enum_constant("Kind", "INTERFACE"),
        Value::Thrown(ThrownError::new("LinkageError", Some("missing"))),
        Value::Thrown(ThrownError::new("Error", None)),
    ];
    for value in &values {
        assert_eq!(&fixture.round_trip(value), value, "round trip of {}", value);
    }

    // negative zero must not collapse into positive zero
    assert_ne!(fixture.round_trip(&Value::Double(-0.0)), Value::Double(0.0));
}

#[test]
fn test_mixed_containers_round_trip() {
    let fixture = Fixture::new();
    let value = Value::list([
        Value::Int(1),
        Value::Null,
        Value::array(ElementType::named("int"), [Value::Int(1), Value::Int(2)]),
        Value::list([Value::str("nested"), Value::Double(f64::NAN)]),
    ]);
    assert_eq!(fixture.round_trip(&value), value);
}

#[test]
fn test_records_round_trip() {
    let fixture = Fixture::new();
    let records = vec![
        Record::StackFrame(StackFrame {
            holder: "Foo".into(),
            method: "bar".into(),
            file: Some("Foo.src".into()),
            line: 42,
        }),
        Record::StackFrame(StackFrame {
            holder: "Foo".into(),
            method: "<init>".into(),
            file: None,
            line: -1,
        }),
        Record::UnresolvedType { name: "LMissing;".into() },
        Record::PrimitiveConstant {
            kind: "long".into(),
            raw: -7,
        },
        Record::BitSet(vec![0, u64::MAX, 5]),
    ];
    for record in records {
        let value = Value::record(record);
        assert_eq!(fixture.round_trip(&value), value);
    }
}

#[test]
fn test_type_profile_comes_back_delayed() {
    let fixture = Fixture::new();
    let profile = Value::record(Record::TypeProfile(TypeProfile::new(
        TriState::Unknown,
        0.125,
        vec![
            ProfiledType {
                ty: Value::str("A"),
                probability: ExactF64(0.25),
            },
            ProfiledType {
                ty: Value::str("B"),
                probability: ExactF64(0.625),
            },
        ],
    )));

    let read = fixture.round_trip(&profile);
    let Value::Delayed(delayed) = &read else {
        panic!("expected a delayed value, got {:?}", read);
    };
    assert!(!delayed.is_materialized());
    assert_eq!(read.materialize(), profile);
    assert!(delayed.is_materialized());
}

#[test]
fn test_self_referential_graph_round_trip() {
    let fixture = Fixture::new();
    let mut builder = ValueGraph::builder();
    let a = builder.node("a", Value::Int(1));
    let b = builder.node("b", Value::str("two"));
    builder.link(a, a).link(a, b).link(b, a);
    let graph = builder.build().unwrap();

    let value = Value::list([
        Value::Graph(GraphRef::new(Arc::clone(&graph), a)),
        Value::Graph(GraphRef::new(Arc::clone(&graph), b)),
    ]);
    let json = fixture.persistence.write_value(&value).unwrap();
    // nodes are written once, at the first reference
    assert!(json["elements"][0].get("nodes").is_some());
    assert!(json["elements"][1].get("nodes").is_none());

    let read = fixture.persistence.read_value(&json, &fixture.factory()).unwrap();
    let Value::List(items) = read else {
        panic!("expected a list");
    };
    let (Value::Graph(first), Value::Graph(second)) = (&items[0], &items[1]) else {
        panic!("expected graph references");
    };
    assert!(Arc::ptr_eq(first.graph(), second.graph()));
    assert_eq!(second.index(), 1);
    let nodes = first.graph().nodes();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].label(), "a");
    assert_eq!(nodes[0].links(), &[0, 1]);
    assert_eq!(nodes[1].payload(), &Value::str("two"));
    assert_eq!(first.linked()[0], *first);
}

#[test]
fn test_provider_ids_are_per_type_and_stable() {
    let fixture = Fixture::new();
    let factory = fixture.factory();
    let first = fixture.proxy(&factory, &resolver());
    let second = fixture.proxy(&factory, &resolver());
    let singleton = fixture.proxy(&factory, &runtime());

    let value = Value::list([
        Value::Provider(first.clone()),
        Value::Provider(second.clone()),
        Value::Provider(first.clone()),
        Value::Provider(singleton.clone()),
    ]);
    let json = fixture.persistence.write_value(&value).unwrap();
    assert_eq!(json["elements"][0], json!({"tag": "Resolver", "id": 0}));
    assert_eq!(json["elements"][1], json!({"tag": "Resolver", "id": 1}));
    assert_eq!(json["elements"][2], json!({"tag": "Resolver", "id": 0}));
    assert_eq!(json["elements"][3], json!({"tag": "Runtime"}));

    let read = fixture.persistence.read_value(&json, &fixture.factory()).unwrap();
    let Value::List(items) = read else {
        panic!("expected a list");
    };
    let providers: Vec<_> = items.iter().map(|v| v.as_provider().unwrap().clone()).collect();
    assert_eq!(providers[0], providers[2]);
    assert_ne!(providers[0], providers[1]);
    assert!(providers.iter().all(|p| p.is_proxy()));
    assert_eq!(providers[3].provider_type().name(), "Runtime");
}

#[test]
fn test_provider_array_keeps_registered_element_type() {
    let fixture = Fixture::new();
    let factory = fixture.factory();
    let value = Value::Array(ArrayValue::new(
        ElementType::Provider(resolver()),
        vec![Value::Provider(fixture.proxy(&factory, &resolver())), Value::Null],
    ));
    let read = fixture.round_trip(&value);
    let Value::Array(array) = read else {
        panic!("expected an array");
    };
    assert!(matches!(array.element(), ElementType::Provider(ty) if ty.name() == "Resolver"));
    assert_eq!(array.len(), 2);
    assert!(array.items()[0].as_provider().is_some());
}

#[test]
fn test_unproxied_provider_is_rejected() {
    let fixture = Fixture::new();
    let real = StubProvider::new(resolver(), "real").into_ref();
    let err = fixture.persistence.write_value(&Value::Provider(real)).unwrap_err();
    assert!(matches!(err, ReplayCompError::UnregisteredProvider { type_name } if type_name == "Resolver"));

    let unknown = StubProvider::new(TypeDescriptor::new("Unknown"), "u").into_ref();
    assert!(fixture.persistence.write_value(&Value::Provider(unknown)).is_err());
}

#[test]
fn test_markers() {
    let fixture = Fixture::new();
    let registry = fixture.persistence.registry();
    let mut ctx = SerializeContext::new(registry);

    let null = ctx.write_result(&ResultOrMarker::Marker(SpecialResult::Null)).unwrap();
    assert_eq!(null, json!({"tag": "marker", "type": "null"}));
    let thrown = ctx
        .write_result(&ResultOrMarker::from_thrown(ThrownError::new("E", Some("m"))))
        .unwrap();
    assert_eq!(thrown["type"], "exception");
    assert!(ctx.write_result(&ResultOrMarker::NO_RESULT).is_err());

    let factory = fixture.factory();
    let mut read = DeserializeContext::new(registry, &factory);
    assert_eq!(read.read_result(&null).unwrap(), ResultOrMarker::Marker(SpecialResult::Null));
    assert_eq!(
        read.read_result(&thrown).unwrap(),
        ResultOrMarker::from_thrown(ThrownError::new("E", Some("m")))
    );
    assert_eq!(
        read.read_result(&json!({"tag": "string", "content": "x"})).unwrap(),
        ResultOrMarker::Value(Value::str("x"))
    );
}

#[test]
fn test_malformed_values_name_the_serializer() {
    let fixture = Fixture::new();
    let factory = fixture.factory();

    let err = fixture
        .persistence
        .read_value(&json!({"tag": "number", "class": "Integer"}), &factory)
        .unwrap_err();
    match err {
        ReplayCompError::Deserialization {
            serializer,
            fragment,
            message,
        } => {
            assert_eq!(serializer, "number");
            assert!(fragment.contains("Integer"));
            assert!(message.contains("value"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let err = fixture
        .persistence
        .read_value(&json!({"tag": "mystery"}), &factory)
        .unwrap_err();
    assert!(matches!(err, ReplayCompError::Deserialization { serializer, .. } if serializer == "mystery"));
    assert!(fixture.persistence.read_value(&json!(12), &factory).is_err());
    assert!(
        fixture
            .persistence
            .read_value(&json!({"tag": "number", "class": "Integer", "value": "1ffffffff"}), &factory)
            .is_err()
    );
}

struct Custom {
    tag: &'static str,
    claim: Claim,
}

impl ObjectSerializer for Custom {
    fn tag(&self) -> &str {
        self.tag
    }

    fn claim(&self) -> Claim {
        self.claim.clone()
    }

    fn serialize(&self, _: &Value, _: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        Ok(())
    }

    fn deserialize(&self, _: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::Null)
    }
}

#[test]
fn test_registry_rejects_conflicting_claims() {
    let base = TypeDescriptor::new("Base");
    let derived = TypeDescriptor::with_supertypes("Derived", [base.clone()]);

    let duplicate_tag = SerializerRegistry::builder()
        .register(Custom { tag: "x", claim: Claim::Kinds(vec![ValueKind::Str]) })
        .register(Custom { tag: "x", claim: Claim::Kinds(vec![ValueKind::Bool]) })
        .build();
    assert!(matches!(duplicate_tag, Err(ReplayCompError::Configuration(_))));

    let duplicate_kind = SerializerRegistry::builder()
        .register(Custom { tag: "a", claim: Claim::Kinds(vec![ValueKind::Str]) })
        .register(Custom { tag: "b", claim: Claim::Kinds(vec![ValueKind::Str]) })
        .build();
    assert!(duplicate_kind.is_err());

    let overlapping = SerializerRegistry::builder()
        .register(Custom { tag: "a", claim: Claim::Subtypes(base.clone()) })
        .register(Custom { tag: "b", claim: Claim::Subtypes(derived.clone()) })
        .build();
    assert!(overlapping.is_err());

    let provider_kind = SerializerRegistry::builder()
        .register(Custom { tag: "a", claim: Claim::Kinds(vec![ValueKind::Provider]) })
        .build();
    assert!(provider_kind.is_err());
}

#[test]
fn test_lookup_prefers_exact_then_subtypes() {
    let base = TypeDescriptor::new("Base");
    let derived = TypeDescriptor::with_supertypes("Derived", [base.clone()]);
    let registry = SerializerRegistry::builder()
        .register(Custom { tag: "family", claim: Claim::Subtypes(base.clone()) })
        .register(Custom { tag: "exact", claim: Claim::Exact(derived.clone()) })
        .build()
        .unwrap();

    let derived_value = Value::Provider(StubProvider::new(derived, "d").into_ref());
    let base_value = Value::Provider(StubProvider::new(base, "b").into_ref());
    let other = Value::Provider(StubProvider::new(TypeDescriptor::new("Other"), "o").into_ref());
    assert_eq!(registry.lookup(&derived_value).unwrap().tag(), "exact");
    assert_eq!(registry.lookup(&base_value).unwrap().tag(), "family");
    assert!(registry.lookup(&other).is_err());
    assert!(registry.lookup(&Value::Int(1)).is_err());
}

fn sample_unit(fixture: &Fixture, factory: &ReplayProxies) -> RecordedUnit {
    let receiver = fixture.proxy(factory, &resolver());
    let other = fixture.proxy(factory, &resolver());
    let name_of = Operation::new("nameOf", &["int"]);
    let kind = Operation::new("kind", &[]);

    let mut unit = RecordedUnit::new(Value::Provider(receiver.clone()), "default", 7);
    unit.entry_point = 3;
    unit.operations = vec![
        RecordedOperation::new(
            receiver.clone(),
            name_of.clone(),
            vec![Value::Int(1)],
            ResultOrMarker::Value(Value::str("Foo")),
        ),
        RecordedOperation::new(
            receiver.clone(),
            name_of,
            vec![Value::Int(2)],
            ResultOrMarker::from_thrown(ThrownError::new("LinkageError", None)),
        ),
        RecordedOperation::new(
            other.clone(),
            kind,
            Vec::new(),
            ResultOrMarker::Marker(SpecialResult::Null),
        ),
    ];
    unit.linkages.intern(
        "memcpy(long,long,int)",
        Linkage {
            address: -16,
            temporaries: Value::list([Value::str("rax"), Value::str("rcx")]),
        },
    );
    unit.final_artifact = Some("ret".to_string());
    unit
}

#[test]
fn test_unit_document_layout() {
    let fixture = Fixture::new();
    let factory = fixture.factory();
    let unit = sample_unit(&fixture, &factory);
    let document = fixture.persistence.to_document(&unit).unwrap();

    let keys: Vec<_> = document.as_object().unwrap().keys().cloned().collect();
    assert_eq!(
        keys,
        vec![
            "tag",
            "receiver",
            "osName",
            "archName",
            "compilerConfiguration",
            "isNative",
            "entryPoint",
            "unitId",
            "operations",
            "linkages",
            "finalArtifact"
        ]
    );
    assert_eq!(document["tag"], UNIT_TAG);
    assert_eq!(document["operations"][0]["method"], json!(["nameOf", "int"]));
    assert!(document["operations"][2].get("args").is_none());
    assert_eq!(document["operations"][2]["recv"], json!({"tag": "Resolver", "id": 1}));
    assert_eq!(
        document["linkages"]["map"]["memcpy(long,long,int)"]["address"],
        "fffffffffffffff0"
    );
}

#[test]
fn test_unit_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("7.json");
    let fixture = Fixture::new();
    let unit = sample_unit(&fixture, &fixture.factory());
    fixture.persistence.save(&unit, &path).unwrap();

    // only the final file remains
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["7.json".to_string()]);

    let loaded = fixture.persistence.load(&path, &fixture.factory()).unwrap();
    assert_eq!(loaded.unit_id, 7);
    assert_eq!(loaded.entry_point, 3);
    assert_eq!(loaded.configuration, "default");
    assert_eq!(loaded.platform, Platform::host());
    assert!(!loaded.is_native);
    assert_eq!(loaded.final_artifact.as_deref(), Some("ret"));
    assert_eq!(loaded.operations.len(), 3);
    assert_eq!(loaded.operations[0].args.as_ref(), &[Value::Int(1)]);
    assert_eq!(loaded.operations[0].result, ResultOrMarker::Value(Value::str("Foo")));
    assert!(matches!(
        loaded.operations[1].result,
        ResultOrMarker::Marker(SpecialResult::Thrown(_))
    ));
    // the receiver and the first two operations share one proxy
    assert_eq!(loaded.receiver.as_provider(), Some(&loaded.operations[0].receiver));
    assert_eq!(loaded.operations[0].receiver, loaded.operations[1].receiver);
    assert_ne!(loaded.operations[0].receiver, loaded.operations[2].receiver);
    let linkage = loaded.linkages.get("memcpy(long,long,int)").unwrap();
    assert_eq!(linkage.address, -16);
    assert_eq!(linkage.temporaries, Value::list([Value::str("rax"), Value::str("rcx")]));
}

#[test]
fn test_recorded_instance_keeps_one_id_across_operations() {
    use crate::proxy::RecordingProxies;
    use crate::recorder::OperationRecorder;

    let fixture = Fixture::new();
    let lookup = Operation::new("lookup", &["int"]);
    let accepts = Operation::new("accepts", &["Resolver"]);
    let stub = StubProvider::new(resolver(), "resolver")
        .with_result(&lookup, Value::Int(4))
        .with_result(&accepts, Value::Bool(true))
        .into_ref();
    let other = StubProvider::new(resolver(), "other")
        .with_result(&accepts, Value::Bool(false))
        .into_ref();

    let proxies = RecordingProxies::new(
        Arc::clone(&fixture.declarations),
        Arc::new(OperationRecorder::new()),
    );
    let _unit = proxies.recorder().enter_unit_scope();
    let proxy = proxies.proxify(&stub).unwrap();
    let other_proxy = proxies.proxify(&other).unwrap();
    proxy.invoke(&lookup, &[Value::Int(1)]).unwrap();
    proxy.invoke(&lookup, &[Value::Int(2)]).unwrap();
    other_proxy.invoke(&accepts, &[Value::Provider(proxy.clone())]).unwrap();

    let root = proxies.proxify(&stub).unwrap();
    let mut unit = RecordedUnit::new(Value::Provider(root.clone()), "default", 1);
    unit.operations = proxies.collect_reachable_from(&[stub.clone()]).unwrap();
    let document = fixture.persistence.to_document(&unit).unwrap();

    let receiver = document["receiver"].clone();
    assert_eq!(receiver, json!({"tag": "Resolver", "id": 0}));
    let operations = document["operations"].as_array().unwrap();
    let on_receiver: Vec<_> = operations
        .iter()
        .filter(|op| op["recv"] == receiver)
        .map(|op| op["method"][0].as_str().unwrap().to_string())
        .collect();
    assert_eq!(on_receiver.iter().filter(|m| *m == "lookup").count(), 2);
    assert!(on_receiver.iter().any(|m| m == "toString"));
    let argument_of_accepts = operations
        .iter()
        .find(|op| op["method"][0] == "accepts")
        .map(|op| op["args"][0].clone());
    assert_eq!(argument_of_accepts, Some(receiver));
    let ids: std::collections::BTreeSet<_> =
        operations.iter().map(|op| op["recv"]["id"].as_u64().unwrap()).collect();
    assert_eq!(ids.len(), 2);

    // after loading, every call on the receiver answers from the trace
    let factory = fixture.factory();
    let loaded = fixture.persistence.from_document(&document, &factory).unwrap();
    factory.install(&loaded.operations).unwrap();
    let replayed = loaded.receiver.as_provider().unwrap();
    assert_eq!(replayed.invoke(&lookup, &[Value::Int(1)]), Ok(Value::Int(4)));
    assert_eq!(replayed.invoke(&lookup, &[Value::Int(2)]), Ok(Value::Int(4)));
}

#[test]
fn test_failed_save_leaves_no_temporary_file() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    let unit = sample_unit(&fixture, &fixture.factory());

    // the final name is taken by a directory, so the rename fails
    let occupied = dir.path().join("7.json");
    std::fs::create_dir(&occupied).unwrap();
    std::fs::write(occupied.join("keep"), "").unwrap();
    assert!(fixture.persistence.save(&unit, &occupied).is_err());

    // the temporary file cannot even be created
    let missing = dir.path().join("missing").join("8.json");
    assert!(matches!(
        fixture.persistence.save(&unit, &missing),
        Err(ReplayCompError::Io(_))
    ));

    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["7.json".to_string()]);
}

#[test]
fn test_parse_failures_are_classified() {
    let fixture = Fixture::new();
    let factory = fixture.factory();
    let text = fixture
        .persistence
        .dump_string(&sample_unit(&fixture, &factory))
        .unwrap();

    let truncated = &text[..text.len() / 2];
    let err = fixture.persistence.parse(truncated, &factory).unwrap_err();
    assert!(err.is_incomplete_trace(), "{:?}", err);

    let err = fixture.persistence.parse("{\"tag\": ]", &factory).unwrap_err();
    assert!(matches!(err, ReplayCompError::TraceCorrupt(_)));

    let err = fixture
        .persistence
        .parse(r#"{"tag": "somethingElse"}"#, &factory)
        .unwrap_err();
    assert!(matches!(err, ReplayCompError::Deserialization { .. }));
}

#[test]
fn test_arity_mismatch_in_document_is_rejected() {
    let fixture = Fixture::new();
    let factory = fixture.factory();
    let mut document = fixture
        .persistence
        .to_document(&sample_unit(&fixture, &factory))
        .unwrap();
    document["operations"][0]["method"] = json!(["nameOf"]);
    let err = fixture
        .persistence
        .from_document(&document, &fixture.factory())
        .unwrap_err();
    assert!(matches!(err, ReplayCompError::Deserialization { serializer, .. } if serializer == "operation"));
}
