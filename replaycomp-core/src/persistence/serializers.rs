//! Built-in serializers and the per-registration provider serializer

use serde_json::{Map, Value as Json, json};
use std::sync::Arc;

use super::{Claim, DeserializeContext, Fields, ObjectSerializer, SerializeContext};
use crate::declarations::Registration;
use crate::error::{ReplayCompError, Result};
use crate::value::{
    ArrayValue, Assumption, DelayedValue, ElementType, EnumConstant, ExceptionHandler, GraphNode,
    GraphRef, PendingRecord, Record, RecordKind, StackFrame, ThrownError, TriState,
    TypeDescriptor, Value, ValueGraph, ValueKind,
};

pub(super) fn builtin() -> Vec<Arc<dyn ObjectSerializer>> {
    let mut serializers: Vec<Arc<dyn ObjectSerializer>> = vec![
        Arc::new(NumberSerializer),
        Arc::new(StringSerializer),
        Arc::new(BooleanSerializer),
        Arc::new(ByteArraySerializer),
        Arc::new(DoubleArraySerializer),
        Arc::new(EnumSerializer),
        Arc::new(ArraySerializer),
        Arc::new(ListSerializer),
        Arc::new(ThrowableSerializer),
        Arc::new(GraphSerializer),
    ];
    serializers.extend(
        RecordKind::ALL
            .into_iter()
            .map(|kind| Arc::new(RecordSerializer(kind)) as Arc<dyn ObjectSerializer>),
    );
    serializers
}

fn unexpected(tag: &str, value: &Value) -> ReplayCompError {
    ReplayCompError::Configuration(format!("serializer {} cannot write {:?}", tag, value.kind()))
}

fn hex32(bits: u32) -> Json {
    Json::String(format!("{:x}", bits))
}

fn hex64(bits: u64) -> Json {
    Json::String(format!("{:x}", bits))
}

fn parse_hex(fields: &Fields<'_>, json: &Json) -> Result<u64> {
    json.as_str()
        .and_then(|text| u64::from_str_radix(text, 16).ok())
        .ok_or_else(|| fields.error(format!("{} is not hexadecimal", json)))
}

/// Boxed primitive numbers, stored as the hexadecimal bit pattern
struct NumberSerializer;

impl ObjectSerializer for NumberSerializer {
    fn tag(&self) -> &str {
        "number"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![
            ValueKind::Byte,
            ValueKind::Short,
            ValueKind::Int,
            ValueKind::Long,
            ValueKind::Float,
            ValueKind::Double,
        ])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        // byte and short widen to int before taking the bits
        let (class, bits) = match value {
            Value::Byte(n) => ("Byte", hex32(i32::from(*n) as u32)),
            Value::Short(n) => ("Short", hex32(i32::from(*n) as u32)),
            Value::Int(n) => ("Integer", hex32(*n as u32)),
            Value::Long(n) => ("Long", hex64(*n as u64)),
            Value::Float(n) => ("Float", hex32(n.to_bits())),
            Value::Double(n) => ("Double", hex64(n.to_bits())),
            other => return Err(unexpected(self.tag(), other)),
        };
        out.insert("class".into(), json!(class));
        out.insert("value".into(), bits);
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        let bits = fields.hex("value")?;
        let narrow = || {
            u32::try_from(bits).map_err(|_| fields.error("value does not fit in 32 bits"))
        };
        Ok(match fields.str("class")? {
            "Byte" => Value::Byte(narrow()? as i32 as i8),
            "Short" => Value::Short(narrow()? as i32 as i16),
            "Integer" => Value::Int(narrow()? as i32),
            "Long" => Value::Long(bits as i64),
            "Float" => Value::Float(f32::from_bits(narrow()?)),
            "Double" => Value::Double(f64::from_bits(bits)),
            other => return Err(fields.error(format!("unknown number class {}", other))),
        })
    }
}

struct StringSerializer;

impl ObjectSerializer for StringSerializer {
    fn tag(&self) -> &str {
        "string"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Str])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Str(s) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("content".into(), json!(s.as_ref()));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::str(fields.str("content")?))
    }
}

struct BooleanSerializer;

impl ObjectSerializer for BooleanSerializer {
    fn tag(&self) -> &str {
        "boolean"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Bool])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Bool(b) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("value".into(), json!(b));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::Bool(fields.bool("value")?))
    }
}

struct ByteArraySerializer;

impl ObjectSerializer for ByteArraySerializer {
    fn tag(&self) -> &str {
        "byteArray"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Bytes])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Bytes(bytes) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("bytes".into(), json!(hex::encode(bytes)));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        let bytes = hex::decode(fields.str("bytes")?)
            .map_err(|e| fields.error(format!("bytes are not hexadecimal: {}", e)))?;
        Ok(Value::Bytes(bytes.into()))
    }
}

struct DoubleArraySerializer;

impl ObjectSerializer for DoubleArraySerializer {
    fn tag(&self) -> &str {
        "doubleArray"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Doubles])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Doubles(values) = value else {
            return Err(unexpected(self.tag(), value));
        };
        let encoded = values.iter().map(|d| hex64(d.to_bits())).collect();
        out.insert("values".into(), Json::Array(encoded));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        let values = fields
            .array("values")?
            .iter()
            .map(|item| parse_hex(fields, item).map(f64::from_bits))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Doubles(values.into()))
    }
}

struct EnumSerializer;

impl ObjectSerializer for EnumSerializer {
    fn tag(&self) -> &str {
        "enum"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Enum])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Enum(EnumConstant { holder, constant }) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("holder".into(), json!(holder.as_ref()));
        out.insert("constant".into(), json!(constant.as_ref()));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::enum_constant(fields.str("holder")?, fields.str("constant")?))
    }
}

/// Typed arrays; provider element types are resolved against the
/// declarations on the way back
struct ArraySerializer;

impl ObjectSerializer for ArraySerializer {
    fn tag(&self) -> &str {
        "array"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Array])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, ctx: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Array(array) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("component".into(), json!(array.element().name()));
        out.insert(
            "provider".into(),
            json!(matches!(array.element(), ElementType::Provider(_))),
        );
        out.insert("elements".into(), ctx.write_values(array.items())?);
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        let component = fields.str("component")?;
        let element = if fields.bool("provider")? {
            let ty = ctx
                .factory()
                .declarations()
                .registration_by_name(component)
                .map(|r| r.provider_type().clone())
                .unwrap_or_else(|| TypeDescriptor::new(component));
            ElementType::Provider(ty)
        } else {
            ElementType::named(component)
        };
        let items = fields.values("elements", ctx)?;
        Ok(Value::Array(ArrayValue::new(element, items)))
    }
}

struct ListSerializer;

impl ObjectSerializer for ListSerializer {
    fn tag(&self) -> &str {
        "list"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::List])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, ctx: &mut SerializeContext<'_>) -> Result<()> {
        let Value::List(items) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("elements".into(), ctx.write_values(items)?);
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::list(fields.values("elements", ctx)?))
    }
}

/// Exceptions keep their class and message; stack traces are not stored
struct ThrowableSerializer;

impl ObjectSerializer for ThrowableSerializer {
    fn tag(&self) -> &str {
        "throwable"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Thrown])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, _: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Thrown(error) = value else {
            return Err(unexpected(self.tag(), value));
        };
        out.insert("class".into(), json!(error.class()));
        out.insert("message".into(), json!(error.message()));
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, _: &mut DeserializeContext<'_>) -> Result<Value> {
        Ok(Value::Thrown(ThrownError::new(
            fields.str("class")?,
            fields.opt_str("message")?,
        )))
    }
}

/// Graph nodes; a graph's nodes are written once, at its first reference
struct GraphSerializer;

impl ObjectSerializer for GraphSerializer {
    fn tag(&self) -> &str {
        "graph"
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Graph])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, ctx: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Graph(node) = value else {
            return Err(unexpected(self.tag(), value));
        };
        let (id, first) = ctx.graph_id(node.graph());
        out.insert("id".into(), json!(id));
        out.insert("node".into(), json!(node.index()));
        if first {
            let nodes = node
                .graph()
                .nodes()
                .iter()
                .map(|n| {
                    Ok(json!({
                        "label": n.label(),
                        "payload": ctx.write_value(n.payload())?,
                        "links": n.links(),
                    }))
                })
                .collect::<Result<Vec<_>>>()?;
            out.insert("nodes".into(), Json::Array(nodes));
        }
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        let id = fields.u64("id")?;
        let index = usize::try_from(fields.u64("node")?)
            .map_err(|_| fields.error("node index out of range"))?;
        if let Some(graph) = ctx.graph(id) {
            return Ok(Value::Graph(GraphRef::new(Arc::clone(graph), index)));
        }
        if !fields.has("nodes") {
            return Err(fields.error(format!("graph {} referenced before its nodes", id)));
        }
        // register before reading payloads so they can refer back to it
        let graph = ValueGraph::pending();
        ctx.insert_graph(id, Arc::clone(&graph));
        let mut nodes = Vec::new();
        for item in fields.array("nodes")? {
            let Json::Object(map) = item else {
                return Err(fields.error("graph node is not an object"));
            };
            let node = Fields::new(fields.tag(), map);
            let links = node
                .array("links")?
                .iter()
                .map(|l| {
                    l.as_u64()
                        .and_then(|l| usize::try_from(l).ok())
                        .ok_or_else(|| node.error("link is not a node index"))
                })
                .collect::<Result<Vec<_>>>()?;
            nodes.push(GraphNode::new(node.str("label")?, node.value("payload", ctx)?, links));
        }
        graph
            .complete(nodes)
            .map_err(|e| fields.error(e.to_string()))?;
        if index >= graph.len() {
            return Err(fields.error(format!("node {} is outside the graph", index)));
        }
        Ok(Value::Graph(GraphRef::new(graph, index)))
    }
}

/// One serializer per record shape
struct RecordSerializer(RecordKind);

impl RecordSerializer {
    fn write_assumption(
        assumption: &Assumption,
        out: &mut Map<String, Json>,
        ctx: &mut SerializeContext<'_>,
    ) -> Result<()> {
        match assumption {
            Assumption::NoFinalizableSubclass { receiver } => {
                out.insert("receiver".into(), ctx.write_value(receiver)?);
            }
            Assumption::ConcreteSubtype { context, subtype } => {
                out.insert("context".into(), ctx.write_value(context)?);
                out.insert("subtype".into(), ctx.write_value(subtype)?);
            }
            Assumption::LeafType { context } => {
                out.insert("context".into(), ctx.write_value(context)?);
            }
            Assumption::ConcreteMethod {
                method,
                context,
                implementation,
            } => {
                out.insert("method".into(), ctx.write_value(method)?);
                out.insert("context".into(), ctx.write_value(context)?);
                out.insert("impl".into(), ctx.write_value(implementation)?);
            }
        }
        Ok(())
    }
}

pub(crate) fn record_tag(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::StackFrame => "ste",
        RecordKind::UnresolvedType => "unresType",
        RecordKind::UnresolvedMethod => "unresMethod",
        RecordKind::UnresolvedField => "unresField",
        RecordKind::ExceptionHandler => "exceptHandler",
        RecordKind::NoFinalizableSubclass => "noFinSubclass",
        RecordKind::ConcreteSubtype => "concreteSubtype",
        RecordKind::LeafType => "leafType",
        RecordKind::ConcreteMethod => "concreteMethod",
        RecordKind::AssumptionResult => "assumpRes",
        RecordKind::PrimitiveConstant => "primConst",
        RecordKind::TypeProfile => "typeProf",
        RecordKind::BitSet => "bitset",
    }
}

impl ObjectSerializer for RecordSerializer {
    fn tag(&self) -> &str {
        record_tag(self.0)
    }

    fn claim(&self) -> Claim {
        Claim::Kinds(vec![ValueKind::Record(self.0)])
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, ctx: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Record(record) = value else {
            return Err(unexpected(self.tag(), value));
        };
        match record.as_ref() {
            Record::StackFrame(frame) => {
                out.insert("holder".into(), json!(frame.holder.as_ref()));
                out.insert("method".into(), json!(frame.method.as_ref()));
                out.insert("file".into(), json!(frame.file.as_deref()));
                out.insert("line".into(), json!(frame.line));
            }
            Record::UnresolvedType { name } => {
                out.insert("name".into(), json!(name.as_ref()));
            }
            Record::UnresolvedMethod {
                holder,
                name,
                signature,
            } => {
                out.insert("holder".into(), ctx.write_value(holder)?);
                out.insert("name".into(), json!(name.as_ref()));
                out.insert("signature".into(), json!(signature.as_ref()));
            }
            Record::UnresolvedField {
                holder,
                name,
                field_type,
            } => {
                out.insert("holder".into(), ctx.write_value(holder)?);
                out.insert("name".into(), json!(name.as_ref()));
                out.insert("type".into(), ctx.write_value(field_type)?);
            }
            Record::ExceptionHandler(handler) => {
                out.insert("startBci".into(), json!(handler.start_bci));
                out.insert("endBci".into(), json!(handler.end_bci));
                out.insert("handlerBci".into(), json!(handler.handler_bci));
                out.insert("catchTypeCpi".into(), json!(handler.catch_type_cpi));
                out.insert("catchType".into(), ctx.write_value(&handler.catch_type)?);
            }
            Record::Assumption(assumption) => Self::write_assumption(assumption, out, ctx)?,
            Record::AssumptionResult {
                result,
                assumptions,
            } => {
                out.insert("result".into(), ctx.write_value(result)?);
                let written = assumptions
                    .iter()
                    .map(|a| ctx.write_value(&Value::record(Record::Assumption(a.clone()))))
                    .collect::<Result<Vec<_>>>()?;
                out.insert("assumptions".into(), Json::Array(written));
            }
            Record::PrimitiveConstant { kind, raw } => {
                out.insert("kind".into(), json!(kind.as_ref()));
                out.insert("raw".into(), hex64(*raw as u64));
            }
            Record::TypeProfile(profile) => {
                out.insert("nullSeen".into(), json!(profile.null_seen().as_str()));
                out.insert(
                    "notRecorded".into(),
                    hex64(profile.not_recorded_probability().to_bits()),
                );
                let types = profile
                    .types()
                    .iter()
                    .map(|entry| {
                        Ok(json!({
                            "tag": "ptype",
                            "type": ctx.write_value(&entry.ty)?,
                            "probability": hex64(entry.probability.get().to_bits()),
                        }))
                    })
                    .collect::<Result<Vec<_>>>()?;
                out.insert("types".into(), Json::Array(types));
            }
            Record::BitSet(words) => {
                let words = words.iter().map(|w| hex64(*w)).collect();
                out.insert("words".into(), Json::Array(words));
            }
        }
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        let record = match self.0 {
            RecordKind::StackFrame => Record::StackFrame(StackFrame {
                holder: fields.str("holder")?.into(),
                method: fields.str("method")?.into(),
                file: fields.opt_str("file")?.map(Into::into),
                line: fields.i32("line")?,
            }),
            RecordKind::UnresolvedType => Record::UnresolvedType {
                name: fields.str("name")?.into(),
            },
            RecordKind::UnresolvedMethod => Record::UnresolvedMethod {
                holder: fields.value("holder", ctx)?,
                name: fields.str("name")?.into(),
                signature: fields.str("signature")?.into(),
            },
            RecordKind::UnresolvedField => Record::UnresolvedField {
                holder: fields.value("holder", ctx)?,
                name: fields.str("name")?.into(),
                field_type: fields.value("type", ctx)?,
            },
            RecordKind::ExceptionHandler => Record::ExceptionHandler(ExceptionHandler {
                start_bci: fields.i32("startBci")?,
                end_bci: fields.i32("endBci")?,
                handler_bci: fields.i32("handlerBci")?,
                catch_type_cpi: fields.i32("catchTypeCpi")?,
                catch_type: fields.value("catchType", ctx)?,
            }),
            RecordKind::NoFinalizableSubclass => Record::Assumption(Assumption::NoFinalizableSubclass {
                receiver: fields.value("receiver", ctx)?,
            }),
            RecordKind::ConcreteSubtype => Record::Assumption(Assumption::ConcreteSubtype {
                context: fields.value("context", ctx)?,
                subtype: fields.value("subtype", ctx)?,
            }),
            RecordKind::LeafType => Record::Assumption(Assumption::LeafType {
                context: fields.value("context", ctx)?,
            }),
            RecordKind::ConcreteMethod => Record::Assumption(Assumption::ConcreteMethod {
                method: fields.value("method", ctx)?,
                context: fields.value("context", ctx)?,
                implementation: fields.value("impl", ctx)?,
            }),
            RecordKind::AssumptionResult => {
                let result = fields.value("result", ctx)?;
                let assumptions = fields
                    .values("assumptions", ctx)?
                    .into_iter()
                    .map(|value| match value {
                        Value::Record(record) => match record.as_ref() {
                            Record::Assumption(a) => Ok(a.clone()),
                            _ => Err(fields.error("assumption list holds a non-assumption record")),
                        },
                        _ => Err(fields.error("assumption list holds a non-record value")),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Record::AssumptionResult {
                    result,
                    assumptions,
                }
            }
            RecordKind::PrimitiveConstant => Record::PrimitiveConstant {
                kind: fields.str("kind")?.into(),
                raw: fields.hex("raw")? as i64,
            },
            RecordKind::TypeProfile => return read_type_profile(fields, ctx),
            RecordKind::BitSet => Record::BitSet(
                fields
                    .array("words")?
                    .iter()
                    .map(|w| parse_hex(fields, w))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        Ok(Value::record(record))
    }
}

/// Profiles come back delayed: ordering the entries needs the profiled
/// types, which may still be pending while the document is being read
fn read_type_profile(fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
    let null_seen = TriState::parse(fields.str("nullSeen")?)
        .ok_or_else(|| fields.error("nullSeen is not a tri-state"))?;
    let not_recorded = f64::from_bits(fields.hex("notRecorded")?);
    let mut types = Vec::new();
    for item in fields.array("types")? {
        let Json::Object(map) = item else {
            return Err(fields.error("profile entry is not an object"));
        };
        let entry = Fields::new("ptype", map);
        types.push((
            entry.value("type", ctx)?,
            f64::from_bits(entry.hex("probability")?),
        ));
    }
    Ok(Value::Delayed(DelayedValue::new(PendingRecord::TypeProfile {
        null_seen,
        not_recorded,
        types,
    })))
}

/// Proxies of one registered provider type
///
/// Singletons are written without fields. Other instances carry an id that
/// is unique per type within the document.
pub struct ProviderSerializer {
    registration: Arc<Registration>,
}

impl ProviderSerializer {
    pub fn new(registration: Arc<Registration>) -> Self {
        Self { registration }
    }
}

impl ObjectSerializer for ProviderSerializer {
    fn tag(&self) -> &str {
        self.registration.provider_type().name()
    }

    fn claim(&self) -> Claim {
        Claim::Exact(self.registration.provider_type().clone())
    }

    fn serialize(&self, value: &Value, out: &mut Map<String, Json>, ctx: &mut SerializeContext<'_>) -> Result<()> {
        let Value::Provider(provider) = value else {
            return Err(unexpected(self.tag(), value));
        };
        if !provider.is_proxy() {
            return Err(ReplayCompError::UnregisteredProvider {
                type_name: provider.provider_type().name().to_string(),
            });
        }
        if !self.registration.is_singleton() {
            out.insert("id".into(), json!(ctx.instance_id(provider)));
        }
        Ok(())
    }

    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        let proxy = if self.registration.is_singleton() {
            ctx.singleton_proxy(&self.registration)?
        } else {
            ctx.instance_proxy(&self.registration, fields.u64("id")?)?
        };
        Ok(Value::Provider(proxy))
    }
}
