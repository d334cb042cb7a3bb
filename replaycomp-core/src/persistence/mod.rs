//! Trace persistence
//!
//! A trace is one JSON document per unit of work. Every non-null value is an
//! object whose `tag` names the serializer that wrote it; the registry maps
//! value variants and provider types to serializers and tags back to them.
//!
//! Floating point values are written as the hexadecimal form of their bit
//! pattern so they round-trip exactly. Provider instances are written as an
//! empty marker for singletons and as a small per-type id otherwise; reading
//! the same marker or id twice yields the same proxy.

mod serializers;
mod unit;

pub use serializers::ProviderSerializer;
pub use unit::{Linkage, LinkageTable, Platform, RecordedUnit, UNIT_TAG};

use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::declarations::Declarations;
use crate::error::{ReplayCompError, Result};
use crate::provider::ProviderRef;
use crate::proxy::ProxyFactory;
use crate::special::{ResultOrMarker, SpecialResult};
use crate::value::{TypeDescriptor, Value, ValueGraph, ValueKind};

/// Key of the serializer tag in every tagged object
pub const TAG_KEY: &str = "tag";

/// What a serializer is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Values of the listed variants
    Kinds(Vec<ValueKind>),
    /// Providers whose type is exactly this one
    Exact(TypeDescriptor),
    /// Providers of this type and all its subtypes
    Subtypes(TypeDescriptor),
}

/// Converts one family of values to and from tagged objects
pub trait ObjectSerializer: Send + Sync {
    /// Tag written into every object this serializer produces
    fn tag(&self) -> &str;

    fn claim(&self) -> Claim;

    /// Write the fields of `value`; the tag is written by the caller
    fn serialize(
        &self,
        value: &Value,
        out: &mut Map<String, Json>,
        ctx: &mut SerializeContext<'_>,
    ) -> Result<()>;

    /// Rebuild a value from the fields of a tagged object
    fn deserialize(&self, fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<Value>;
}

/// Lookup table from value variants, provider types and tags to serializers
pub struct SerializerRegistry {
    by_tag: HashMap<String, Arc<dyn ObjectSerializer>>,
    by_kind: HashMap<ValueKind, Arc<dyn ObjectSerializer>>,
    by_exact: HashMap<Arc<str>, Arc<dyn ObjectSerializer>>,
    by_subtype: Vec<(TypeDescriptor, Arc<dyn ObjectSerializer>)>,
}

impl SerializerRegistry {
    pub fn builder() -> SerializerRegistryBuilder {
        SerializerRegistryBuilder::default()
    }

    /// Built-in serializers plus one provider serializer per registration
    pub fn standard(declarations: &Declarations) -> Result<Self> {
        let mut builder = serializers::builtin()
            .into_iter()
            .fold(Self::builder(), |builder, serializer| builder.register_arc(serializer));
        for registration in declarations.registrations() {
            builder = builder.register(ProviderSerializer::new(Arc::clone(registration)));
        }
        builder.build()
    }

    pub fn by_tag(&self, tag: &str) -> Option<&Arc<dyn ObjectSerializer>> {
        self.by_tag.get(tag)
    }

    /// Serializer responsible for `value`
    pub fn lookup(&self, value: &Value) -> Result<&Arc<dyn ObjectSerializer>> {
        if let Value::Provider(provider) = value {
            return self.lookup_provider(provider);
        }
        self.by_kind.get(&value.kind()).ok_or_else(|| {
            ReplayCompError::Configuration(format!("no serializer for {:?} values", value.kind()))
        })
    }

    fn lookup_provider(&self, provider: &ProviderRef) -> Result<&Arc<dyn ObjectSerializer>> {
        let provider_type = provider.provider_type();
        if let Some(serializer) = self.by_exact.get(provider_type.name()) {
            return Ok(serializer);
        }
        self.by_subtype
            .iter()
            .find(|(claimed, _)| provider_type.is_subtype_of(claimed))
            .map(|(_, serializer)| serializer)
            .ok_or_else(|| ReplayCompError::UnregisteredProvider {
                type_name: provider_type.name().to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.by_tag.keys().collect();
        tags.sort();
        f.debug_struct("SerializerRegistry").field("tags", &tags).finish()
    }
}

/// Collects serializers and checks that their claims do not overlap
#[derive(Default)]
pub struct SerializerRegistryBuilder {
    serializers: Vec<Arc<dyn ObjectSerializer>>,
}

impl SerializerRegistryBuilder {
    pub fn register(self, serializer: impl ObjectSerializer + 'static) -> Self {
        self.register_arc(Arc::new(serializer))
    }

    pub fn register_arc(mut self, serializer: Arc<dyn ObjectSerializer>) -> Self {
        self.serializers.push(serializer);
        self
    }

    /// Fails on duplicate tags, on two serializers claiming the same variant
    /// or exact type, and on subtype claims that overlap
    pub fn build(self) -> Result<SerializerRegistry> {
        let mut registry = SerializerRegistry {
            by_tag: HashMap::new(),
            by_kind: HashMap::new(),
            by_exact: HashMap::new(),
            by_subtype: Vec::new(),
        };
        for serializer in self.serializers {
            let tag = serializer.tag().to_string();
            if registry.by_tag.contains_key(&tag) {
                return Err(ReplayCompError::Configuration(format!(
                    "serializer tag {} registered twice",
                    tag
                )));
            }
            match serializer.claim() {
                Claim::Kinds(kinds) => {
                    for kind in kinds {
                        if kind == ValueKind::Provider || kind == ValueKind::Null {
                            return Err(ReplayCompError::Configuration(format!(
                                "serializer {} cannot claim {:?} values",
                                tag, kind
                            )));
                        }
                        if let Some(existing) = registry.by_kind.insert(kind, Arc::clone(&serializer)) {
                            return Err(ReplayCompError::Configuration(format!(
                                "{:?} values claimed by both {} and {}",
                                kind,
                                existing.tag(),
                                tag
                            )));
                        }
                    }
                }
                Claim::Exact(ty) => {
                    if let Some(existing) = registry
                        .by_exact
                        .insert(ty.name_arc(), Arc::clone(&serializer))
                    {
                        return Err(ReplayCompError::Configuration(format!(
                            "provider type {} claimed by both {} and {}",
                            ty,
                            existing.tag(),
                            tag
                        )));
                    }
                }
                Claim::Subtypes(ty) => {
                    if let Some((claimed, existing)) = registry
                        .by_subtype
                        .iter()
                        .find(|(claimed, _)| claimed.is_subtype_of(&ty) || ty.is_subtype_of(claimed))
                    {
                        return Err(ReplayCompError::Configuration(format!(
                            "subtypes of {} and {} overlap; claimed by {} and {}",
                            claimed,
                            ty,
                            existing.tag(),
                            tag
                        )));
                    }
                    registry.by_subtype.push((ty, Arc::clone(&serializer)));
                }
            }
            registry.by_tag.insert(tag, serializer);
        }
        debug!(serializers = registry.by_tag.len(), "Built serializer registry");
        Ok(registry)
    }
}

/// Field accessors of a tagged object, reporting failures against its serializer
pub struct Fields<'a> {
    tag: &'a str,
    map: &'a Map<String, Json>,
}

impl<'a> Fields<'a> {
    pub fn new(tag: &'a str, map: &'a Map<String, Json>) -> Self {
        Self { tag, map }
    }

    pub fn tag(&self) -> &str {
        self.tag
    }

    /// A deserialization failure naming this object
    pub fn error(&self, message: impl Into<String>) -> ReplayCompError {
        ReplayCompError::deserialization(self.tag, &Json::Object(self.map.clone()), message)
    }

    pub fn get(&self, key: &str) -> Result<&'a Json> {
        self.map
            .get(key)
            .ok_or_else(|| self.error(format!("missing field {}", key)))
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn str(&self, key: &str) -> Result<&'a str> {
        self.get(key)?
            .as_str()
            .ok_or_else(|| self.error(format!("field {} is not a string", key)))
    }

    pub fn opt_str(&self, key: &str) -> Result<Option<&'a str>> {
        match self.map.get(key) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.error(format!("field {} is not a string", key))),
        }
    }

    pub fn bool(&self, key: &str) -> Result<bool> {
        self.get(key)?
            .as_bool()
            .ok_or_else(|| self.error(format!("field {} is not a boolean", key)))
    }

    pub fn i32(&self, key: &str) -> Result<i32> {
        self.get(key)?
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| self.error(format!("field {} is not a 32-bit integer", key)))
    }

    pub fn u64(&self, key: &str) -> Result<u64> {
        self.get(key)?
            .as_u64()
            .ok_or_else(|| self.error(format!("field {} is not an unsigned integer", key)))
    }

    pub fn array(&self, key: &str) -> Result<&'a Vec<Json>> {
        self.get(key)?
            .as_array()
            .ok_or_else(|| self.error(format!("field {} is not an array", key)))
    }

    /// Hexadecimal field holding up to 64 bits
    pub fn hex(&self, key: &str) -> Result<u64> {
        let text = self.str(key)?;
        u64::from_str_radix(text, 16)
            .map_err(|e| self.error(format!("field {} is not hexadecimal: {}", key, e)))
    }

    pub fn value(&self, key: &str, ctx: &mut DeserializeContext<'_>) -> Result<Value> {
        ctx.read_value(self.get(key)?)
    }

    pub fn values(&self, key: &str, ctx: &mut DeserializeContext<'_>) -> Result<Vec<Value>> {
        self.array(key)?
            .iter()
            .map(|item| ctx.read_value(item))
            .collect()
    }
}

/// Per-document state while writing a trace
pub struct SerializeContext<'a> {
    registry: &'a SerializerRegistry,
    instance_ids: HashMap<ProviderRef, u64>,
    next_instance_id: HashMap<Arc<str>, u64>,
    graph_ids: HashMap<usize, u64>,
}

impl<'a> SerializeContext<'a> {
    pub fn new(registry: &'a SerializerRegistry) -> Self {
        Self {
            registry,
            instance_ids: HashMap::new(),
            next_instance_id: HashMap::new(),
            graph_ids: HashMap::new(),
        }
    }

    /// Id of a non-singleton provider; ids count up per type in order of
    /// first sight
    pub fn instance_id(&mut self, provider: &ProviderRef) -> u64 {
        if let Some(id) = self.instance_ids.get(provider) {
            return *id;
        }
        let counter = self
            .next_instance_id
            .entry(provider.provider_type().name_arc())
            .or_insert(0);
        let id = *counter;
        *counter += 1;
        self.instance_ids.insert(provider.clone(), id);
        id
    }

    /// Id of a graph and whether this is the first time it is written
    pub fn graph_id(&mut self, graph: &Arc<ValueGraph>) -> (u64, bool) {
        let next = self.graph_ids.len() as u64;
        match self.graph_ids.get(&graph.addr()) {
            Some(id) => (*id, false),
            None => {
                self.graph_ids.insert(graph.addr(), next);
                (next, true)
            }
        }
    }

    pub fn write_value(&mut self, value: &Value) -> Result<Json> {
        match value {
            Value::Null => Ok(Json::Null),
            Value::Delayed(delayed) => self.write_value(&delayed.materialize()),
            _ => {
                let serializer = Arc::clone(self.registry.lookup(value)?);
                let mut out = Map::new();
                out.insert(TAG_KEY.to_string(), Json::String(serializer.tag().to_string()));
                serializer.serialize(value, &mut out, self)?;
                Ok(Json::Object(out))
            }
        }
    }

    pub fn write_values(&mut self, values: &[Value]) -> Result<Json> {
        Ok(Json::Array(
            values
                .iter()
                .map(|value| self.write_value(value))
                .collect::<Result<_>>()?,
        ))
    }

    /// Write a recorded outcome; `NoResult` is never persisted
    pub fn write_result(&mut self, result: &ResultOrMarker) -> Result<Json> {
        match result {
            ResultOrMarker::Value(value) => self.write_value(value),
            ResultOrMarker::Marker(SpecialResult::Null) => Ok(marker("null", None)),
            ResultOrMarker::Marker(SpecialResult::Thrown(error)) => {
                let throwable = self.write_value(&Value::Thrown(error.clone()))?;
                Ok(marker("exception", Some(throwable)))
            }
            ResultOrMarker::Marker(SpecialResult::NoResult) => Err(ReplayCompError::Configuration(
                "a missing result cannot be written to a trace".into(),
            )),
        }
    }
}

fn marker(kind: &str, throwable: Option<Json>) -> Json {
    let mut out = Map::new();
    out.insert(TAG_KEY.to_string(), Json::String(MARKER_TAG.to_string()));
    out.insert("type".to_string(), Json::String(kind.to_string()));
    if let Some(throwable) = throwable {
        out.insert("throwable".to_string(), throwable);
    }
    Json::Object(out)
}

const MARKER_TAG: &str = "marker";

/// Per-document state while reading a trace
pub struct DeserializeContext<'a> {
    registry: &'a SerializerRegistry,
    factory: &'a dyn ProxyFactory,
    singletons: HashMap<Arc<str>, ProviderRef>,
    instances: HashMap<(Arc<str>, u64), ProviderRef>,
    graphs: HashMap<u64, Arc<ValueGraph>>,
}

impl<'a> DeserializeContext<'a> {
    pub fn new(registry: &'a SerializerRegistry, factory: &'a dyn ProxyFactory) -> Self {
        Self {
            registry,
            factory,
            singletons: HashMap::new(),
            instances: HashMap::new(),
            graphs: HashMap::new(),
        }
    }

    pub fn factory(&self) -> &'a dyn ProxyFactory {
        self.factory
    }

    /// The proxy for a singleton type, created on first use
    pub fn singleton_proxy(
        &mut self,
        registration: &Arc<crate::declarations::Registration>,
    ) -> Result<ProviderRef> {
        let name = registration.provider_type().name_arc();
        if let Some(proxy) = self.singletons.get(&name) {
            return Ok(proxy.clone());
        }
        let proxy = self.factory.create_proxy(registration)?;
        self.singletons.insert(name, proxy.clone());
        Ok(proxy)
    }

    /// The proxy for instance `id` of a type, created on first use
    pub fn instance_proxy(
        &mut self,
        registration: &Arc<crate::declarations::Registration>,
        id: u64,
    ) -> Result<ProviderRef> {
        let key = (registration.provider_type().name_arc(), id);
        if let Some(proxy) = self.instances.get(&key) {
            return Ok(proxy.clone());
        }
        let proxy = self.factory.create_proxy(registration)?;
        self.instances.insert(key, proxy.clone());
        Ok(proxy)
    }

    pub fn graph(&self, id: u64) -> Option<&Arc<ValueGraph>> {
        self.graphs.get(&id)
    }

    pub fn insert_graph(&mut self, id: u64, graph: Arc<ValueGraph>) {
        self.graphs.insert(id, graph);
    }

    pub fn read_value(&mut self, json: &Json) -> Result<Value> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Object(map) => {
                let tag = map.get(TAG_KEY).and_then(Json::as_str).ok_or_else(|| {
                    ReplayCompError::deserialization("value", json, "object without a tag")
                })?;
                let serializer = Arc::clone(self.registry.by_tag(tag).ok_or_else(|| {
                    ReplayCompError::deserialization(tag, json, "unknown serializer tag")
                })?);
                serializer.deserialize(&Fields::new(tag, map), self)
            }
            other => Err(ReplayCompError::deserialization(
                "value",
                other,
                "expected null or a tagged object",
            )),
        }
    }

    /// Read a recorded outcome written by [`SerializeContext::write_result`]
    pub fn read_result(&mut self, json: &Json) -> Result<ResultOrMarker> {
        let Json::Object(map) = json else {
            return Ok(ResultOrMarker::from_return(self.read_value(json)?));
        };
        if map.get(TAG_KEY).and_then(Json::as_str) != Some(MARKER_TAG) {
            return Ok(ResultOrMarker::from_return(self.read_value(json)?));
        }
        let fields = Fields::new(MARKER_TAG, map);
        match fields.str("type")? {
            "null" => Ok(ResultOrMarker::Marker(SpecialResult::Null)),
            "exception" => match fields.value("throwable", self)? {
                Value::Thrown(error) => Ok(ResultOrMarker::from_thrown(error)),
                _ => Err(fields.error("throwable is not an exception")),
            },
            other => Err(fields.error(format!("unexpected marker type {}", other))),
        }
    }
}

/// Classify a JSON parse failure: truncated input is an incomplete trace
fn classify_parse_error(error: serde_json::Error) -> ReplayCompError {
    use serde_json::error::Category;
    match error.classify() {
        Category::Eof => ReplayCompError::TraceIncomplete(error.to_string()),
        Category::Io => ReplayCompError::Io(error.into()),
        Category::Syntax | Category::Data => ReplayCompError::TraceCorrupt(error.to_string()),
    }
}

/// Reads and writes trace documents
#[derive(Debug)]
pub struct TracePersistence {
    registry: SerializerRegistry,
}

impl TracePersistence {
    /// Persistence with the standard serializers for `declarations`
    pub fn new(declarations: &Declarations) -> Result<Self> {
        Ok(Self {
            registry: SerializerRegistry::standard(declarations)?,
        })
    }

    pub fn with_registry(registry: SerializerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    /// Encode a unit as a JSON document
    pub fn to_document(&self, unit: &RecordedUnit) -> Result<Json> {
        let mut ctx = SerializeContext::new(&self.registry);
        unit.write(&mut ctx)
    }

    pub fn dump_string(&self, unit: &RecordedUnit) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_document(unit)?)?)
    }

    /// Write a unit to `path`
    ///
    /// The document is written to a temporary sibling first and renamed into
    /// place, so `path` never holds a partial document.
    pub fn save(&self, unit: &RecordedUnit, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let document = self.to_document(unit)?;
        let temporary = temporary_sibling(path);
        let written = write_document(&temporary, &document)
            .and_then(|()| fs::rename(&temporary, path).map_err(ReplayCompError::from));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temporary)
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %temporary.display(), error = %cleanup, "Could not remove temporary trace");
            }
            return Err(e);
        }
        info!(path = %path.display(), operations = unit.operations.len(), "Saved trace");
        Ok(())
    }

    /// Read a unit from `path`, creating proxies through `factory`
    pub fn load(&self, path: impl AsRef<Path>, factory: &dyn ProxyFactory) -> Result<RecordedUnit> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let unit = self.parse(&text, factory)?;
        debug!(path = %path.display(), operations = unit.operations.len(), "Loaded trace");
        Ok(unit)
    }

    pub fn parse(&self, text: &str, factory: &dyn ProxyFactory) -> Result<RecordedUnit> {
        let document: Json = serde_json::from_str(text).map_err(classify_parse_error)?;
        self.from_document(&document, factory)
    }

    pub fn from_document(&self, document: &Json, factory: &dyn ProxyFactory) -> Result<RecordedUnit> {
        let mut ctx = DeserializeContext::new(&self.registry, factory);
        RecordedUnit::read(document, &mut ctx)
    }

    /// Encode a single value in its own document scope
    pub fn write_value(&self, value: &Value) -> Result<Json> {
        SerializeContext::new(&self.registry).write_value(value)
    }

    /// Decode a single value in its own document scope
    pub fn read_value(&self, json: &Json, factory: &dyn ProxyFactory) -> Result<Value> {
        DeserializeContext::new(&self.registry, factory).read_value(json)
    }
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "trace".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}

fn write_document(path: &Path, document: &Json) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, document)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests;
