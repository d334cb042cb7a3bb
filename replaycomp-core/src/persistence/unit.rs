//! The recorded unit document

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json, json};
use std::collections::BTreeMap;

use super::{DeserializeContext, Fields, SerializeContext, TAG_KEY};
use crate::error::{ReplayCompError, Result};
use crate::recorder::RecordedOperation;
use crate::value::{Operation, Value};

/// Tag of the top-level trace object
pub const UNIT_TAG: &str = "recordedCompilationUnit";

const OPERATION_TAG: &str = "operation";
const LINKAGES_TAG: &str = "linkages";
const LINKAGE_TAG: &str = "linkage";

/// Operating system and architecture a trace was recorded on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os_name: String,
    pub arch_name: String,
}

impl Platform {
    pub fn new(os_name: impl Into<String>, arch_name: impl Into<String>) -> Self {
        Self {
            os_name: os_name.into(),
            arch_name: arch_name.into(),
        }
    }

    /// The platform this process runs on
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.os_name, self.arch_name)
    }
}

/// Pre-resolved external linkage data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linkage {
    pub address: i64,
    /// Registers or slots the linkage clobbers
    pub temporaries: Value,
}

/// Linkages keyed by their descriptor string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkageTable {
    entries: BTreeMap<String, Linkage>,
}

impl LinkageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a linkage unless one is already known for `descriptor`; returns
    /// the entry stored under the descriptor
    pub fn intern(&mut self, descriptor: impl Into<String>, linkage: Linkage) -> &Linkage {
        self.entries.entry(descriptor.into()).or_insert(linkage)
    }

    pub fn get(&self, descriptor: &str) -> Option<&Linkage> {
        self.entries.get(descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Linkage)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything needed to replay one unit of work
#[derive(Debug, Clone)]
pub struct RecordedUnit {
    /// Root provider of the unit
    pub receiver: Value,
    pub platform: Platform,
    /// Name of the configuration the unit ran under
    pub configuration: String,
    /// Whether the unit's source is native code
    pub is_native: bool,
    pub entry_point: i32,
    pub unit_id: i32,
    pub operations: Vec<RecordedOperation>,
    pub linkages: LinkageTable,
    /// Text of the artifact the unit produced, when captured
    pub final_artifact: Option<String>,
}

impl RecordedUnit {
    /// A unit recorded on the host platform with no operations yet
    pub fn new(receiver: Value, configuration: impl Into<String>, unit_id: i32) -> Self {
        Self {
            receiver,
            platform: Platform::host(),
            configuration: configuration.into(),
            is_native: false,
            entry_point: -1,
            unit_id,
            operations: Vec::new(),
            linkages: LinkageTable::new(),
            final_artifact: None,
        }
    }

    pub(super) fn write(&self, ctx: &mut SerializeContext<'_>) -> Result<Json> {
        let mut out = Map::new();
        out.insert(TAG_KEY.into(), json!(UNIT_TAG));
        out.insert("receiver".into(), ctx.write_value(&self.receiver)?);
        out.insert("osName".into(), json!(self.platform.os_name));
        out.insert("archName".into(), json!(self.platform.arch_name));
        out.insert("compilerConfiguration".into(), json!(self.configuration));
        out.insert("isNative".into(), json!(self.is_native));
        out.insert("entryPoint".into(), json!(self.entry_point));
        out.insert("unitId".into(), json!(self.unit_id));

        let mut operations = Vec::with_capacity(self.operations.len());
        for operation in &self.operations {
            let mut entry = Map::new();
            entry.insert(TAG_KEY.into(), json!(OPERATION_TAG));
            entry.insert(
                "recv".into(),
                ctx.write_value(&Value::Provider(operation.receiver.clone()))?,
            );
            entry.insert("method".into(), json!(operation.operation.parts()));
            if !operation.args.is_empty() {
                entry.insert("args".into(), ctx.write_values(&operation.args)?);
            }
            entry.insert("res".into(), ctx.write_result(&operation.result)?);
            operations.push(Json::Object(entry));
        }
        out.insert("operations".into(), Json::Array(operations));

        let mut map = Map::new();
        for (descriptor, linkage) in self.linkages.iter() {
            map.insert(
                descriptor.to_string(),
                json!({
                    TAG_KEY: LINKAGE_TAG,
                    "address": format!("{:x}", linkage.address as u64),
                    "temporaries": ctx.write_value(&linkage.temporaries)?,
                }),
            );
        }
        out.insert(
            "linkages".into(),
            json!({ TAG_KEY: LINKAGES_TAG, "map": Json::Object(map) }),
        );
        out.insert("finalArtifact".into(), json!(self.final_artifact));
        Ok(Json::Object(out))
    }

    pub(super) fn read(document: &Json, ctx: &mut DeserializeContext<'_>) -> Result<Self> {
        let Json::Object(map) = document else {
            return Err(ReplayCompError::deserialization(
                UNIT_TAG,
                document,
                "trace document is not an object",
            ));
        };
        let fields = Fields::new(UNIT_TAG, map);
        match fields.str(TAG_KEY)? {
            UNIT_TAG => {}
            other => return Err(fields.error(format!("unexpected document tag {}", other))),
        }

        let receiver = fields.value("receiver", ctx)?;
        let platform = Platform::new(fields.str("osName")?, fields.str("archName")?);
        let configuration = fields.str("compilerConfiguration")?.to_string();
        let is_native = fields.bool("isNative")?;
        let entry_point = fields.i32("entryPoint")?;
        let unit_id = fields.i32("unitId")?;

        let mut operations = Vec::new();
        for item in fields.array("operations")? {
            let Json::Object(entry) = item else {
                return Err(fields.error("operation entry is not an object"));
            };
            operations.push(read_operation(&Fields::new(OPERATION_TAG, entry), ctx)?);
        }

        let mut linkages = LinkageTable::new();
        if let Json::Object(table) = fields.get("linkages")? {
            let table = Fields::new(LINKAGES_TAG, table);
            let Json::Object(entries) = table.get("map")? else {
                return Err(table.error("linkage map is not an object"));
            };
            for (descriptor, entry) in entries {
                let Json::Object(entry) = entry else {
                    return Err(table.error(format!("linkage {} is not an object", descriptor)));
                };
                let entry = Fields::new(LINKAGE_TAG, entry);
                linkages.intern(
                    descriptor.clone(),
                    Linkage {
                        address: entry.hex("address")? as i64,
                        temporaries: entry.value("temporaries", ctx)?,
                    },
                );
            }
        }

        Ok(Self {
            receiver,
            platform,
            configuration,
            is_native,
            entry_point,
            unit_id,
            operations,
            linkages,
            final_artifact: fields.opt_str("finalArtifact")?.map(str::to_string),
        })
    }
}

fn read_operation(fields: &Fields<'_>, ctx: &mut DeserializeContext<'_>) -> Result<RecordedOperation> {
    let receiver = match fields.value("recv", ctx)? {
        Value::Provider(provider) => provider,
        other => {
            return Err(fields.error(format!("receiver {} is not a provider", other)));
        }
    };
    let parts = fields
        .array("method")?
        .iter()
        .map(|part| {
            part.as_str()
                .ok_or_else(|| fields.error("method part is not a string"))
        })
        .collect::<Result<Vec<_>>>()?;
    let operation =
        Operation::from_parts(parts).ok_or_else(|| fields.error("method has no name"))?;
    let args = if fields.has("args") {
        fields.values("args", ctx)?
    } else {
        Vec::new()
    };
    if args.len() != operation.param_count() {
        return Err(fields.error(format!(
            "{} takes {} arguments but {} were recorded",
            operation,
            operation.param_count(),
            args.len()
        )));
    }
    let result = ctx.read_result(fields.get("res")?)?;
    Ok(RecordedOperation::new(receiver, operation, args, result))
}
