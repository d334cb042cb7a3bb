//! Declarative provider manifests
//!
//! A manifest describes registrations without compiled-in providers, which
//! is all the command line needs to replay traces. Methods whose results must
//! be pre-recorded call the operation on the receiver itself.
//!
//! ```toml
//! [[providers]]
//! name = "Resolver"
//! supertypes = ["Named"]
//!
//! [[providers.methods]]
//! name = "lookup"
//! params = ["int"]
//! strategy = "default_value"
//! default = -1
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::path::Path;
use tracing::debug;

use crate::declarations::{Declarations, MethodStrategy, RegistrationBuilder, dispatching_invokable};
use crate::error::{ReplayCompError, Result};
use crate::value::{Operation, TypeDescriptor, Value};

/// Provider registrations in declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclarationManifest {
    #[serde(default)]
    pub providers: Vec<ProviderManifest>,
}

/// One registered provider type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifest {
    pub name: String,

    #[serde(default)]
    pub supertypes: Vec<String>,

    #[serde(default)]
    pub singleton: bool,

    #[serde(default)]
    pub extra_interfaces: Vec<String>,

    #[serde(default)]
    pub methods: Vec<MethodManifest>,
}

/// Per-operation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodManifest {
    pub name: String,

    /// Parameter type names
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MethodStrategy>,

    /// Result when the call cannot be answered otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,

    /// Argument lists whose results are recorded for every instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ensure_recorded: Vec<Vec<Json>>,
}

impl DeclarationManifest {
    /// Load a TOML, YAML or JSON manifest, chosen by file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Json as JsonFormat, Toml, Yaml},
        };

        let path = path.as_ref();
        if !path.is_file() {
            return Err(ReplayCompError::Configuration(format!(
                "Declaration manifest {} does not exist",
                path.display()
            )));
        }
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Figment::from(Toml::file(path)),
            Some("yaml" | "yml") => Figment::from(Yaml::file(path)),
            Some("json") => Figment::from(JsonFormat::file(path)),
            _ => {
                return Err(ReplayCompError::Configuration(format!(
                    "Unsupported manifest format: {}",
                    path.display()
                )));
            }
        };
        let manifest: DeclarationManifest = figment.extract().map_err(|e| {
            ReplayCompError::Configuration(format!("Failed to load declaration manifest: {}", e))
        })?;
        debug!(path = %path.display(), providers = manifest.providers.len(), "Loaded declaration manifest");
        Ok(manifest)
    }

    /// Parse a TOML manifest
    pub fn from_toml_str(text: &str) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        Figment::from(Toml::string(text)).extract().map_err(|e| {
            ReplayCompError::Configuration(format!("Failed to parse declaration manifest: {}", e))
        })
    }

    /// Build the registry this manifest describes
    pub fn to_declarations(&self) -> Result<Declarations> {
        let mut builder = Declarations::builder();
        for provider in &self.providers {
            builder = builder.register(provider.to_registration()?)?;
        }
        Ok(builder.build())
    }
}

impl ProviderManifest {
    fn to_registration(&self) -> Result<RegistrationBuilder> {
        let ty = TypeDescriptor::with_supertypes(
            self.name.as_str(),
            self.supertypes.iter().map(|s| TypeDescriptor::new(s.as_str())),
        );
        let mut registration = RegistrationBuilder::new(ty).singleton(self.singleton);
        for interface in &self.extra_interfaces {
            registration = registration.extra_interface(TypeDescriptor::new(interface.as_str()));
        }
        for method in &self.methods {
            let params: Vec<&str> = method.params.iter().map(String::as_str).collect();
            let operation = Operation::new(&method.name, &params);
            if let Some(strategy) = method.strategy {
                registration = registration.strategy(&operation, strategy);
            }
            if let Some(default) = &method.default {
                registration = registration.default_value(&operation, json_to_value(default)?);
            }
            if !method.ensure_recorded.is_empty() {
                registration = registration
                    .invokable(&operation, dispatching_invokable(operation.clone()));
                for args in &method.ensure_recorded {
                    let args = args.iter().map(json_to_value).collect::<Result<Vec<_>>>()?;
                    registration = registration.ensure_recorded_args(&operation, args);
                }
            }
        }
        Ok(registration)
    }
}

/// Scalars and lists of scalars; integers become `Int` when they fit
pub fn json_to_value(json: &Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => i32::try_from(i).map(Value::Int).unwrap_or(Value::Long(i)),
            None => Value::Double(n.as_f64().ok_or_else(|| {
                ReplayCompError::Configuration(format!("number {} is out of range", n))
            })?),
        },
        Json::String(s) => Value::str(s),
        Json::Array(items) => Value::list(items.iter().map(json_to_value).collect::<Result<Vec<_>>>()?),
        Json::Object(_) => {
            return Err(ReplayCompError::Configuration(format!(
                "manifest values must be scalars or lists, got {}",
                json
            )));
        }
    })
}
