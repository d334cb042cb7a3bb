//! Declaration registry
//!
//! Declares which provider types are intercepted and how each of their
//! operations is recorded and replayed. The registry is built once with
//! [`DeclarationsBuilder`] and is immutable afterwards; lookups are safe from
//! any number of threads.
//!
//! # Example
//!
//! ```rust
//! use replaycomp_core::declarations::{Declarations, MethodStrategy, RegistrationBuilder};
//! use replaycomp_core::value::{Operation, TypeDescriptor, Value};
//!
//! let meta_access = TypeDescriptor::new("MetaAccessProvider");
//! let decode = Operation::new("decodeDebugId", &["int"]);
//!
//! let declarations = Declarations::builder()
//!     .register(
//!         RegistrationBuilder::new(meta_access.clone())
//!             .singleton(true)
//!             .strategy(&decode, MethodStrategy::Passthrough),
//!     )?
//!     .build();
//!
//! let registration = declarations.registration(&meta_access).unwrap();
//! assert_eq!(registration.find_strategy(&decode), MethodStrategy::Passthrough);
//! # Ok::<(), replaycomp_core::error::ReplayCompError>(())
//! ```

mod builder;

pub use builder::{DeclarationsBuilder, RegistrationBuilder};

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{ReplayCompError, Result};
use crate::provider::{LocalEnvironment, ProviderRef};
use crate::value::{HASH_CODE, EQUALS, Operation, TO_STRING, ThrownError, TypeDescriptor, Value};

/// How an operation is recorded and replayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodStrategy {
    /// Record the first result per argument vector and replay it
    RecordReplay,
    /// Never recorded; replay invokes the local mirror or the fallback
    Passthrough,
    /// Never recorded; replay returns the declared default
    DefaultValue,
    /// Identity operations handled by the proxies themselves
    Special,
}

impl MethodStrategy {
    /// Strategy of an operation without an explicit declaration
    pub fn default_for(operation: &Operation) -> Self {
        if operation.is_identity_operation() {
            MethodStrategy::Special
        } else {
            MethodStrategy::RecordReplay
        }
    }

    /// Whether recording memoizes results of this strategy
    pub fn is_recorded(self) -> bool {
        matches!(self, MethodStrategy::RecordReplay)
    }
}

/// Performs an operation on a real receiver
pub type Invokable =
    Arc<dyn Fn(&ProviderRef, &[Value]) -> std::result::Result<Value, ThrownError> + Send + Sync>;

/// Computes a replay result from the proxy receiver, the operation and its arguments
pub type OperationResultSupplier = Arc<
    dyn Fn(&ProviderRef, &Operation, &[Value]) -> std::result::Result<Value, ThrownError>
        + Send
        + Sync,
>;

/// Finds the live equivalent of a replay proxy
pub type LocalMirrorLocator =
    Arc<dyn Fn(&ProviderRef, &dyn LocalEnvironment) -> Option<ProviderRef> + Send + Sync>;

/// Computes receiver-dependent calls that must be recorded
pub type MethodCallsToRecordProvider =
    Arc<dyn Fn(&ProviderRef) -> Result<Vec<MethodCallToRecord>> + Send + Sync>;

/// An invokable that dispatches `operation` through [`crate::provider::Provider::invoke`]
pub fn dispatching_invokable(operation: Operation) -> Invokable {
    Arc::new(move |receiver: &ProviderRef, args: &[Value]| {
        receiver.invoke(&operation, args)
    })
}

/// Recording and replay behavior of one operation
#[derive(Clone)]
pub struct MethodRegistration {
    strategy: MethodStrategy,
    default_value_supplier: Option<OperationResultSupplier>,
    default_value: Value,
    calls_to_record_arguments: Vec<Vec<Value>>,
    fallback: Option<OperationResultSupplier>,
    invokable: Option<Invokable>,
}

impl MethodRegistration {
    /// Create a method registration
    ///
    /// Fails if arguments must be pre-recorded but no invokable is given.
    pub fn new(
        strategy: MethodStrategy,
        default_value_supplier: Option<OperationResultSupplier>,
        default_value: Value,
        calls_to_record_arguments: Vec<Vec<Value>>,
        fallback: Option<OperationResultSupplier>,
        invokable: Option<Invokable>,
    ) -> Result<Self> {
        if !calls_to_record_arguments.is_empty() && invokable.is_none() {
            return Err(ReplayCompError::Configuration(
                "invokable method needed because there are calls that must be recorded".into(),
            ));
        }
        Ok(Self {
            strategy,
            default_value_supplier,
            default_value,
            calls_to_record_arguments,
            fallback,
            invokable,
        })
    }

    pub fn strategy(&self) -> MethodStrategy {
        self.strategy
    }

    /// Argument vectors whose results are always recorded
    pub fn calls_to_record_arguments(&self) -> &[Vec<Value>] {
        &self.calls_to_record_arguments
    }
}

impl fmt::Debug for MethodRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistration")
            .field("strategy", &self.strategy)
            .field("default_value", &self.default_value)
            .field("has_default_value_supplier", &self.default_value_supplier.is_some())
            .field("calls_to_record", &self.calls_to_record_arguments.len())
            .field("has_fallback", &self.fallback.is_some())
            .field("has_invokable", &self.invokable.is_some())
            .finish()
    }
}

/// A call whose result must end up in the trace
#[derive(Clone)]
pub struct MethodCallToRecord {
    pub receiver: ProviderRef,
    pub operation: Operation,
    pub invokable: Invokable,
    pub args: Vec<Value>,
}

impl MethodCallToRecord {
    /// Fails if the argument count does not match the operation's parameters
    pub fn new(
        receiver: ProviderRef,
        operation: Operation,
        invokable: Invokable,
        args: Vec<Value>,
    ) -> Result<Self> {
        if args.len() != operation.param_count() {
            return Err(ReplayCompError::Configuration(format!(
                "{} expects {} argument(s), {} provided",
                operation,
                operation.param_count(),
                args.len()
            )));
        }
        Ok(Self {
            receiver,
            operation,
            invokable,
            args,
        })
    }
}

impl fmt::Debug for MethodCallToRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCallToRecord")
            .field("receiver", &self.receiver)
            .field("operation", &self.operation)
            .field("args", &self.args)
            .finish()
    }
}

/// Recording and replay behavior of one provider type
pub struct Registration {
    provider_type: TypeDescriptor,
    singleton: bool,
    mirror_locator: Option<LocalMirrorLocator>,
    methods: IndexMap<Operation, MethodRegistration>,
    extra_interfaces: Vec<TypeDescriptor>,
    calls_to_record_provider: Option<MethodCallsToRecordProvider>,
}

impl Registration {
    pub fn provider_type(&self) -> &TypeDescriptor {
        &self.provider_type
    }

    /// Whether the type has at most one instance per process
    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn mirror_locator(&self) -> Option<&LocalMirrorLocator> {
        self.mirror_locator.as_ref()
    }

    /// Additional marker interfaces the proxies also satisfy
    pub fn extra_interfaces(&self) -> &[TypeDescriptor] {
        &self.extra_interfaces
    }

    /// Whether proxies of this registration satisfy `ty`
    pub fn satisfies(&self, ty: &TypeDescriptor) -> bool {
        self.provider_type.is_subtype_of(ty)
            || self.extra_interfaces.iter().any(|i| i.is_subtype_of(ty))
    }

    /// Explicitly declared operations, in declaration order
    pub fn methods(&self) -> impl Iterator<Item = (&Operation, &MethodRegistration)> {
        self.methods.iter()
    }

    pub fn find_strategy(&self, operation: &Operation) -> MethodStrategy {
        self.methods
            .get(operation)
            .map(|m| m.strategy)
            .unwrap_or_else(|| MethodStrategy::default_for(operation))
    }

    /// Default result for a call; `Null` when nothing is declared
    pub fn find_default_value(
        &self,
        proxy: &ProviderRef,
        operation: &Operation,
        args: &[Value],
    ) -> std::result::Result<Value, ThrownError> {
        match self.methods.get(operation) {
            None => Ok(Value::Null),
            Some(method) => match &method.default_value_supplier {
                Some(supplier) => supplier(proxy, operation, args),
                None => Ok(method.default_value.clone()),
            },
        }
    }

    pub fn find_fallback_handler(&self, operation: &Operation) -> Option<&OperationResultSupplier> {
        self.methods.get(operation).and_then(|m| m.fallback.as_ref())
    }

    pub fn find_invokable_method(&self, operation: &Operation) -> Option<&Invokable> {
        self.methods.get(operation).and_then(|m| m.invokable.as_ref())
    }

    /// Static pre-record calls followed by the receiver-dependent ones
    pub fn get_method_calls_to_record(
        &self,
        receiver: &ProviderRef,
    ) -> Result<Vec<MethodCallToRecord>> {
        let mut calls = Vec::new();
        for (operation, method) in &self.methods {
            if method.calls_to_record_arguments.is_empty() {
                continue;
            }
            let invokable = method.invokable.clone().ok_or_else(|| {
                ReplayCompError::Configuration(format!("no invokable for {}", operation))
            })?;
            for args in &method.calls_to_record_arguments {
                calls.push(MethodCallToRecord::new(
                    receiver.clone(),
                    operation.clone(),
                    Arc::clone(&invokable),
                    args.clone(),
                )?);
            }
        }
        if let Some(provider) = &self.calls_to_record_provider {
            calls.extend(provider(receiver)?);
        }
        Ok(calls)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("provider_type", &self.provider_type)
            .field("singleton", &self.singleton)
            .field("has_mirror_locator", &self.mirror_locator.is_some())
            .field("methods", &self.methods)
            .field("extra_interfaces", &self.extra_interfaces)
            .finish()
    }
}

/// The immutable registry of intercepted provider types
pub struct Declarations {
    registrations: IndexMap<Arc<str>, Arc<Registration>>,
    supertype_cache: DashMap<TypeDescriptor, Option<TypeDescriptor>>,
}

impl Declarations {
    pub fn builder() -> DeclarationsBuilder {
        DeclarationsBuilder::default()
    }

    /// Registrations in declaration order
    pub fn registrations(&self) -> impl Iterator<Item = &Arc<Registration>> {
        self.registrations.values()
    }

    pub fn registration(&self, provider_type: &TypeDescriptor) -> Option<&Arc<Registration>> {
        self.registrations.get(provider_type.name())
    }

    pub fn registration_by_name(&self, name: &str) -> Option<&Arc<Registration>> {
        self.registrations.get(name)
    }

    /// Nearest declared supertype of `ty`; the first declared match wins
    pub fn find_registered_supertype(&self, ty: &TypeDescriptor) -> Option<TypeDescriptor> {
        if let Some(cached) = self.supertype_cache.get(ty) {
            return cached.clone();
        }
        let found = self
            .registrations
            .values()
            .map(|r| &r.provider_type)
            .find(|declared| ty.is_subtype_of(declared))
            .cloned();
        self.supertype_cache.insert(ty.clone(), found.clone());
        found
    }

    pub fn is_registered_instance(&self, instance: &ProviderRef) -> bool {
        self.find_registered_supertype(&instance.provider_type())
            .is_some()
    }

    pub fn find_registration_for_instance(
        &self,
        instance: &ProviderRef,
    ) -> Option<&Arc<Registration>> {
        let declared = self.find_registered_supertype(&instance.provider_type())?;
        self.registration(&declared)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl fmt::Debug for Declarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declarations")
            .field("registrations", &self.registrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Identity operations answered by proxies without consulting the trace
pub(crate) fn is_identity(operation: &Operation) -> Option<IdentityOperation> {
    if *operation == *EQUALS {
        Some(IdentityOperation::Equals)
    } else if *operation == *HASH_CODE {
        Some(IdentityOperation::HashCode)
    } else if *operation == *TO_STRING {
        Some(IdentityOperation::ToString)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdentityOperation {
    Equals,
    HashCode,
    ToString,
}
