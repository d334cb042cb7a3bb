//! Builders for [`Registration`] and [`Declarations`]

use dashmap::DashMap;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

use super::{
    Declarations, Invokable, LocalMirrorLocator, MethodCallToRecord, MethodCallsToRecordProvider,
    MethodRegistration, MethodStrategy, OperationResultSupplier, Registration,
    dispatching_invokable,
};
use crate::error::{ReplayCompError, Result};
use crate::provider::{LocalEnvironment, ProviderRef};
use crate::value::{Operation, TO_STRING, ThrownError, TypeDescriptor, Value};

struct MethodRegistrationBuilder {
    strategy: MethodStrategy,
    default_value_supplier: Option<OperationResultSupplier>,
    default_value: Value,
    calls_to_record_arguments: Vec<Vec<Value>>,
    fallback: Option<OperationResultSupplier>,
    invokable: Option<Invokable>,
}

impl MethodRegistrationBuilder {
    fn create_default(operation: &Operation) -> Self {
        let mut builder = Self {
            strategy: MethodStrategy::default_for(operation),
            default_value_supplier: None,
            default_value: Value::Null,
            calls_to_record_arguments: Vec::new(),
            fallback: None,
            invokable: None,
        };
        // toString is always part of the trace so diagnostics can print proxies
        if *operation == *TO_STRING {
            builder.invokable = Some(dispatching_invokable(operation.clone()));
            builder.calls_to_record_arguments.push(Vec::new());
        }
        builder
    }

    fn build(self) -> Result<MethodRegistration> {
        MethodRegistration::new(
            self.strategy,
            self.default_value_supplier,
            self.default_value,
            self.calls_to_record_arguments,
            self.fallback,
            self.invokable,
        )
    }
}

/// Declares the behavior of one provider type
pub struct RegistrationBuilder {
    provider_type: TypeDescriptor,
    singleton: bool,
    mirror_locator: Option<LocalMirrorLocator>,
    methods: IndexMap<Operation, MethodRegistrationBuilder>,
    extra_interfaces: Vec<TypeDescriptor>,
    calls_to_record_provider: Option<MethodCallsToRecordProvider>,
}

impl RegistrationBuilder {
    pub fn new(provider_type: TypeDescriptor) -> Self {
        let mut methods = IndexMap::new();
        methods.insert(
            TO_STRING.clone(),
            MethodRegistrationBuilder::create_default(&TO_STRING),
        );
        Self {
            provider_type,
            singleton: false,
            mirror_locator: None,
            methods,
            extra_interfaces: Vec::new(),
            calls_to_record_provider: None,
        }
    }

    fn method(&mut self, operation: &Operation) -> &mut MethodRegistrationBuilder {
        self.methods
            .entry(operation.clone())
            .or_insert_with(|| MethodRegistrationBuilder::create_default(operation))
    }

    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    pub fn local_mirror_locator<F>(mut self, locator: F) -> Self
    where
        F: Fn(&ProviderRef, &dyn LocalEnvironment) -> Option<ProviderRef> + Send + Sync + 'static,
    {
        self.mirror_locator = Some(Arc::new(locator));
        self
    }

    pub fn extra_interface(mut self, interface: TypeDescriptor) -> Self {
        self.extra_interfaces.push(interface);
        self
    }

    pub fn strategy(mut self, operation: &Operation, strategy: MethodStrategy) -> Self {
        self.method(operation).strategy = strategy;
        self
    }

    pub fn fallback<F>(mut self, operation: &Operation, handler: F) -> Self
    where
        F: Fn(&ProviderRef, &Operation, &[Value]) -> std::result::Result<Value, ThrownError>
            + Send
            + Sync
            + 'static,
    {
        self.method(operation).fallback = Some(Arc::new(handler));
        self
    }

    /// Use the DefaultValue strategy with a fixed value
    pub fn default_value_strategy(mut self, operation: &Operation, value: Value) -> Self {
        let method = self.method(operation);
        method.strategy = MethodStrategy::DefaultValue;
        method.default_value = value;
        self
    }

    /// Value returned when replay cannot find anything better
    pub fn default_value(mut self, operation: &Operation, value: Value) -> Self {
        self.method(operation).default_value = value;
        self
    }

    pub fn default_value_supplier<F>(mut self, operation: &Operation, supplier: F) -> Self
    where
        F: Fn(&ProviderRef, &Operation, &[Value]) -> std::result::Result<Value, ThrownError>
            + Send
            + Sync
            + 'static,
    {
        let method = self.method(operation);
        method.default_value = Value::Null;
        method.default_value_supplier = Some(Arc::new(supplier));
        self
    }

    /// Always record `operation` with `args`, performing it through `invokable`
    pub fn ensure_recorded<F>(mut self, operation: &Operation, invokable: F, args: Vec<Value>) -> Self
    where
        F: Fn(&ProviderRef, &[Value]) -> std::result::Result<Value, ThrownError>
            + Send
            + Sync
            + 'static,
    {
        let method = self.method(operation);
        method.calls_to_record_arguments.push(args);
        method.invokable = Some(Arc::new(invokable));
        self
    }

    /// Always record `operation` with `args`; an invokable must be supplied
    /// separately with [`RegistrationBuilder::invokable`]
    pub fn ensure_recorded_args(mut self, operation: &Operation, args: Vec<Value>) -> Self {
        self.method(operation).calls_to_record_arguments.push(args);
        self
    }

    pub fn invokable(mut self, operation: &Operation, invokable: Invokable) -> Self {
        self.method(operation).invokable = Some(invokable);
        self
    }

    pub fn calls_to_record<F>(mut self, provider: F) -> Self
    where
        F: Fn(&ProviderRef) -> Result<Vec<MethodCallToRecord>> + Send + Sync + 'static,
    {
        self.calls_to_record_provider = Some(Arc::new(provider));
        self
    }

    /// Validate and freeze the registration
    pub fn build(self) -> Result<Registration> {
        let mut methods = IndexMap::with_capacity(self.methods.len());
        for (operation, method) in self.methods {
            if let Some(bad) = method
                .calls_to_record_arguments
                .iter()
                .find(|args| args.len() != operation.param_count())
            {
                return Err(ReplayCompError::Configuration(format!(
                    "{}.{} expects {} argument(s), {} declared for pre-recording",
                    self.provider_type,
                    operation,
                    operation.param_count(),
                    bad.len()
                )));
            }
            let method = method.build().map_err(|e| match e {
                ReplayCompError::Configuration(msg) => ReplayCompError::Configuration(format!(
                    "{}.{}: {}",
                    self.provider_type, operation, msg
                )),
                other => other,
            })?;
            methods.insert(operation, method);
        }
        Ok(Registration {
            provider_type: self.provider_type,
            singleton: self.singleton,
            mirror_locator: self.mirror_locator,
            methods,
            extra_interfaces: self.extra_interfaces,
            calls_to_record_provider: self.calls_to_record_provider,
        })
    }
}

/// Collects registrations; declaration order is lookup priority
#[derive(Default)]
pub struct DeclarationsBuilder {
    registrations: IndexMap<Arc<str>, Arc<Registration>>,
}

impl DeclarationsBuilder {
    /// Add a registration, rejecting invalid or duplicate ones
    pub fn register(mut self, builder: RegistrationBuilder) -> Result<Self> {
        let registration = builder.build()?;
        let name = registration.provider_type.name_arc();
        if self.registrations.contains_key(&name) {
            return Err(ReplayCompError::Configuration(format!(
                "provider type {} registered twice",
                name
            )));
        }
        debug!(
            provider_type = %name,
            singleton = registration.singleton,
            methods = registration.methods.len(),
            "Registered provider type"
        );
        self.registrations.insert(name, Arc::new(registration));
        Ok(self)
    }

    pub fn build(self) -> Declarations {
        Declarations {
            registrations: self.registrations,
            supertype_cache: DashMap::new(),
        }
    }
}
