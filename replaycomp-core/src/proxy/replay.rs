//! Replay proxies

use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tracing::{debug, info, warn};

use super::table::ReplayTable;
use super::{ProxyFactory, framework_error};
use crate::declarations::{
    Declarations, IdentityOperation, MethodStrategy, Registration, is_identity,
};
use crate::error::{Divergence, ReplayCompError, Result};
use crate::mapper::ProxyGraphMapper;
use crate::provider::{LocalEnvironment, Provider, ProviderRef, ProxyObject};
use crate::recorder::RecordedOperation;
use crate::value::{Operation, TO_STRING, ThrownError, TypeDescriptor, Value};

/// How replay treats calls nothing can answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Raise a divergence instead of returning the declared default
    pub divergence_is_failure: bool,
}

impl ReplayOptions {
    pub fn strict() -> Self {
        Self {
            divergence_is_failure: true,
        }
    }
}

struct ReplayInner {
    declarations: Arc<Declarations>,
    options: ReplayOptions,
    proxies: Mutex<Vec<Arc<ReplayProxy>>>,
    table: OnceLock<ReplayTable>,
    mirrored: DashMap<ProviderRef, ProviderRef>,
    mirrors_located: AtomicBool,
}

impl ReplayInner {
    fn new_proxy(
        self: &Arc<Self>,
        registration: Arc<Registration>,
        mirror: Option<ProviderRef>,
    ) -> Arc<ReplayProxy> {
        let proxy = Arc::new_cyclic(|this| ReplayProxy {
            registration,
            owner: Arc::downgrade(self),
            this: Weak::clone(this),
            range: OnceLock::new(),
            mirror: OnceLock::new(),
        });
        if let Some(mirror) = mirror {
            let _ = proxy.mirror.set(mirror);
        }
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&proxy));
        proxy
    }

    fn proxify(self: &Arc<Self>, local: &ProviderRef) -> Result<ProviderRef> {
        if local.is_proxy() {
            return Ok(local.clone());
        }
        if let Some(proxy) = self.mirrored.get(local) {
            return Ok(proxy.clone());
        }
        let registration = self
            .declarations
            .find_registration_for_instance(local)
            .cloned()
            .ok_or_else(|| ReplayCompError::UnregisteredProvider {
                type_name: local.provider_type().name().to_string(),
            })?;
        let proxy = self
            .mirrored
            .entry(local.clone())
            .or_insert_with(|| {
                ProviderRef::from_shared(&self.new_proxy(registration, Some(local.clone())))
            })
            .clone();
        Ok(proxy)
    }

    fn proxify_value(self: &Arc<Self>, value: &Value) -> Result<Value> {
        ProxyGraphMapper::new(&self.declarations)
            .substitute_forward(value, &mut |local: &ProviderRef| self.proxify(local))
    }

    fn forward(
        self: &Arc<Self>,
        outcome: std::result::Result<Value, ThrownError>,
    ) -> std::result::Result<Value, ThrownError> {
        let value = outcome?;
        self.proxify_value(&value).map_err(framework_error)
    }
}

/// Factory of replay proxies answering from one loaded trace
#[derive(Clone)]
pub struct ReplayProxies {
    inner: Arc<ReplayInner>,
}

impl ReplayProxies {
    pub fn new(declarations: Arc<Declarations>, options: ReplayOptions) -> Self {
        Self {
            inner: Arc::new(ReplayInner {
                declarations,
                options,
                proxies: Mutex::new(Vec::new()),
                table: OnceLock::new(),
                mirrored: DashMap::new(),
                mirrors_located: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> ReplayOptions {
        self.inner.options
    }

    /// Every proxy created so far, in creation order
    pub fn proxies(&self) -> Vec<ProviderRef> {
        self.inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(ProviderRef::from_shared)
            .collect()
    }

    /// Load the recorded operations of a trace into the flattened table
    ///
    /// Every receiver must be a proxy created by this factory. The table can
    /// only be installed once.
    pub fn install(&self, operations: &[RecordedOperation]) -> Result<()> {
        let (table, ranges) = ReplayTable::build(operations);
        let by_addr: HashMap<usize, Arc<ReplayProxy>> = self
            .inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|proxy| (ProviderRef::from_shared(proxy).addr(), Arc::clone(proxy)))
            .collect();

        for (receiver, range) in ranges {
            let proxy = by_addr.get(&receiver.addr()).ok_or_else(|| {
                ReplayCompError::Configuration(format!(
                    "receiver {:?} is not a proxy of this replay",
                    receiver
                ))
            })?;
            proxy.range.set(range).map_err(|_| {
                ReplayCompError::Configuration(format!("receiver {:?} installed twice", receiver))
            })?;
        }
        let slots = table.len();
        self.inner
            .table
            .set(table)
            .map_err(|_| ReplayCompError::Configuration("replay table installed twice".into()))?;
        debug!(operations = operations.len(), slots, "Installed replay table");
        Ok(())
    }

    /// Attach live local objects to the proxies that stand for them
    ///
    /// Singleton proxies use the environment's singleton of their type, the
    /// others their registration's mirror locator. Runs once; later calls
    /// find nothing.
    pub fn find_local_mirrors(&self, environment: &dyn LocalEnvironment) -> usize {
        if self.inner.mirrors_located.swap(true, Ordering::SeqCst) {
            warn!("Local mirrors were already located");
            return 0;
        }
        let proxies: Vec<Arc<ReplayProxy>> = self
            .inner
            .proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut found = 0;
        for proxy in proxies {
            if proxy.mirror.get().is_some() {
                continue;
            }
            let proxy_ref = ProviderRef::from_shared(&proxy);
            let registration = &proxy.registration;
            let mirror = if registration.is_singleton() {
                environment.singleton(registration.provider_type())
            } else {
                registration
                    .mirror_locator()
                    .and_then(|locate| locate(&proxy_ref, environment))
            };
            if let Some(mirror) = mirror
                && proxy.mirror.set(mirror.clone()).is_ok()
            {
                self.inner.mirrored.insert(mirror, proxy_ref);
                found += 1;
            }
        }
        info!(found, "Located local mirrors");
        found
    }

    /// The proxy standing for a live local object, created on first use
    pub fn proxify(&self, local: &ProviderRef) -> Result<ProviderRef> {
        self.inner.proxify(local)
    }

    pub fn proxify_value(&self, value: &Value) -> Result<Value> {
        self.inner.proxify_value(value)
    }
}

impl ProxyFactory for ReplayProxies {
    fn declarations(&self) -> &Declarations {
        &self.inner.declarations
    }

    fn create_proxy(&self, registration: &Arc<Registration>) -> Result<ProviderRef> {
        Ok(ProviderRef::from_shared(
            &self.inner.new_proxy(Arc::clone(registration), None),
        ))
    }
}

impl fmt::Debug for ReplayProxies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayProxies")
            .field("options", &self.inner.options)
            .field("proxies", &self.proxies().len())
            .field("mirrored", &self.inner.mirrored.len())
            .finish()
    }
}

struct ReplayProxy {
    registration: Arc<Registration>,
    owner: Weak<ReplayInner>,
    this: Weak<ReplayProxy>,
    range: OnceLock<Range<usize>>,
    mirror: OnceLock<ProviderRef>,
}

impl ReplayProxy {
    fn owner(&self) -> std::result::Result<Arc<ReplayInner>, ThrownError> {
        self.owner.upgrade().ok_or_else(|| {
            framework_error(ReplayCompError::Other(
                "replay proxy used after its factory was dropped".into(),
            ))
        })
    }

    fn this(&self) -> std::result::Result<ProviderRef, ThrownError> {
        self.this
            .upgrade()
            .map(|this| ProviderRef::from_shared(&this))
            .ok_or_else(|| framework_error(ReplayCompError::Other("replay proxy dropped".into())))
    }

    fn recorded<'a>(
        &self,
        owner: &'a ReplayInner,
        operation: &Operation,
        args: &[Value],
    ) -> Option<&'a crate::special::ResultOrMarker> {
        let range = self.range.get()?;
        owner.table.get()?.find_result(range, operation, args)
    }

    fn invoke_mirror(
        &self,
        owner: &Arc<ReplayInner>,
        mirror: &ProviderRef,
        operation: &Operation,
        real_args: &[Value],
    ) -> std::result::Result<Value, ThrownError> {
        debug!(operation = %operation, mirror = ?mirror, "Invoking local mirror");
        owner.forward(mirror.invoke(operation, real_args))
    }

    fn resolve(
        &self,
        operation: &Operation,
        args: &[Value],
    ) -> std::result::Result<Value, ThrownError> {
        let owner = self.owner()?;
        let this = self.this()?;
        let registration = &self.registration;
        let mapper = ProxyGraphMapper::new(&owner.declarations);

        match registration.find_strategy(operation) {
            MethodStrategy::Passthrough => {
                // the mirror only sees real arguments, never replay proxies
                if let Some(mirror) = self.mirror.get()
                    && let Some(real_args) = args
                        .iter()
                        .map(|arg| mapper.substitute_backward(arg))
                        .collect::<Option<Vec<_>>>()
                {
                    return self.invoke_mirror(&owner, mirror, operation, &real_args);
                }
                if let Some(fallback) = registration.find_fallback_handler(operation) {
                    return fallback(&this, operation, args);
                }
                if owner.options.divergence_is_failure {
                    let divergence = self.divergence(&owner, &this, operation, args);
                    return Err(framework_error(ReplayCompError::Divergence(Box::new(
                        divergence,
                    ))));
                }
                Err(framework_error(ReplayCompError::Configuration(format!(
                    "passthrough operation {} on {} has neither a usable local mirror nor a fallback",
                    operation,
                    registration.provider_type()
                ))))
            }
            MethodStrategy::DefaultValue => registration.find_default_value(&this, operation, args),
            MethodStrategy::RecordReplay | MethodStrategy::Special => {
                match is_identity(operation) {
                    Some(IdentityOperation::Equals) => {
                        return Ok(Value::Bool(
                            args.first().and_then(Value::as_provider) == Some(&this),
                        ));
                    }
                    Some(IdentityOperation::HashCode) => {
                        return Ok(Value::Int(this.identity_hash()));
                    }
                    Some(IdentityOperation::ToString) | None => {}
                }

                if let Some(recorded) = self.recorded(&owner, operation, args)
                    && let Some(outcome) = recorded.to_outcome()
                {
                    return outcome.map(|value| value.materialize());
                }

                if let Some(mirror) = self.mirror.get()
                    && let Some(real_args) = args
                        .iter()
                        .map(|arg| mapper.substitute_backward(arg))
                        .collect::<Option<Vec<_>>>()
                {
                    return self.invoke_mirror(&owner, mirror, operation, &real_args);
                }

                if let Some(fallback) = registration.find_fallback_handler(operation) {
                    debug!(operation = %operation, "Answered by fallback handler");
                    return fallback(&this, operation, args);
                }

                if owner.options.divergence_is_failure {
                    let divergence = self.divergence(&owner, &this, operation, args);
                    return Err(framework_error(ReplayCompError::Divergence(Box::new(
                        divergence,
                    ))));
                }
                warn!(
                    operation = %operation,
                    receiver = %registration.provider_type(),
                    "No recorded result, returning default value"
                );
                registration.find_default_value(&this, operation, args)
            }
        }
    }

    fn divergence(
        &self,
        owner: &ReplayInner,
        this: &ProviderRef,
        operation: &Operation,
        args: &[Value],
    ) -> Divergence {
        let receiver = self
            .recorded(owner, &TO_STRING, &[])
            .and_then(|recorded| recorded.to_outcome())
            .and_then(|outcome| outcome.ok())
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", this));
        let recorded_keys = match (self.range.get(), owner.table.get()) {
            (Some(range), Some(table)) => table
                .recorded_argument_sets(range, operation.name())
                .iter()
                .map(|args| {
                    args.iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .collect(),
            _ => Vec::new(),
        };
        Divergence {
            operation: operation.clone(),
            receiver,
            arguments: args.iter().map(Value::to_string).collect(),
            local_mirror: self.mirror.get().map(|mirror| format!("{:?}", mirror)),
            recorded_keys,
        }
    }
}

impl Provider for ReplayProxy {
    fn provider_type(&self) -> TypeDescriptor {
        self.registration.provider_type().clone()
    }

    fn invoke(&self, operation: &Operation, args: &[Value]) -> std::result::Result<Value, ThrownError> {
        self.resolve(operation, args)
    }

    fn as_proxy(&self) -> Option<&dyn ProxyObject> {
        Some(self)
    }
}

impl ProxyObject for ReplayProxy {
    fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    fn backing_instance(&self) -> Option<ProviderRef> {
        self.mirror.get().cloned()
    }
}

impl fmt::Debug for ReplayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayProxy")
            .field("provider_type", self.registration.provider_type())
            .field("range", &self.range.get())
            .field("has_mirror", &self.mirror.get().is_some())
            .finish()
    }
}
