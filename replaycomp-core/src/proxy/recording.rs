//! Recording proxies

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::framework_error;
use crate::declarations::{
    Declarations, IdentityOperation, MethodStrategy, Registration, is_identity,
};
use crate::error::{ReplayCompError, Result};
use crate::mapper::ProxyGraphMapper;
use crate::provider::{Provider, ProviderRef, ProxyObject};
use crate::recorder::{OperationKey, OperationRecorder, RecordedOperation};
use crate::special::ResultOrMarker;
use crate::value::{Operation, ThrownError, TypeDescriptor, Value};

struct RecordingInner {
    declarations: Arc<Declarations>,
    recorder: Arc<OperationRecorder>,
    /// Live proxy of each real instance; weak so proxies do not keep the
    /// factory alive
    proxies: DashMap<ProviderRef, Weak<dyn Provider>>,
}

/// Factory of recording proxies sharing one recorder
#[derive(Clone)]
pub struct RecordingProxies {
    inner: Arc<RecordingInner>,
}

impl RecordingProxies {
    pub fn new(declarations: Arc<Declarations>, recorder: Arc<OperationRecorder>) -> Self {
        Self {
            inner: Arc::new(RecordingInner {
                declarations,
                recorder,
                proxies: DashMap::new(),
            }),
        }
    }

    pub fn declarations(&self) -> &Arc<Declarations> {
        &self.inner.declarations
    }

    pub fn recorder(&self) -> &Arc<OperationRecorder> {
        &self.inner.recorder
    }

    /// Wrap a registered provider instance
    ///
    /// While a proxy of `instance` is alive, proxying it again returns that
    /// same proxy, so one instance keeps one identity throughout a unit.
    pub fn proxify(&self, instance: &ProviderRef) -> Result<ProviderRef> {
        if instance.is_proxy() {
            return Ok(instance.clone());
        }
        let registration = self
            .inner
            .declarations
            .find_registration_for_instance(instance)
            .ok_or_else(|| ReplayCompError::UnregisteredProvider {
                type_name: instance.provider_type().name().to_string(),
            })?;
        let create = || {
            ProviderRef::new(RecordingProxy {
                delegate: instance.clone(),
                registration: Arc::clone(registration),
                owner: Arc::clone(&self.inner),
            })
        };
        let proxy = match self.inner.proxies.entry(instance.clone()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(live) => return Ok(ProviderRef::from_arc(live)),
                None => {
                    let proxy = create();
                    entry.insert(Arc::downgrade(proxy.inner()));
                    proxy
                }
            },
            Entry::Vacant(entry) => {
                let proxy = create();
                entry.insert(Arc::downgrade(proxy.inner()));
                proxy
            }
        };
        debug!(instance = ?instance, "Created recording proxy");
        Ok(proxy)
    }

    /// Replace every provider instance inside `value` with a recording proxy
    pub fn proxify_value(&self, value: &Value) -> Result<Value> {
        ProxyGraphMapper::new(&self.inner.declarations)
            .substitute_forward(value, &mut |instance: &ProviderRef| self.proxify(instance))
    }

    /// Unwrap every recording proxy inside `value`
    pub fn unproxify_value(&self, value: &Value) -> Option<Value> {
        ProxyGraphMapper::new(&self.inner.declarations).substitute_backward(value)
    }

    /// Record the calls every reachable provider must contribute and return
    /// all operations of the active unit, with proxies in place of instances
    ///
    /// Runs until no new provider instance is discovered, so results of
    /// pre-recorded calls have their own pre-recorded calls too. Fails
    /// unless a unit scope is active.
    pub fn collect_for_serialization(&self) -> Result<Vec<RecordedOperation>> {
        self.collect_reachable_from(&[])
    }

    /// Like [`RecordingProxies::collect_for_serialization`], additionally
    /// starting the walk at `roots`, which need not occur in any recorded
    /// operation yet
    pub fn collect_reachable_from(&self, roots: &[ProviderRef]) -> Result<Vec<RecordedOperation>> {
        let recorder = &self.inner.recorder;
        let mut visited: HashSet<ProviderRef> = HashSet::new();
        let mut worklist: VecDeque<ProviderRef> = VecDeque::new();

        for root in roots {
            self.enqueue(root, &mut visited, &mut worklist);
        }
        for operation in recorder.current_recorded_operations()? {
            self.enqueue(&operation.receiver, &mut visited, &mut worklist);
            for arg in operation.args.iter() {
                self.discover(arg, &mut visited, &mut worklist)?;
            }
            if let ResultOrMarker::Value(value) = &operation.result {
                self.discover(value, &mut visited, &mut worklist)?;
            }
        }

        let mut pre_recorded = 0usize;
        while let Some(instance) = worklist.pop_front() {
            let Some(registration) = self
                .inner
                .declarations
                .find_registration_for_instance(&instance)
            else {
                continue;
            };
            for call in registration.get_method_calls_to_record(&instance)? {
                self.enqueue(&call.receiver, &mut visited, &mut worklist);
                let key = OperationKey::new(
                    call.receiver.clone(),
                    call.operation.clone(),
                    call.args.clone(),
                );
                if !recorder.get_result_or_marker(&key).is_no_result() {
                    continue;
                }
                let outcome = (call.invokable)(&call.receiver, &call.args);
                if let Ok(value) = &outcome {
                    self.discover(value, &mut visited, &mut worklist)?;
                }
                recorder.record(key, ResultOrMarker::from_outcome(outcome));
                pre_recorded += 1;
            }
        }

        let operations = recorder
            .current_recorded_operations()?
            .into_iter()
            .map(|operation| {
                Ok(RecordedOperation::new(
                    self.proxify(&operation.receiver)?,
                    operation.operation,
                    operation
                        .args
                        .iter()
                        .map(|arg| self.proxify_value(arg))
                        .collect::<Result<Vec<_>>>()?,
                    operation.result.try_map(|v| self.proxify_value(v))?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            operations = operations.len(),
            providers = visited.len(),
            pre_recorded,
            "Collected operations for serialization"
        );
        Ok(operations)
    }

    fn enqueue(
        &self,
        instance: &ProviderRef,
        visited: &mut HashSet<ProviderRef>,
        worklist: &mut VecDeque<ProviderRef>,
    ) {
        let instance = instance.unproxify().unwrap_or_else(|| instance.clone());
        if visited.insert(instance.clone()) {
            worklist.push_back(instance);
        }
    }

    fn discover(
        &self,
        value: &Value,
        visited: &mut HashSet<ProviderRef>,
        worklist: &mut VecDeque<ProviderRef>,
    ) -> Result<()> {
        ProxyGraphMapper::new(&self.inner.declarations).substitute_forward(
            value,
            &mut |instance: &ProviderRef| {
                self.enqueue(instance, visited, worklist);
                Ok(instance.clone())
            },
        )?;
        Ok(())
    }
}

impl fmt::Debug for RecordingProxies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingProxies")
            .field("declarations", &self.inner.declarations.len())
            .field("recorder", &self.inner.recorder)
            .finish()
    }
}

struct RecordingProxy {
    delegate: ProviderRef,
    registration: Arc<Registration>,
    owner: Arc<RecordingInner>,
}

impl RecordingProxy {
    fn handle(&self) -> RecordingProxies {
        RecordingProxies {
            inner: Arc::clone(&self.owner),
        }
    }

    fn real_args(&self, args: &[Value]) -> std::result::Result<Vec<Value>, ThrownError> {
        let mapper = ProxyGraphMapper::new(&self.owner.declarations);
        args.iter()
            .map(|arg| {
                mapper.substitute_backward(arg).ok_or_else(|| {
                    framework_error(ReplayCompError::Other(format!(
                        "argument {} of a recording proxy call has no backing instance",
                        arg
                    )))
                })
            })
            .collect()
    }

    fn forward(
        &self,
        outcome: std::result::Result<Value, ThrownError>,
    ) -> std::result::Result<Value, ThrownError> {
        let value = outcome?;
        self.handle().proxify_value(&value).map_err(framework_error)
    }

    fn invoke_directly(
        &self,
        operation: &Operation,
        args: &[Value],
    ) -> std::result::Result<Value, ThrownError> {
        let real_args = self.real_args(args)?;
        self.forward(self.delegate.invoke(operation, &real_args))
    }

    fn record_replay(
        &self,
        operation: &Operation,
        args: &[Value],
    ) -> std::result::Result<Value, ThrownError> {
        let real_args = self.real_args(args)?;
        let key = OperationKey::new(self.delegate.clone(), operation.clone(), real_args);
        let recorder = &self.owner.recorder;
        let outcome = match recorder.get_result_or_marker(&key).to_outcome() {
            Some(outcome) => {
                debug!(operation = %operation, receiver = ?self.delegate, "Answered from recorded result");
                outcome
            }
            None => {
                let outcome = self.delegate.invoke(operation, key.args());
                recorder.record(key, ResultOrMarker::from_outcome(outcome.clone()));
                outcome
            }
        };
        self.forward(outcome)
    }
}

impl Provider for RecordingProxy {
    fn provider_type(&self) -> TypeDescriptor {
        self.registration.provider_type().clone()
    }

    fn invoke(&self, operation: &Operation, args: &[Value]) -> std::result::Result<Value, ThrownError> {
        match self.registration.find_strategy(operation) {
            MethodStrategy::RecordReplay => self.record_replay(operation, args),
            MethodStrategy::Passthrough | MethodStrategy::DefaultValue => {
                self.invoke_directly(operation, args)
            }
            MethodStrategy::Special => match is_identity(operation) {
                Some(IdentityOperation::Equals) => {
                    let other = args
                        .first()
                        .and_then(Value::as_provider)
                        .map(|p| p.unproxify().unwrap_or_else(|| p.clone()));
                    Ok(Value::Bool(other.as_ref() == Some(&self.delegate)))
                }
                Some(IdentityOperation::HashCode) => Ok(Value::Int(self.delegate.identity_hash())),
                Some(IdentityOperation::ToString) => self.record_replay(operation, args),
                None => self.invoke_directly(operation, args),
            },
        }
    }

    fn as_proxy(&self) -> Option<&dyn ProxyObject> {
        Some(self)
    }
}

impl ProxyObject for RecordingProxy {
    fn registration(&self) -> &Arc<Registration> {
        &self.registration
    }

    fn backing_instance(&self) -> Option<ProviderRef> {
        Some(self.delegate.clone())
    }
}

impl fmt::Debug for RecordingProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordingProxy({:?})", self.delegate)
    }
}
