//! Stub providers for deterministic testing
//!
//! A [`StubProvider`] answers operations from a table of handlers and counts
//! every invocation, so tests can assert that recording and replay never call
//! a real provider more often than expected.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::provider::{Provider, ProviderRef};
use crate::value::{EQUALS, HASH_CODE, Operation, TO_STRING, ThrownError, TypeDescriptor, Value};

type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, ThrownError> + Send + Sync>;

/// Class of the exception raised for operations without a handler
pub const UNSUPPORTED_OPERATION_CLASS: &str = "UnsupportedOperationException";

/// A provider answering from predetermined handlers
pub struct StubProvider {
    provider_type: TypeDescriptor,
    label: String,
    handlers: RwLock<HashMap<Operation, Handler>>,
    call_count: AtomicUsize,
    call_history: Mutex<Vec<(Operation, Vec<Value>)>>,
}

impl StubProvider {
    /// Create a stub whose `toString` returns `label`
    pub fn new(provider_type: TypeDescriptor, label: impl Into<String>) -> Self {
        Self {
            provider_type,
            label: label.into(),
            handlers: RwLock::new(HashMap::new()),
            call_count: AtomicUsize::new(0),
            call_history: Mutex::new(Vec::new()),
        }
    }

    /// Always return `value` for `operation`
    pub fn with_result(self, operation: &Operation, value: Value) -> Self {
        self.set_result(operation, value);
        self
    }

    /// Always raise `error` for `operation`
    pub fn with_error(self, operation: &Operation, error: ThrownError) -> Self {
        self.set_handler(operation, move |_| Err(error.clone()));
        self
    }

    /// Compute results for `operation` from its arguments
    pub fn with_handler<F>(self, operation: &Operation, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, ThrownError> + Send + Sync + 'static,
    {
        self.set_handler(operation, handler);
        self
    }

    /// Like [`StubProvider::with_result`], for stubs that are already shared
    pub fn set_result(&self, operation: &Operation, value: Value) {
        self.set_handler(operation, move |_| Ok(value.clone()));
    }

    pub fn set_handler<F>(&self, operation: &Operation, handler: F)
    where
        F: Fn(&[Value]) -> Result<Value, ThrownError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.clone(), Arc::new(handler));
    }

    /// Wrap the stub in a provider reference
    pub fn into_ref(self) -> ProviderRef {
        ProviderRef::new(self)
    }

    /// Total number of invocations
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Number of invocations of `operation`
    pub fn calls_of(&self, operation: &Operation) -> usize {
        self.call_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(op, _)| op == operation)
            .count()
    }

    pub fn call_history(&self) -> Vec<(Operation, Vec<Value>)> {
        self.call_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Provider for StubProvider {
    fn provider_type(&self) -> TypeDescriptor {
        self.provider_type.clone()
    }

    fn invoke(&self, operation: &Operation, args: &[Value]) -> Result<Value, ThrownError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.call_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((operation.clone(), args.to_vec()));

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned();
        match handler {
            Some(handler) => handler(args),
            None if *operation == *TO_STRING => Ok(Value::str(&self.label)),
            None if *operation == *HASH_CODE => Ok(Value::Int(self.label.len() as i32)),
            None if *operation == *EQUALS => Ok(Value::Bool(false)),
            None => Err(ThrownError::new(
                UNSUPPORTED_OPERATION_CLASS,
                Some(&format!("{} on {}", operation, self.label)),
            )),
        }
    }
}

impl fmt::Debug for StubProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubProvider")
            .field("provider_type", &self.provider_type)
            .field("label", &self.label)
            .field("call_count", &self.call_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_counts_calls() {
        let name_of = Operation::new("nameOf", &["Type"]);
        let stub = StubProvider::new(TypeDescriptor::new("Naming"), "naming")
            .with_result(&name_of, Value::str("Foo"));

        assert_eq!(stub.invoke(&name_of, &[Value::Int(1)]), Ok(Value::str("Foo")));
        assert_eq!(stub.invoke(&TO_STRING, &[]), Ok(Value::str("naming")));
        assert_eq!(stub.call_count(), 2);
        assert_eq!(stub.calls_of(&name_of), 1);
    }

    #[test]
    fn test_unhandled_operation_raises() {
        let stub = StubProvider::new(TypeDescriptor::new("Naming"), "naming");
        let err = stub
            .invoke(&Operation::new("missing", &[]), &[])
            .unwrap_err();
        assert_eq!(err.class(), UNSUPPORTED_OPERATION_CLASS);
    }
}
