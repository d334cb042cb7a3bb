//! Provider capability seam
//!
//! A provider is any object the consumer calls through named operations.
//! Proxies are providers too; they additionally expose [`ProxyObject`].

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::declarations::Registration;
use crate::value::{Operation, ThrownError, TypeDescriptor, Value};

/// An object whose behavior is exposed as named operations
pub trait Provider: Send + Sync + fmt::Debug {
    /// Runtime type of this provider
    fn provider_type(&self) -> TypeDescriptor;

    /// Invoke `operation` with `args`; exceptions are returned as values
    fn invoke(&self, operation: &Operation, args: &[Value]) -> Result<Value, ThrownError>;

    /// Proxy view of this provider, `None` for real providers
    fn as_proxy(&self) -> Option<&dyn ProxyObject> {
        None
    }
}

/// Extra capabilities every proxy has
pub trait ProxyObject: Send + Sync {
    /// The registration this proxy was created for
    fn registration(&self) -> &Arc<Registration>;

    /// The real instance behind this proxy: the delegate while recording,
    /// the local mirror during replay
    fn backing_instance(&self) -> Option<ProviderRef>;
}

/// Shared, identity-compared handle to a provider
#[derive(Clone)]
pub struct ProviderRef(Arc<dyn Provider>);

impl ProviderRef {
    pub fn new<P: Provider + 'static>(provider: P) -> Self {
        Self(Arc::new(provider))
    }

    pub fn from_arc(provider: Arc<dyn Provider>) -> Self {
        Self(provider)
    }

    /// Reference a provider that the caller keeps a typed handle to
    pub fn from_shared<P: Provider + 'static>(provider: &Arc<P>) -> Self {
        Self(Arc::clone(provider) as Arc<dyn Provider>)
    }

    /// Address of the provider, its identity
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Identity hash code, as returned by proxies for `hashCode`
    pub fn identity_hash(&self) -> i32 {
        let addr = self.addr() as u64;
        (addr ^ (addr >> 32)) as i32
    }

    pub fn is_proxy(&self) -> bool {
        self.0.as_proxy().is_some()
    }

    /// Backing instance if this is a proxy
    pub fn unproxify(&self) -> Option<ProviderRef> {
        self.0.as_proxy().and_then(ProxyObject::backing_instance)
    }

    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.0
    }
}

impl Deref for ProviderRef {
    type Target = dyn Provider;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ProviderRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ProviderRef {}

impl Hash for ProviderRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_proxy() { "proxy " } else { "" };
        write!(f, "{}{}@{:x}", kind, self.provider_type(), self.addr())
    }
}

/// The live environment available at replay time
///
/// Local-mirror locators and singleton resolution consult it to find real
/// objects equivalent to recorded ones.
pub trait LocalEnvironment: Send + Sync {
    /// A live singleton provider of the given type
    fn singleton(&self, provider_type: &TypeDescriptor) -> Option<ProviderRef>;

    /// Downcasting hook for locators that know the concrete environment
    fn as_any(&self) -> &dyn Any;
}

/// An environment without any live objects
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyEnvironment;

impl LocalEnvironment for EmptyEnvironment {
    fn singleton(&self, _provider_type: &TypeDescriptor) -> Option<ProviderRef> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
