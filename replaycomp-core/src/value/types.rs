//! Type descriptors, operation identities and thrown errors

use once_cell::sync::Lazy;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::ReplayCompError;

/// Class name used for framework failures surfaced inside a proxy call
pub const FRAMEWORK_ERROR_CLASS: &str = "replaycomp.FrameworkError";

/// Class name used for strict-mode replay divergence
pub const DIVERGENCE_ERROR_CLASS: &str = "replaycomp.ReplayDivergence";

/// The identity/string-conversion operations every provider answers
pub static TO_STRING: Lazy<Operation> = Lazy::new(|| Operation::new("toString", &[]));

/// Identity hash of the receiver
pub static HASH_CODE: Lazy<Operation> = Lazy::new(|| Operation::new("hashCode", &[]));

/// Identity comparison with one argument
pub static EQUALS: Lazy<Operation> = Lazy::new(|| Operation::new("equals", &["Object"]));

/// A nominal provider type with its declared supertypes
///
/// Equality and hashing use the type name; names are unique within a process.
#[derive(Clone)]
pub struct TypeDescriptor(Arc<TypeInner>);

struct TypeInner {
    name: Arc<str>,
    supertypes: Vec<TypeDescriptor>,
}

impl TypeDescriptor {
    /// A type without supertypes
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_supertypes(name, Vec::new())
    }

    /// A type with the given direct supertypes
    pub fn with_supertypes(
        name: impl Into<Arc<str>>,
        supertypes: impl IntoIterator<Item = TypeDescriptor>,
    ) -> Self {
        Self(Arc::new(TypeInner {
            name: name.into(),
            supertypes: supertypes.into_iter().collect(),
        }))
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Shared handle to the type name
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.0.name)
    }

    /// Direct supertypes
    pub fn supertypes(&self) -> &[TypeDescriptor] {
        &self.0.supertypes
    }

    /// Reflexive, transitive subtype check
    pub fn is_subtype_of(&self, other: &TypeDescriptor) -> bool {
        self == other || self.0.supertypes.iter().any(|s| s.is_subtype_of(other))
    }
}

impl PartialEq for TypeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for TypeDescriptor {}

impl Hash for TypeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDescriptor({})", self.0.name)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

/// Symbolic identity of a provider operation: a name plus parameter types
///
/// Identity never depends on the instance the operation is invoked on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Operation {
    name: Arc<str>,
    params: Arc<[Arc<str>]>,
}

impl Operation {
    /// Create an operation from its name and parameter type names
    pub fn new(name: &str, params: &[&str]) -> Self {
        Self {
            name: Arc::from(name),
            params: params.iter().map(|p| Arc::from(*p)).collect(),
        }
    }

    /// Rebuild an operation from `[name, param...]`
    pub fn from_parts<I, S>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut iter = parts.into_iter();
        let name: Arc<str> = Arc::from(iter.next()?.as_ref());
        let params = iter.map(|p| Arc::from(p.as_ref())).collect();
        Some(Self { name, params })
    }

    /// `[name, param...]`, the serialized form
    pub fn parts(&self) -> Vec<&str> {
        std::iter::once(&*self.name)
            .chain(self.params.iter().map(|p| &**p))
            .collect()
    }

    /// Operation name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameter type names
    pub fn params(&self) -> &[Arc<str>] {
        &self.params
    }

    /// Number of parameters
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// `toString`, `hashCode` or `equals`
    pub fn is_identity_operation(&self) -> bool {
        *self == *TO_STRING || *self == *HASH_CODE || *self == *EQUALS
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation({})", self)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(param)?;
        }
        f.write_str(")")
    }
}

/// An exception raised by a provider, kept as a value
///
/// Framework failures raised from inside a proxy call carry the original
/// [`ReplayCompError`]; that cause does not take part in equality.
#[derive(Clone)]
pub struct ThrownError {
    class: Arc<str>,
    message: Option<Arc<str>>,
    framework: Option<Arc<ReplayCompError>>,
}

impl ThrownError {
    /// Create a thrown error of the given class
    pub fn new(class: impl Into<Arc<str>>, message: Option<&str>) -> Self {
        Self {
            class: class.into(),
            message: message.map(Arc::from),
            framework: None,
        }
    }

    /// Wrap a framework error so it can travel through `Provider::invoke`
    pub fn framework(error: ReplayCompError) -> Self {
        let class = match error {
            ReplayCompError::Divergence(_) => DIVERGENCE_ERROR_CLASS,
            _ => FRAMEWORK_ERROR_CLASS,
        };
        Self {
            class: Arc::from(class),
            message: Some(Arc::from(error.to_string())),
            framework: Some(Arc::new(error)),
        }
    }

    /// Exception class name
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Exception message
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// The framework error behind this exception, if any
    pub fn framework_cause(&self) -> Option<&ReplayCompError> {
        self.framework.as_deref()
    }
}

impl PartialEq for ThrownError {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.message == other.message
    }
}

impl Eq for ThrownError {}

impl Hash for ThrownError {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.message.hash(state);
    }
}

impl fmt::Debug for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrownError")
            .field("class", &self.class)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for ThrownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class, message),
            None => f.write_str(&self.class),
        }
    }
}

impl std::error::Error for ThrownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtype_is_transitive() {
        let root = TypeDescriptor::new("JavaType");
        let resolved = TypeDescriptor::with_supertypes("ResolvedJavaType", [root.clone()]);
        let object = TypeDescriptor::with_supertypes("ResolvedObjectType", [resolved.clone()]);

        assert!(object.is_subtype_of(&root));
        assert!(object.is_subtype_of(&object));
        assert!(!root.is_subtype_of(&object));
    }

    #[test]
    fn test_operation_identity_ignores_instance() {
        let a = Operation::new("lookupField", &["int", "Method"]);
        let b = Operation::from_parts(["lookupField", "int", "Method"]).unwrap();
        let c = Operation::new("lookupField", &["int"]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.parts(), vec!["lookupField", "int", "Method"]);
        assert_eq!(a.to_string(), "lookupField(int, Method)");
    }

    #[test]
    fn test_framework_error_keeps_cause() {
        let thrown = ThrownError::framework(ReplayCompError::Configuration("bad".into()));
        assert_eq!(thrown.class(), FRAMEWORK_ERROR_CLASS);
        assert!(matches!(
            thrown.framework_cause(),
            Some(ReplayCompError::Configuration(_))
        ));
        assert_eq!(thrown, ThrownError::new(FRAMEWORK_ERROR_CLASS, thrown.message()));
    }
}
