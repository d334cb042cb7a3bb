//! Values that flow through intercepted operations
//!
//! Everything a provider operation takes or returns is a [`Value`]: scalars,
//! strings and primitive arrays, provider references, thrown exceptions and a
//! closed set of structured records. Equality is structural, except that
//! provider references, graph references and delayed values compare by
//! identity and floating point values compare by bit pattern.

mod delayed;
mod graph;
mod record;
mod types;

pub use delayed::{DelayedValue, PendingRecord};
pub use graph::{GraphNode, GraphRef, ValueGraph, ValueGraphBuilder};
pub use record::{
    Assumption, ExceptionHandler, ProfiledType, Record, RecordKind, StackFrame, TriState,
    TypeProfile,
};
pub use types::{
    DIVERGENCE_ERROR_CLASS, EQUALS, FRAMEWORK_ERROR_CLASS, HASH_CODE, Operation, TO_STRING,
    ThrownError, TypeDescriptor,
};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::Arc;

use crate::provider::ProviderRef;

/// `f64` with bitwise equality, so NaN payloads and signed zeros survive
#[derive(Debug, Clone, Copy)]
pub struct ExactF64(pub f64);

impl ExactF64 {
    pub fn get(self) -> f64 {
        self.0
    }
}

impl PartialEq for ExactF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for ExactF64 {}

impl Hash for ExactF64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<f64> for ExactF64 {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

/// Element type of an array value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// A provider type
    Provider(TypeDescriptor),
    /// Any other element type, by name (`Object`, `String`, ...)
    Named(Arc<str>),
}

impl ElementType {
    pub fn named(name: &str) -> Self {
        ElementType::Named(Arc::from(name))
    }

    pub fn name(&self) -> &str {
        match self {
            ElementType::Provider(t) => t.name(),
            ElementType::Named(n) => n,
        }
    }
}

/// An array together with its element type
///
/// When the graph mapper narrows the element type of an array it keeps the
/// original element type inside the rewritten array, so the backward mapping
/// can restore it without any side table.
#[derive(Debug, Clone)]
pub struct ArrayValue {
    element: ElementType,
    original_element: Option<ElementType>,
    items: Arc<[Value]>,
}

impl ArrayValue {
    pub fn new(element: ElementType, items: impl Into<Arc<[Value]>>) -> Self {
        Self {
            element,
            original_element: None,
            items: items.into(),
        }
    }

    pub(crate) fn rewritten(
        element: ElementType,
        original_element: Option<ElementType>,
        items: Vec<Value>,
    ) -> Self {
        Self {
            element,
            original_element,
            items: items.into(),
        }
    }

    pub fn element(&self) -> &ElementType {
        &self.element
    }

    /// Element type before forward mapping, when it was replaced
    pub fn original_element(&self) -> Option<&ElementType> {
        self.original_element.as_ref()
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element && self.items == other.items
    }
}

impl Eq for ArrayValue {}

impl Hash for ArrayValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.element.hash(state);
        self.items.hash(state);
    }
}

/// A constant of an enumeration type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumConstant {
    pub holder: Arc<str>,
    pub constant: Arc<str>,
}

/// Variant of a [`Value`], used to claim values in the serializer registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Str,
    Bytes,
    Doubles,
    Enum,
    Array,
    List,
    Provider,
    Thrown,
    Record(RecordKind),
    Graph,
    Delayed,
}

/// A value passed to or returned from a provider operation
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Doubles(Arc<[f64]>),
    Enum(EnumConstant),
    Array(ArrayValue),
    List(Arc<[Value]>),
    Provider(ProviderRef),
    Thrown(ThrownError),
    Record(Arc<Record>),
    Graph(GraphRef),
    Delayed(Arc<DelayedValue>),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn array(element: ElementType, items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(ArrayValue::new(
            element,
            items.into_iter().collect::<Vec<_>>(),
        ))
    }

    pub fn enum_constant(holder: &str, constant: &str) -> Self {
        Value::Enum(EnumConstant {
            holder: Arc::from(holder),
            constant: Arc::from(constant),
        })
    }

    pub fn record(record: Record) -> Self {
        Value::Record(Arc::new(record))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Byte(_) => ValueKind::Byte,
            Value::Short(_) => ValueKind::Short,
            Value::Int(_) => ValueKind::Int,
            Value::Long(_) => ValueKind::Long,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Doubles(_) => ValueKind::Doubles,
            Value::Enum(_) => ValueKind::Enum,
            Value::Array(_) => ValueKind::Array,
            Value::List(_) => ValueKind::List,
            Value::Provider(_) => ValueKind::Provider,
            Value::Thrown(_) => ValueKind::Thrown,
            Value::Record(r) => ValueKind::Record(r.kind()),
            Value::Graph(_) => ValueKind::Graph,
            Value::Delayed(_) => ValueKind::Delayed,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_provider(&self) -> Option<&ProviderRef> {
        match self {
            Value::Provider(p) => Some(p),
            _ => None,
        }
    }

    /// Replace delayed values, including nested ones, with their final form
    ///
    /// Graph payloads are left alone; graphs never contain delayed values.
    pub fn materialize(&self) -> Value {
        match self {
            Value::Delayed(delayed) => delayed.materialize(),
            Value::Array(array) if array.items.iter().any(Value::needs_materialize) => {
                Value::Array(ArrayValue {
                    element: array.element.clone(),
                    original_element: array.original_element.clone(),
                    items: array.items.iter().map(Value::materialize).collect(),
                })
            }
            Value::List(items) if items.iter().any(Value::needs_materialize) => {
                Value::List(items.iter().map(Value::materialize).collect())
            }
            Value::Record(record) if record.children().into_iter().any(Value::needs_materialize) => {
                match record.rebuild(&mut |v: &Value| Ok::<_, ()>(v.materialize())) {
                    Ok(rebuilt) => Value::record(rebuilt),
                    Err(()) => self.clone(),
                }
            }
            _ => self.clone(),
        }
    }

    fn needs_materialize(&self) -> bool {
        match self {
            Value::Delayed(_) => true,
            Value::Array(array) => array.items.iter().any(Value::needs_materialize),
            Value::List(items) => items.iter().any(Value::needs_materialize),
            Value::Record(record) => record.children().into_iter().any(Value::needs_materialize),
            _ => false,
        }
    }
}

fn doubles_eq(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Byte(a), Value::Byte(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Doubles(a), Value::Doubles(b)) => doubles_eq(a, b),
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Provider(a), Value::Provider(b)) => a == b,
            (Value::Thrown(a), Value::Thrown(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Graph(a), Value::Graph(b)) => a == b,
            (Value::Delayed(a), Value::Delayed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Byte(b) => b.hash(state),
            Value::Short(s) => s.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Long(l) => l.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
            Value::Doubles(d) => {
                d.len().hash(state);
                for x in d.iter() {
                    x.to_bits().hash(state);
                }
            }
            Value::Enum(e) => e.hash(state),
            Value::Array(a) => a.hash(state),
            Value::List(items) => items.hash(state),
            Value::Provider(p) => p.hash(state),
            Value::Thrown(t) => t.hash(state),
            Value::Record(r) => r.hash(state),
            Value::Graph(g) => g.hash(state),
            Value::Delayed(d) => (Arc::as_ptr(d) as usize).hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Byte(b) => write!(f, "{}", b),
            Value::Short(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}L", l),
            Value::Float(x) => write!(f, "{}f", x),
            Value::Double(x) => write!(f, "{}d", x),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "bytes[{}]", b.len()),
            Value::Doubles(d) => write!(f, "double[{}]", d.len()),
            Value::Enum(e) => write!(f, "{}.{}", e.holder, e.constant),
            Value::Array(a) => {
                write!(f, "{}[", a.element.name())?;
                write_joined(f, a.items())?;
                f.write_str("]")
            }
            Value::List(items) => {
                f.write_str("[")?;
                write_joined(f, items)?;
                f.write_str("]")
            }
            Value::Provider(p) => write!(f, "{:?}", p),
            Value::Thrown(t) => write!(f, "throw {}", t),
            Value::Record(r) => write!(f, "{:?}", r.kind()),
            Value::Graph(g) => write!(f, "{:?}", g),
            Value::Delayed(d) => write!(f, "{:?}", d),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::str(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<ProviderRef> for Value {
    fn from(value: ProviderRef) -> Self {
        Value::Provider(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(Value::Float(f32::INFINITY), Value::Float(f32::INFINITY));
        assert_eq!(
            Value::Doubles(Arc::from(vec![f64::NAN, -0.0])),
            Value::Doubles(Arc::from(vec![f64::NAN, -0.0]))
        );
    }

    #[test]
    fn test_hash_agrees_with_eq() {
        let mut set = HashSet::new();
        set.insert(Value::list([Value::Int(1), Value::str("a")]));
        assert!(set.contains(&Value::list([Value::Int(1), Value::str("a")])));
        assert!(!set.contains(&Value::list([Value::Int(1)])));
    }

    #[test]
    fn test_array_equality_ignores_original_element() {
        let narrowed = ArrayValue::rewritten(
            ElementType::named("JavaType"),
            Some(ElementType::named("Object")),
            vec![Value::Null],
        );
        let plain = ArrayValue::new(ElementType::named("JavaType"), vec![Value::Null]);
        assert_eq!(narrowed, plain);
        assert_eq!(narrowed.original_element(), Some(&ElementType::named("Object")));
    }

    #[test]
    fn test_materialize_nested_delayed() {
        let delayed = DelayedValue::new(PendingRecord::TypeProfile {
            null_seen: TriState::True,
            not_recorded: 0.5,
            types: Vec::new(),
        });
        let value = Value::list([Value::Delayed(delayed)]);
        let Value::List(items) = value.materialize() else {
            panic!("expected a list");
        };
        assert_eq!(items[0].kind(), ValueKind::Record(RecordKind::TypeProfile));
    }
}
