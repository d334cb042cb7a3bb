//! Closed set of structured records that may appear in operation arguments and results
//!
//! Both the graph mapper and the trace serializers match over these variants.
//! Adding a record means adding a variant here, a case in [`Record::rebuild`]
//! and a serializer; the compiler flags the first two if either is missed.

use std::sync::Arc;

use super::{ExactF64, Value};

/// Discriminant of a [`Record`], used to claim records in the serializer registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    StackFrame,
    UnresolvedType,
    UnresolvedMethod,
    UnresolvedField,
    ExceptionHandler,
    NoFinalizableSubclass,
    ConcreteSubtype,
    LeafType,
    ConcreteMethod,
    AssumptionResult,
    PrimitiveConstant,
    TypeProfile,
    BitSet,
}

impl RecordKind {
    /// Every record kind
    pub const ALL: [RecordKind; 13] = [
        RecordKind::StackFrame,
        RecordKind::UnresolvedType,
        RecordKind::UnresolvedMethod,
        RecordKind::UnresolvedField,
        RecordKind::ExceptionHandler,
        RecordKind::NoFinalizableSubclass,
        RecordKind::ConcreteSubtype,
        RecordKind::LeafType,
        RecordKind::ConcreteMethod,
        RecordKind::AssumptionResult,
        RecordKind::PrimitiveConstant,
        RecordKind::TypeProfile,
        RecordKind::BitSet,
    ];
}

/// A source position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub holder: Arc<str>,
    pub method: Arc<str>,
    pub file: Option<Arc<str>>,
    pub line: i32,
}

/// An exception handler table entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionHandler {
    pub start_bci: i32,
    pub end_bci: i32,
    pub handler_bci: i32,
    pub catch_type_cpi: i32,
    /// The catch type, usually a provider reference or `Null`
    pub catch_type: Value,
}

/// A speculative assumption about the provider environment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Assumption {
    NoFinalizableSubclass {
        receiver: Value,
    },
    ConcreteSubtype {
        context: Value,
        subtype: Value,
    },
    LeafType {
        context: Value,
    },
    ConcreteMethod {
        method: Value,
        context: Value,
        implementation: Value,
    },
}

impl Assumption {
    /// Record kind of this assumption
    pub fn kind(&self) -> RecordKind {
        match self {
            Assumption::NoFinalizableSubclass { .. } => RecordKind::NoFinalizableSubclass,
            Assumption::ConcreteSubtype { .. } => RecordKind::ConcreteSubtype,
            Assumption::LeafType { .. } => RecordKind::LeafType,
            Assumption::ConcreteMethod { .. } => RecordKind::ConcreteMethod,
        }
    }

    fn rebuild<E, F>(&self, f: &mut F) -> Result<Assumption, E>
    where
        F: FnMut(&Value) -> Result<Value, E>,
    {
        Ok(match self {
            Assumption::NoFinalizableSubclass { receiver } => Assumption::NoFinalizableSubclass {
                receiver: f(receiver)?,
            },
            Assumption::ConcreteSubtype { context, subtype } => Assumption::ConcreteSubtype {
                context: f(context)?,
                subtype: f(subtype)?,
            },
            Assumption::LeafType { context } => Assumption::LeafType {
                context: f(context)?,
            },
            Assumption::ConcreteMethod {
                method,
                context,
                implementation,
            } => Assumption::ConcreteMethod {
                method: f(method)?,
                context: f(context)?,
                implementation: f(implementation)?,
            },
        })
    }
}

/// Three-valued flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    pub fn as_str(self) -> &'static str {
        match self {
            TriState::True => "TRUE",
            TriState::False => "FALSE",
            TriState::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRUE" => Some(TriState::True),
            "FALSE" => Some(TriState::False),
            "UNKNOWN" => Some(TriState::Unknown),
            _ => None,
        }
    }
}

/// One entry of a type profile
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfiledType {
    pub ty: Value,
    pub probability: ExactF64,
}

/// Receiver type profile; entries are ordered by descending probability
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeProfile {
    null_seen: TriState,
    not_recorded: ExactF64,
    types: Vec<ProfiledType>,
}

impl TypeProfile {
    /// Build a profile, sorting entries by descending probability
    pub fn new(null_seen: TriState, not_recorded: f64, mut types: Vec<ProfiledType>) -> Self {
        types.sort_by(|a, b| b.probability.get().total_cmp(&a.probability.get()));
        Self {
            null_seen,
            not_recorded: ExactF64(not_recorded),
            types,
        }
    }

    pub fn null_seen(&self) -> TriState {
        self.null_seen
    }

    pub fn not_recorded_probability(&self) -> f64 {
        self.not_recorded.get()
    }

    pub fn types(&self) -> &[ProfiledType] {
        &self.types
    }
}

/// Structured values with a fixed shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Record {
    StackFrame(StackFrame),
    UnresolvedType {
        name: Arc<str>,
    },
    UnresolvedMethod {
        holder: Value,
        name: Arc<str>,
        signature: Arc<str>,
    },
    UnresolvedField {
        holder: Value,
        name: Arc<str>,
        field_type: Value,
    },
    ExceptionHandler(ExceptionHandler),
    Assumption(Assumption),
    AssumptionResult {
        result: Value,
        assumptions: Vec<Assumption>,
    },
    PrimitiveConstant {
        kind: Arc<str>,
        raw: i64,
    },
    TypeProfile(TypeProfile),
    BitSet(Vec<u64>),
}

impl Record {
    /// Discriminant of this record
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::StackFrame(_) => RecordKind::StackFrame,
            Record::UnresolvedType { .. } => RecordKind::UnresolvedType,
            Record::UnresolvedMethod { .. } => RecordKind::UnresolvedMethod,
            Record::UnresolvedField { .. } => RecordKind::UnresolvedField,
            Record::ExceptionHandler(_) => RecordKind::ExceptionHandler,
            Record::Assumption(a) => a.kind(),
            Record::AssumptionResult { .. } => RecordKind::AssumptionResult,
            Record::PrimitiveConstant { .. } => RecordKind::PrimitiveConstant,
            Record::TypeProfile(_) => RecordKind::TypeProfile,
            Record::BitSet(_) => RecordKind::BitSet,
        }
    }

    /// Rebuild this record with every nested value passed through `f`
    pub fn rebuild<E, F>(&self, f: &mut F) -> Result<Record, E>
    where
        F: FnMut(&Value) -> Result<Value, E>,
    {
        Ok(match self {
            Record::StackFrame(_)
            | Record::UnresolvedType { .. }
            | Record::PrimitiveConstant { .. }
            | Record::BitSet(_) => self.clone(),
            Record::UnresolvedMethod {
                holder,
                name,
                signature,
            } => Record::UnresolvedMethod {
                holder: f(holder)?,
                name: Arc::clone(name),
                signature: Arc::clone(signature),
            },
            Record::UnresolvedField {
                holder,
                name,
                field_type,
            } => Record::UnresolvedField {
                holder: f(holder)?,
                name: Arc::clone(name),
                field_type: f(field_type)?,
            },
            Record::ExceptionHandler(handler) => Record::ExceptionHandler(ExceptionHandler {
                catch_type: f(&handler.catch_type)?,
                ..handler.clone()
            }),
            Record::Assumption(assumption) => Record::Assumption(assumption.rebuild(f)?),
            Record::AssumptionResult {
                result,
                assumptions,
            } => Record::AssumptionResult {
                result: f(result)?,
                assumptions: assumptions
                    .iter()
                    .map(|a| a.rebuild(f))
                    .collect::<Result<_, _>>()?,
            },
            Record::TypeProfile(profile) => Record::TypeProfile(TypeProfile {
                null_seen: profile.null_seen,
                not_recorded: profile.not_recorded,
                types: profile
                    .types
                    .iter()
                    .map(|t| {
                        Ok(ProfiledType {
                            ty: f(&t.ty)?,
                            probability: t.probability,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            }),
        })
    }

    /// Nested values, in field order
    pub fn children(&self) -> Vec<&Value> {
        fn assumption_children(a: &Assumption) -> Vec<&Value> {
            match a {
                Assumption::NoFinalizableSubclass { receiver } => vec![receiver],
                Assumption::ConcreteSubtype { context, subtype } => vec![context, subtype],
                Assumption::LeafType { context } => vec![context],
                Assumption::ConcreteMethod {
                    method,
                    context,
                    implementation,
                } => vec![method, context, implementation],
            }
        }

        match self {
            Record::StackFrame(_)
            | Record::UnresolvedType { .. }
            | Record::PrimitiveConstant { .. }
            | Record::BitSet(_) => Vec::new(),
            Record::UnresolvedMethod { holder, .. } => vec![holder],
            Record::UnresolvedField {
                holder, field_type, ..
            } => vec![holder, field_type],
            Record::ExceptionHandler(handler) => vec![&handler.catch_type],
            Record::Assumption(a) => assumption_children(a),
            Record::AssumptionResult {
                result,
                assumptions,
            } => std::iter::once(result)
                .chain(assumptions.iter().flat_map(assumption_children))
                .collect(),
            Record::TypeProfile(profile) => profile.types.iter().map(|t| &t.ty).collect(),
        }
    }
}
