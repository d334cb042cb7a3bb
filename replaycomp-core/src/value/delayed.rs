//! Values whose reconstruction is postponed until first use

use std::fmt;
use std::sync::{Arc, OnceLock};

use super::record::{ProfiledType, Record, TriState, TypeProfile};
use super::{ExactF64, Value};

/// The already-resolved parts of a record that is not built yet
#[derive(Debug, Clone)]
pub enum PendingRecord {
    /// Type profile entries; ordering them compares the profiled types, so
    /// the profile is only assembled when someone actually reads it
    TypeProfile {
        null_seen: TriState,
        not_recorded: f64,
        types: Vec<(Value, f64)>,
    },
}

/// A lazily materialized record
pub struct DelayedValue {
    pending: PendingRecord,
    materialized: OnceLock<Value>,
}

impl DelayedValue {
    pub fn new(pending: PendingRecord) -> Arc<Self> {
        Arc::new(Self {
            pending,
            materialized: OnceLock::new(),
        })
    }

    pub fn pending(&self) -> &PendingRecord {
        &self.pending
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized.get().is_some()
    }

    /// Build the final value; later calls return the same value
    pub fn materialize(&self) -> Value {
        self.materialized
            .get_or_init(|| match &self.pending {
                PendingRecord::TypeProfile {
                    null_seen,
                    not_recorded,
                    types,
                } => {
                    let types = types
                        .iter()
                        .map(|(ty, probability)| ProfiledType {
                            ty: ty.materialize(),
                            probability: ExactF64(*probability),
                        })
                        .collect();
                    Value::Record(Arc::new(Record::TypeProfile(TypeProfile::new(
                        *null_seen,
                        *not_recorded,
                        types,
                    ))))
                }
            })
            .clone()
    }
}

impl fmt::Debug for DelayedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedValue")
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_once() {
        let delayed = DelayedValue::new(PendingRecord::TypeProfile {
            null_seen: TriState::Unknown,
            not_recorded: 0.0,
            types: vec![(Value::str("A"), 0.25), (Value::str("B"), 0.75)],
        });
        assert!(!delayed.is_materialized());

        let first = delayed.materialize();
        assert!(delayed.is_materialized());
        assert_eq!(first, delayed.materialize());

        let Value::Record(record) = first else {
            panic!("expected a record");
        };
        let Record::TypeProfile(profile) = &*record else {
            panic!("expected a type profile");
        };
        assert_eq!(profile.types()[0].ty, Value::str("B"));
    }
}
