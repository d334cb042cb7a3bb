//! Recorded outcomes that are not plain values
//!
//! A recorded operation result is never absent: it is a return value, a
//! recorded null, or a recorded exception. `NoResult` only exists as the
//! answer to "was anything recorded for this key yet".

use crate::value::{ThrownError, Value};

/// Marker for an outcome that is not an ordinary return value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecialResult {
    /// Nothing recorded for the key
    NoResult,
    /// The operation returned null
    Null,
    /// The operation raised an exception
    Thrown(ThrownError),
}

/// A recorded outcome or the absence of one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResultOrMarker {
    Value(Value),
    Marker(SpecialResult),
}

impl ResultOrMarker {
    /// Nothing recorded
    pub const NO_RESULT: ResultOrMarker = ResultOrMarker::Marker(SpecialResult::NoResult);

    /// Wrap a returned value, turning null into the null marker
    pub fn from_return(value: Value) -> Self {
        match value {
            Value::Null => ResultOrMarker::Marker(SpecialResult::Null),
            other => ResultOrMarker::Value(other),
        }
    }

    pub fn from_thrown(error: ThrownError) -> Self {
        ResultOrMarker::Marker(SpecialResult::Thrown(error))
    }

    pub fn from_outcome(outcome: Result<Value, ThrownError>) -> Self {
        match outcome {
            Ok(value) => Self::from_return(value),
            Err(error) => Self::from_thrown(error),
        }
    }

    pub fn is_no_result(&self) -> bool {
        matches!(self, ResultOrMarker::Marker(SpecialResult::NoResult))
    }

    /// The outcome to hand back to a caller; `None` when nothing was recorded
    pub fn to_outcome(&self) -> Option<Result<Value, ThrownError>> {
        match self {
            ResultOrMarker::Value(value) => Some(Ok(value.clone())),
            ResultOrMarker::Marker(SpecialResult::Null) => Some(Ok(Value::Null)),
            ResultOrMarker::Marker(SpecialResult::Thrown(error)) => Some(Err(error.clone())),
            ResultOrMarker::Marker(SpecialResult::NoResult) => None,
        }
    }

    /// Apply `f` to the carried value or exception
    pub fn try_map<E, F>(&self, mut f: F) -> Result<Self, E>
    where
        F: FnMut(&Value) -> Result<Value, E>,
    {
        Ok(match self {
            ResultOrMarker::Value(value) => ResultOrMarker::Value(f(value)?),
            ResultOrMarker::Marker(SpecialResult::Thrown(error)) => {
                match f(&Value::Thrown(error.clone()))? {
                    Value::Thrown(mapped) => ResultOrMarker::from_thrown(mapped),
                    _ => self.clone(),
                }
            }
            ResultOrMarker::Marker(_) => self.clone(),
        })
    }
}

impl From<Result<Value, ThrownError>> for ResultOrMarker {
    fn from(outcome: Result<Value, ThrownError>) -> Self {
        Self::from_outcome(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_becomes_marker() {
        let recorded = ResultOrMarker::from_return(Value::Null);
        assert_eq!(recorded, ResultOrMarker::Marker(SpecialResult::Null));
        assert_eq!(recorded.to_outcome(), Some(Ok(Value::Null)));
    }

    #[test]
    fn test_no_result_has_no_outcome() {
        assert!(ResultOrMarker::NO_RESULT.is_no_result());
        assert_eq!(ResultOrMarker::NO_RESULT.to_outcome(), None);
    }

    #[test]
    fn test_thrown_round_trips_through_outcome() {
        let error = ThrownError::new("IllegalStateException", Some("boom"));
        let recorded = ResultOrMarker::from_outcome(Err(error.clone()));
        assert_eq!(recorded.to_outcome(), Some(Err(error)));
    }
}
