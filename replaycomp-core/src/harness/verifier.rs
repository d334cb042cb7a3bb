//! Consumers of loaded units

use tracing::debug;

use super::LoadedUnit;
use crate::declarations::{IdentityOperation, MethodStrategy, is_identity};
use crate::error::{ReplayCompError, Result};
use crate::value::{ThrownError, Value};

/// Runs the consumer against a loaded unit
pub trait UnitReplayer {
    /// Replay `unit`, returning the artifact it produced when there is one
    fn replay(&self, unit: &LoadedUnit) -> Result<Option<String>>;
}

/// Re-issues every recorded call through its replay proxy and checks the
/// proxy answers with the recorded outcome
///
/// Calls answered from object identity (`equals`, `hashCode`) and calls
/// whose strategy never records are skipped. Produces no artifact.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceVerifier;

impl UnitReplayer for TraceVerifier {
    fn replay(&self, loaded: &LoadedUnit) -> Result<Option<String>> {
        let mut verified = 0usize;
        for recorded in &loaded.unit.operations {
            let Some(proxy) = recorded.receiver.as_proxy() else {
                return Err(ReplayCompError::Other(format!(
                    "receiver of {} is not a replay proxy",
                    recorded.operation
                )));
            };
            if !matches!(
                proxy.registration().find_strategy(&recorded.operation),
                MethodStrategy::RecordReplay | MethodStrategy::Special
            ) {
                continue;
            }
            if matches!(
                is_identity(&recorded.operation),
                Some(IdentityOperation::Equals | IdentityOperation::HashCode)
            ) {
                continue;
            }
            let Some(expected) = recorded.result.to_outcome() else {
                continue;
            };
            let actual = recorded.receiver.invoke(&recorded.operation, &recorded.args);
            if !same_outcome(&expected, &actual) {
                return Err(ReplayCompError::Other(format!(
                    "{} on {:?} replayed {} but {} was recorded",
                    recorded.operation,
                    recorded.receiver,
                    describe(&actual),
                    describe(&expected)
                )));
            }
            verified += 1;
        }
        debug!(path = %loaded.path.display(), verified, "Verified recorded operations");
        Ok(None)
    }
}

fn same_outcome(
    expected: &std::result::Result<Value, ThrownError>,
    actual: &std::result::Result<Value, ThrownError>,
) -> bool {
    match (expected, actual) {
        (Ok(expected), Ok(actual)) => expected.materialize() == actual.materialize(),
        (Err(expected), Err(actual)) => expected == actual,
        _ => false,
    }
}

fn describe(outcome: &std::result::Result<Value, ThrownError>) -> String {
    match outcome {
        Ok(value) => value.to_string(),
        Err(error) => match error.framework_cause() {
            Some(cause) => format!("framework error ({})", cause),
            None => format!("exception {}", error.class()),
        },
    }
}

