//! Error types for replaycomp operations

use std::fmt;

use crate::value::Operation;

/// Result type for replaycomp operations
pub type Result<T> = std::result::Result<T, ReplayCompError>;

/// Error types for the record/replay framework
#[derive(Debug, thiserror::Error)]
pub enum ReplayCompError {
    /// Malformed declarations, ambiguous serializers, missing delegates
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A provider instance reached the proxy boundary without a registration
    #[error("Unregistered provider type {type_name} cannot cross the proxy boundary")]
    UnregisteredProvider {
        /// Runtime type of the offending instance
        type_name: String,
    },

    /// Recorder scopes used outside their contract
    #[error("Scope violation: {0}")]
    ScopeViolation(String),

    /// Replay reached an operation nothing could answer
    #[error("{0}")]
    Divergence(Box<Divergence>),

    /// A serializer could not rebuild a value from its tagged fragment
    #[error("Serializer {serializer} failed to deserialize {fragment}: {message}")]
    Deserialization {
        /// Tag of the responsible serializer
        serializer: String,
        /// The raw structured value
        fragment: String,
        /// What was wrong with it
        message: String,
    },

    /// The trace ends prematurely, usually because the writer crashed
    #[error("Incomplete trace: {0}")]
    TraceIncomplete(String),

    /// The trace is not a well-formed document
    #[error("Corrupt trace: {0}")]
    TraceCorrupt(String),

    /// The trace cannot run on this build or host
    #[error("Incompatible trace: recorded for {found}, running on {expected}")]
    IncompatibleTrace {
        /// Host platform
        expected: String,
        /// Platform stored in the trace
        found: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ReplayCompError {
    /// Build a deserialization failure for the serializer with the given tag
    pub fn deserialization(
        serializer: impl Into<String>,
        fragment: &serde_json::Value,
        message: impl Into<String>,
    ) -> Self {
        ReplayCompError::Deserialization {
            serializer: serializer.into(),
            fragment: fragment.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error means "skip this trace" rather than "alarm"
    pub fn is_incomplete_trace(&self) -> bool {
        matches!(self, ReplayCompError::TraceIncomplete(_))
    }

    /// Whether the error should abort a whole batch of traces
    pub fn is_incompatibility(&self) -> bool {
        matches!(self, ReplayCompError::IncompatibleTrace { .. })
    }
}

impl From<String> for ReplayCompError {
    fn from(s: String) -> Self {
        ReplayCompError::Other(s)
    }
}

impl From<&str> for ReplayCompError {
    fn from(s: &str) -> Self {
        ReplayCompError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ReplayCompError {
    fn from(err: anyhow::Error) -> Self {
        ReplayCompError::Other(err.to_string())
    }
}

/// Diagnostic for an operation replay could not resolve in strict mode
#[derive(Debug, Clone)]
pub struct Divergence {
    /// The unresolved operation
    pub operation: Operation,
    /// Rendering of the proxy receiver
    pub receiver: String,
    /// Rendering of the arguments of the failed call
    pub arguments: Vec<String>,
    /// Rendering of the local mirror, if one was found
    pub local_mirror: Option<String>,
    /// Argument vectors recorded for this operation on this receiver
    pub recorded_keys: Vec<String>,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Replay divergence: no result for {}({}) on {}",
            self.operation,
            self.arguments.join(", "),
            self.receiver
        )?;
        match &self.local_mirror {
            Some(mirror) => writeln!(f, "  local mirror: {}", mirror)?,
            None => writeln!(f, "  local mirror: none")?,
        }
        write!(
            f,
            "  {} recorded key(s) for {}",
            self.recorded_keys.len(),
            self.operation.name()
        )?;
        for key in &self.recorded_keys {
            write!(f, "\n    ({})", key)?;
        }
        Ok(())
    }
}
