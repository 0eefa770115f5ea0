//! Runtime error kinds.

use serde::{Deserialize, Serialize};

/// Observable error kinds of the runtime.
///
/// Handler-local errors mark the owning step errored but never crash the
/// evaluator; persistence errors end the iteration.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum RuntimeError {
    /// A facet reference did not resolve against the program.
    #[error("unknown facet: {0}")]
    UnknownFacet(String),

    /// A sibling or input reference did not resolve during initialization.
    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    /// A parameter expression produced a value incompatible with its
    /// declared type.
    #[error("type mismatch for '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A claimed task's facet has no registered handler.
    #[error("no handler registered for facet: {0}")]
    HandlerNotFound(String),

    /// A handler raised.
    #[error("handler error: {0}")]
    Handler(String),

    /// A handler exceeded its configured budget.
    #[error("handler timed out after {0} ms")]
    Timeout(u64),

    /// An artifact-backed handler could not be fetched or resolved.
    #[error("artifact resolution failed: {0}")]
    Resolution(String),

    /// A persistence operation failed after retries.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A stored program document did not decode into the typed tree.
    #[error("invalid program document: {0}")]
    AstDecode(String),

    /// The runner was explicitly cancelled. Not recorded as a step error.
    #[error("runner cancelled")]
    Cancelled,
}

impl RuntimeError {
    /// Whether this error should be recorded on the step that raised it.
    pub fn is_step_error(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = RuntimeError::UnresolvedReference("added.result".to_string());
        assert_eq!(err.to_string(), "unresolved reference: added.result");

        let err = RuntimeError::TypeMismatch {
            name: "value".to_string(),
            expected: "Long".to_string(),
            actual: "String".to_string(),
        };
        assert!(err.to_string().contains("expected Long"));

        let err = RuntimeError::Timeout(500);
        assert!(err.to_string().contains("timed out after 500 ms"));
    }

    #[test]
    fn test_step_error_classification() {
        assert!(RuntimeError::Handler("x".into()).is_step_error());
        assert!(RuntimeError::HandlerNotFound("f".into()).is_step_error());
        assert!(!RuntimeError::Cancelled.is_step_error());
        assert!(!RuntimeError::Persistence("db down".into()).is_step_error());
    }
}
