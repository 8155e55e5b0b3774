//! Engine error type and its failure classification.

use orchestrion_types::error::{RepositoryError, TransitionError};

use crate::expression::ExpressionError;

/// How a failure is handled, independent of where it was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or incompatible input. Rejected immediately, never retried.
    Definition,
    /// Expression failures, recorded on the enclosing activity.
    Evaluation,
    /// Handler or store failures that may succeed on another attempt.
    Transient,
    /// Retries exhausted; surfaces as an incident.
    Terminal,
    /// Somebody else owns the entity now. Never fatal to the loser.
    Concurrency,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("repository error: {0}")]
    Repository(RepositoryError),

    #[error("execution failed: {message}")]
    Execution {
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("no handler registered for {0}")]
    NoHandler(String),

    #[error("no outgoing flow of gateway '{gateway}' matched and no default flow is set")]
    NoMatchingFlow { gateway: String },

    #[error("lock not held: {0}")]
    Lock(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            cause: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Definition(_) | Self::NotFound { .. } | Self::InvalidState(_) | Self::NoHandler(_) => {
                ErrorClass::Definition
            }
            Self::Expression(_) | Self::NoMatchingFlow { .. } => ErrorClass::Evaluation,
            Self::Repository(_) | Self::Execution { .. } => ErrorClass::Transient,
            Self::Conflict(_) | Self::Lock(_) => ErrorClass::Concurrency,
        }
    }
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Conflict(message) => Self::Conflict(message),
            other => Self::Repository(other),
        }
    }
}

impl From<TransitionError> for EngineError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidState(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_conflict_becomes_concurrency_error() {
        let err: EngineError = RepositoryError::Conflict("process 1 revision 3".into()).into();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(err.class(), ErrorClass::Concurrency);

        let err: EngineError = RepositoryError::Query("disk".into()).into();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn gateway_failures_are_evaluation_errors() {
        let err = EngineError::NoMatchingFlow {
            gateway: "route".into(),
        };
        assert_eq!(err.class(), ErrorClass::Evaluation);
        assert!(err.to_string().contains("route"));
    }

    #[test]
    fn transition_error_is_invalid_state() {
        let err: EngineError = TransitionError {
            entity: "process",
            from: "completed".into(),
            to: "running".into(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::Definition);
        assert!(err.to_string().contains("completed -> running"));
    }
}
