use relay_core::{DefinitionError, ExprError};

/// Errors surfaced to callers of routing, management, and send paths.
///
/// Evaluation and lookup failures affect message correctness and are always
/// propagated; interceptor failures never appear here.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("operator `{operator}` already exists in routing `{routing}`")]
    DuplicateOperator { routing: String, operator: String },
    #[error("operator `{operator}` failed: {source}")]
    OperatorEvaluation {
        operator: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("routing `{name}` not found")]
    PipelineNotFound { name: String },
    #[error("operator `{name}` not found")]
    OperatorNotFound { name: String },
    #[error("invalid operator `{name}`: {reason}")]
    InvalidOperator { name: String, reason: String },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("delivery to `{target}` failed: {source}")]
    Delivery {
        target: String,
        #[source]
        source: anyhow::Error,
    },    #[error("send aborted: {reason}")]
    SendAborted { reason: String },
}

impl RoutingError {
    pub(crate) fn invalid_expression(name: &str, err: &ExprError) -> Self {
        RoutingError::InvalidOperator {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Failure of a blocking or awaited accessor on a [`Promise`](crate::client::Promise).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError<E> {
    #[error("delivery timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("delivery failed: {0}")]
    Failed(E),
}

/// Why an interceptor's contribution was discarded. Logged, never returned.
#[derive(Debug, thiserror::Error)]
pub(crate) enum InterceptorFailure {
    #[error("{0:#}")]
    Error(anyhow::Error),
    #[error("panicked: {0}")]
    Panic(String),
}
