//! Error types for the network observability operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Optimistic concurrency conflict on write
    #[error("Conflict while writing {kind}/{name}")]
    Conflict { kind: String, name: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed FlowMetric definition
    #[error("error reading FlowMetric definition '{metric}': {reason}")]
    InvalidMetric { metric: String, reason: String },

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Operation was cancelled through its cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// True for a 404 from the API server or a synthesized [`OperatorError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// True for a 409 from the API server or a synthesized [`OperatorError::Conflict`]
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict { .. } => true,
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            OperatorError::Conflict { .. } => Some(std::time::Duration::from_secs(1)),
            OperatorError::KubeError(_) => Some(std::time::Duration::from_secs(30)),
            _ => None,
        }
    }
}
