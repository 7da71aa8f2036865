//! Error types.

use thiserror::Error;

/// Errors that can occur during registry and task store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflict with an existing record.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rejected input.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Version mismatch (optimistic concurrency control).
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: i64, actual: i64 },

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Failures talking to an external service.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// Connection refused, DNS, TLS and other transport-level failures.
    #[error(
        "could not contact {service} API, check the service configuration: {message}"
    )]
    Unavailable { service: String, message: String },

    /// A status code >= 400 that the caller did not allow.
    #[error("{service} responded with HTTP {code}: {text}")]
    Api {
        service: String,
        code: u16,
        text: String,
    },

    /// A non-empty body that is not JSON.
    #[error("{service} response malformed: {text}")]
    MalformedResponse { service: String, text: String },
}

impl ServiceError {
    /// HTTP status code, if the service answered.
    pub fn code(&self) -> Option<u16> {
        match self {
            ServiceError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Crate-level error. Anything a worker does not convert into a deferral ends up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The provisioning state machine did not reach its target within the polling budget.
    #[error("node {node} timed out updating its provision state to {state}")]
    ProvisionTimeout { node: String, state: String },

    /// The provisioning service refused the requested transition.
    #[error("node {node} cannot transition to {state}")]
    InvalidStateTransition { node: String, state: String },

    /// A property the worker requires is absent.
    #[error("missing required property '{0}'")]
    MissingProperty(String),

    /// A property failed schema validation.
    #[error("invalid property '{field}': {reason}")]
    InvalidProperty { field: String, reason: String },

    /// The external service is in a state the worker cannot reason about.
    #[error("external service is in a bad state: {0}")]
    Inconsistent(String),

    /// Worker registration or selection is wrong.
    #[error("configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Contract violations need an operator or a desired-state change, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::MissingProperty(_) | Error::InvalidProperty { .. } | Error::Configuration(_)
        )
    }

    /// HTTP status code of the underlying service failure, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Service(e) => e.code(),
            _ => None,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, Error>;
