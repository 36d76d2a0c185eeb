//! Error taxonomy for the wharf scheduler core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Descriptor errors
    #[error("Invalid pipeline: {0}")]
    Validation(String),

    #[error("Cycle detected in task dependencies at `{0}`")]
    CycleDetected(String),

    #[error("Unknown dependency `{dependency}` of task `{task}`")]
    UnknownDependency { task: String, dependency: String },

    // Dispatch errors
    #[error("No handler registered for resource kind `{0}`")]
    UnsupportedResourceKind(String),

    #[error("Submit failed for `{task}`: {message}")]
    Submit { task: String, message: String },

    #[error("Observation failed for `{task}`: {message}")]
    Observe {
        task: String,
        message: String,
        kind: ObserveFailure,
    },

    #[error("Cleanup failed for `{task}`: {message}")]
    Cleanup { task: String, message: String },

    // Infrastructure errors
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a failed observation should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveFailure {
    /// The call exceeded its deadline; retried with backoff up to a
    /// ceiling, then the task is failed.
    Deadline,
    /// Transient infrastructure trouble; retried without bound.
    Transient,
    /// The cluster answered and the answer was bad.
    Hard,
}

/// Failures from the jobs store, kept separate so the executor can
/// distinguish a dead store (retry next tick) from domain errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No record `{0}` in the jobs store")]
    NotFound(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Record is not decodable: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
