//! Error types for cluster control-plane calls.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Cluster call timed out: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Undecodable cluster response: {0}")]
    Decode(String),
}

impl ClusterError {
    /// Transient failures are retried by the caller with backoff;
    /// everything else is surfaced immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Timeout(_) | ClusterError::Transport(_) => true,
            ClusterError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// A deadline expiry, distinct from other transient trouble: the
    /// executor retries it only up to its configured ceiling.
    pub fn is_deadline(&self) -> bool {
        matches!(self, ClusterError::Timeout(_))
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClusterError::Timeout(err.to_string())
        } else if err.is_decode() {
            ClusterError::Decode(err.to_string())
        } else {
            ClusterError::Transport(err.to_string())
        }
    }
}

impl From<ClusterError> for wharf_core::Error {
    fn from(err: ClusterError) -> Self {
        wharf_core::Error::Cluster(err.to_string())
    }
}
