use thiserror::Error;

use crate::value::RemoteError;

/// Failures while mapping values onto classloaders, in either direction.
#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    #[error("class '{class_name}' not found in classloader {loader}")]
    ClassNotFound { class_name: String, loader: String },

    #[error("too many classloaders in one payload (limit is {limit})")]
    TooManyClassLoaders { limit: usize },

    #[error("payload references unknown classloader id {0}")]
    UnknownLoaderId(u16),

    #[error("classloader id 0 may only carry classes of package '{expected}', got '{class_name}'")]
    ReservedLoaderId {
        expected: &'static str,
        class_name: String,
    },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for PayloadError {
    fn from(err: serde_json::Error) -> Self {
        PayloadError::Malformed(err.to_string())
    }
}

/// Everything a caller can observe when dispatching work to a worker.
///
/// Infrastructure failures and user failures both arrive as [`WorkerError::Remote`];
/// use [`RemoteError::is_infrastructure`] to tell them apart.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker connection failed: {0}")]
    Connection(String),

    #[error("{0}")]
    Remote(RemoteError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("failed to start worker: {0}")]
    Start(String),

    #[error("No response received from worker")]
    NoResponse,

    #[error("interrupted while waiting for a worker result")]
    Interrupted,

    #[error("a request must be associated with a build operation")]
    MissingBuildOperation,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            WorkerError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// True when the failure says nothing about the worker's health.
    pub fn is_user_failure(&self) -> bool {
        matches!(self, WorkerError::Remote(err) if !err.is_infrastructure())
    }
}
