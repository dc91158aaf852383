//! Error types for the f11r operator

use thiserror::Error;

/// Main error type for operator operations
///
/// Kubernetes API failures are split by status code so controllers can tell a
/// vanished object (404) or a lost optimistic-concurrency race (409) apart from
/// transient infrastructure trouble.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(kube::Error),

    /// The object does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists (HTTP 409 on create)
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object changed since it was read (HTTP 409 on update/patch)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation error for resource specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid operator configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound(resp.message.clone()),
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists(resp.message.clone())
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(resp.message.clone()),
            _ => Self::Kube(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already-exists error with the given message
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True if the object vanished between fetch and act
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True if a create raced another creator
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// True if an optimistic patch lost against a concurrent writer
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
