//! Error taxonomy shared by every component that touches the job domain.
//!
//! Repository and client failures are expected to be mapped into one of these
//! four variants at the operation boundary; nothing upstream of that boundary
//! should see a raw database or HTTP error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Service(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Stable machine-readable code, mirrored by the HTTP layer's error body.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "harmony.RequestValidationError",
            CoreError::NotFound(_) => "harmony.NotFoundError",
            CoreError::Conflict(_) => "harmony.ConflictError",
            CoreError::Service(_) => "harmony.ServiceError",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
