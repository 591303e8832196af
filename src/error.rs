//! Domain error taxonomy shared by the coordinators.
//!
//! HTTP mapping lives in `api::error`; this module stays transport agnostic.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed input. Surfaced immediately and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid step value {0}, expected 1, 2 or 3")]
    InvalidStep(i64),

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("recording is empty")]
    EmptyPayload,

    #[error("{field}: {message}")]
    Field { field: String, message: String },
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("an account with this email already exists")]
    DuplicateEmail,

    /// Unknown email and wrong password are deliberately indistinguishable.
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("invalid or expired code")]
    InvalidCode,

    #[error("identification attempt already resolved with a different outcome")]
    AlreadyResolved,

    #[error("identification attempt result already consumed")]
    AlreadyConsumed,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not logged in")]
    Unauthorized,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),

    #[error("matching job unavailable: {0}")]
    JobUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::field(field, message))
    }
}

impl From<argon2::password_hash::Error> for Error {
    fn from(err: argon2::password_hash::Error) -> Self {
        Self::Internal(format!("hashing failed: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}
