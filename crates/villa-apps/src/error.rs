use thiserror::Error;
use villa_core::{OriginListCheck, VillaError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Invalid(String),

    /// The allowlist failed validation; carries the structured check so the
    /// offending value can be echoed back.
    #[error("invalid origins: {}", .0.reason.as_deref().unwrap_or("rejected"))]
    InvalidOrigins(OriginListCheck),

    #[error("malformed app id")]
    MalformedAppId,

    #[error("malformed API key")]
    MalformedApiKey,

    /// Unknown app or wrong key. The two are not distinguished.
    #[error("unauthorized")]
    Unauthorized,

    #[error("could not allocate unique credentials")]
    CredentialCollision,

    #[error(transparent)]
    Storage(VillaError),
}

impl From<VillaError> for AppError {
    fn from(e: VillaError) -> Self {
        match e {
            VillaError::Validation(msg) => AppError::Invalid(msg),
            other => AppError::Storage(other),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
