use thiserror::Error;

/// Error type for the Villa service binary, aggregating errors from the
/// component crates.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("nickname error: {0}")]
    Claim(#[from] villa_profile::ClaimError),

    #[error("app error: {0}")]
    App(#[from] villa_apps::AppError),

    #[error("handshake error: {0}")]
    Handshake(#[from] villa_handshake::HandshakeError),

    #[error("storage error: {0}")]
    Storage(#[from] villa_core::VillaError),

    /// Services were used before `initialize` or after `shutdown`.
    #[error("services not initialized")]
    NotInitialized,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

pub type RootResult<T> = Result<T, RootError>;
