use thiserror::Error;

use crate::responder::ResponderState;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("cannot {action} from state {from}")]
    InvalidTransition {
        from: ResponderState,
        action: &'static str,
    },

    #[error("message port error: {0}")]
    Port(String),

    #[error("unrecognized handshake message: {0}")]
    Wire(String),

    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("invalid responder parameters: {0}")]
    InvalidParams(String),

    #[error("origin lookup failed: {0}")]
    Lookup(String),
}

impl From<serde_json::Error> for HandshakeError {
    fn from(e: serde_json::Error) -> Self {
        HandshakeError::Wire(e.to_string())
    }
}

pub type HandshakeResult<T> = Result<T, HandshakeError>;
