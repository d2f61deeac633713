//! postMessage payloads. Each logical event has a namespaced form
//! (`VILLA_*`) and a legacy form (`AUTH_*`); both are sent and both are
//! accepted.

use serde::{Deserialize, Serialize};

use crate::error::{HandshakeError, HandshakeResult};
use crate::event::{HandshakeEvent, Identity};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessPayload {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "VILLA_READY")]
    VillaReady,
    #[serde(rename = "VILLA_AUTH_SUCCESS")]
    VillaAuthSuccess { payload: SuccessPayload },
    #[serde(rename = "VILLA_AUTH_ERROR")]
    VillaAuthError { payload: ErrorPayload },
    #[serde(rename = "VILLA_AUTH_CANCEL")]
    VillaAuthCancel,

    #[serde(rename = "AUTH_READY")]
    AuthReady,
    #[serde(rename = "AUTH_SUCCESS")]
    AuthSuccess { identity: Identity },
    #[serde(rename = "AUTH_ERROR")]
    AuthError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename = "AUTH_CLOSE", alias = "AUTH_CANCEL")]
    AuthClose,
}

impl WireMessage {
    pub fn is_legacy(&self) -> bool {
        matches!(
            self,
            WireMessage::AuthReady
                | WireMessage::AuthSuccess { .. }
                | WireMessage::AuthError { .. }
                | WireMessage::AuthClose
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::VillaReady => "VILLA_READY",
            WireMessage::VillaAuthSuccess { .. } => "VILLA_AUTH_SUCCESS",
            WireMessage::VillaAuthError { .. } => "VILLA_AUTH_ERROR",
            WireMessage::VillaAuthCancel => "VILLA_AUTH_CANCEL",
            WireMessage::AuthReady => "AUTH_READY",
            WireMessage::AuthSuccess { .. } => "AUTH_SUCCESS",
            WireMessage::AuthError { .. } => "AUTH_ERROR",
            WireMessage::AuthClose => "AUTH_CLOSE",
        }
    }

    pub fn into_event(self) -> HandshakeEvent {
        match self {
            WireMessage::VillaReady | WireMessage::AuthReady => HandshakeEvent::Ready,
            WireMessage::VillaAuthSuccess { payload } => HandshakeEvent::Success(payload.identity),
            WireMessage::AuthSuccess { identity } => HandshakeEvent::Success(identity),
            WireMessage::VillaAuthError { payload } => HandshakeEvent::Error {
                message: payload.error,
                code: payload.code,
            },
            WireMessage::AuthError { error, code } => HandshakeEvent::Error {
                message: error,
                code,
            },
            WireMessage::VillaAuthCancel | WireMessage::AuthClose => HandshakeEvent::Cancel,
        }
    }

    /// Parse message data received from a `message` event.
    pub fn from_value(value: &serde_json::Value) -> HandshakeResult<Self> {
        match value.get("type").and_then(|t| t.as_str()) {
            Some(_) => Ok(serde_json::from_value(value.clone())?),
            None => Err(HandshakeError::Wire("missing type".into())),
        }
    }

    pub fn to_value(&self) -> HandshakeResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Both external spellings of `event`, namespaced first.
pub fn encode(event: &HandshakeEvent) -> [WireMessage; 2] {
    match event {
        HandshakeEvent::Ready => [WireMessage::VillaReady, WireMessage::AuthReady],
        HandshakeEvent::Success(identity) => [
            WireMessage::VillaAuthSuccess {
                payload: SuccessPayload {
                    identity: identity.clone(),
                },
            },
            WireMessage::AuthSuccess {
                identity: identity.clone(),
            },
        ],
        HandshakeEvent::Error { message, code } => [
            WireMessage::VillaAuthError {
                payload: ErrorPayload {
                    error: message.clone(),
                    code: code.clone(),
                },
            },
            WireMessage::AuthError {
                error: message.clone(),
                code: None,
            },
        ],
        HandshakeEvent::Cancel => [WireMessage::VillaAuthCancel, WireMessage::AuthClose],
    }
}
