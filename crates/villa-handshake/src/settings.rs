use std::sync::Arc;
use std::time::Duration;
use url::Url;
use villa_core::AllowedOrigin;

use crate::error::{HandshakeError, HandshakeResult};
use crate::params::{ResponderParams, TransportMode};
use crate::responder::{MessagePort, Responder};

/// Where the responder page lives and how it behaves once a handshake ends.
///
/// Both ends read from this: initiators build their launch URL from
/// `base_url`, and responders are created with `popup_close_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponderSettings {
    base_url: String,
    origin: AllowedOrigin,
    popup_close_delay: Duration,
}

impl ResponderSettings {
    pub fn new(base_url: &str, popup_close_delay: Duration) -> HandshakeResult<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| HandshakeError::InvalidParams(format!("responder url: {}", e)))?;
        let origin = AllowedOrigin::from_url(parsed.as_str()).ok_or_else(|| {
            HandshakeError::InvalidOrigin(format!("responder url {} has no valid origin", base_url))
        })?;
        Ok(Self {
            base_url: base_url.to_string(),
            origin,
            popup_close_delay,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Origin the initiator must see on every accepted message.
    pub fn responder_origin(&self) -> &AllowedOrigin {
        &self.origin
    }

    pub fn popup_close_delay(&self) -> Duration {
        self.popup_close_delay
    }

    /// How long the responder waits before closing itself. Iframes never close.
    pub fn close_delay(&self, mode: TransportMode) -> Option<Duration> {
        match mode {
            TransportMode::Popup => Some(self.popup_close_delay),
            TransportMode::Iframe => None,
        }
    }

    pub fn launch_url(&self, params: &ResponderParams) -> HandshakeResult<Url> {
        params.apply_to(&self.base_url)
    }

    pub fn responder(
        &self,
        port: Arc<dyn MessagePort>,
        mode: TransportMode,
        target: Option<AllowedOrigin>,
    ) -> Responder {
        Responder::new(port, mode, target, self.popup_close_delay)
    }
}
