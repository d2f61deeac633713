use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use villa_core::AllowedOrigin;

use crate::error::{HandshakeError, HandshakeResult};
use crate::event::{HandshakeEvent, Identity};
use crate::params::TransportMode;
use crate::wire::{encode, WireMessage};

pub const DEFAULT_POPUP_CLOSE_DELAY: Duration = Duration::from_millis(500);

/// The window the responder posts into. `target` is always a concrete,
/// validated origin.
pub trait MessagePort: Send + Sync {
    fn post(&self, message: &WireMessage, target: &AllowedOrigin) -> HandshakeResult<()>;

    /// Close the responder's own window (popup mode).
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Ready,
    Authenticating,
    Success,
    Cancelled,
    Error,
}

impl ResponderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResponderState::Success | ResponderState::Cancelled | ResponderState::Error
        )
    }
}

impl fmt::Display for ResponderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponderState::Idle => "idle",
            ResponderState::Ready => "ready",
            ResponderState::Authenticating => "authenticating",
            ResponderState::Success => "success",
            ResponderState::Cancelled => "cancelled",
            ResponderState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Result of the delegated passkey step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Success(Identity),
    Cancelled,
    Failed {
        message: String,
        code: Option<String>,
    },
}

/// Whether an event actually left the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Number of wire messages posted (namespaced + legacy).
    Posted(usize),
    /// No trusted target origin; nothing was sent.
    Suppressed,
}

/// Identity-page side of one handshake. Not reusable: once terminal, a new
/// handshake needs a new `Responder`.
pub struct Responder {
    state: ResponderState,
    mode: TransportMode,
    target: Option<AllowedOrigin>,
    port: Arc<dyn MessagePort>,
    close_delay: Duration,
}

impl Responder {
    pub fn new(
        port: Arc<dyn MessagePort>,
        mode: TransportMode,
        target: Option<AllowedOrigin>,
        close_delay: Duration,
    ) -> Self {
        Self {
            state: ResponderState::Idle,
            mode,
            target,
            port,
            close_delay,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn target(&self) -> Option<&AllowedOrigin> {
        self.target.as_ref()
    }

    fn emit(&self, event: &HandshakeEvent) -> HandshakeResult<Delivery> {
        let Some(target) = &self.target else {
            tracing::warn!(
                event = event.kind(),
                state = %self.state,
                "no trusted target origin, message not sent"
            );
            return Ok(Delivery::Suppressed);
        };
        let messages = encode(event);
        for message in &messages {
            self.port.post(message, target)?;
        }
        tracing::debug!(event = event.kind(), target = %target, "handshake message posted");
        Ok(Delivery::Posted(messages.len()))
    }

    /// idle -> ready. Announces the channel to the initiator.
    pub fn mount(&mut self) -> HandshakeResult<Delivery> {
        if self.state != ResponderState::Idle {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                action: "mount",
            });
        }
        self.state = ResponderState::Ready;
        self.emit(&HandshakeEvent::Ready)
    }

    /// ready -> authenticating, when the passkey step starts.
    pub fn begin_authentication(&mut self) -> HandshakeResult<()> {
        if self.state != ResponderState::Ready {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                action: "begin authentication",
            });
        }
        self.state = ResponderState::Authenticating;
        Ok(())
    }

    /// Move to the terminal state for `outcome` and post exactly one terminal
    /// event. Cancelling is also allowed straight from ready.
    ///
    /// In popup mode the window closes `close_delay` after posting.
    pub async fn complete(&mut self, outcome: AuthOutcome) -> HandshakeResult<Delivery> {
        let allowed = match (&outcome, self.state) {
            (_, ResponderState::Authenticating) => true,
            (AuthOutcome::Cancelled, ResponderState::Ready) => true,
            _ => false,
        };
        if !allowed {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                action: "complete",
            });
        }

        let (next, event) = match outcome {
            AuthOutcome::Success(identity) => {
                (ResponderState::Success, HandshakeEvent::Success(identity))
            }
            AuthOutcome::Cancelled => (ResponderState::Cancelled, HandshakeEvent::Cancel),
            AuthOutcome::Failed { message, code } => {
                (ResponderState::Error, HandshakeEvent::Error { message, code })
            }
        };
        self.state = next;
        let delivery = self.emit(&event)?;
        tracing::info!(state = %self.state, mode = ?self.mode, "handshake finished");

        if self.mode == TransportMode::Popup {
            tokio::time::sleep(self.close_delay).await;
            self.port.close();
        }
        Ok(delivery)
    }
}
