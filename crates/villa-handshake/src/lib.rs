//! Villa auth handshake
//!
//! The postMessage protocol between a consuming page (the initiator) and the
//! Villa identity page opened in an iframe or popup (the responder).
//!
//! Internally there is one event type, `HandshakeEvent`. The `wire` module
//! is the only place that knows both external spellings (`VILLA_*` and the
//! legacy `AUTH_*`); the responder emits both and the initiator folds the
//! pair back into one event.
//!
//! The responder only ever posts to an `AllowedOrigin` resolved from the
//! allowlists. If none resolves it posts nothing.

pub mod error;
pub mod event;
pub mod initiator;
pub mod params;
pub mod resolver;
pub mod responder;
pub mod settings;
pub mod wire;

pub use error::{HandshakeError, HandshakeResult};
pub use event::{HandshakeEvent, Identity, IdentityAvatar};
pub use initiator::{Dispatch, HandshakeHandler, IgnoreReason, Initiator, Surface};
pub use params::{ResponderParams, TransportMode};
pub use resolver::{
    OriginResolver, OriginSource, RegisteredOrigins, ResolveInput, Resolution, StaticOrigins,
};
pub use responder::{AuthOutcome, Delivery, MessagePort, Responder, ResponderState};
pub use settings::ResponderSettings;
pub use wire::WireMessage;
