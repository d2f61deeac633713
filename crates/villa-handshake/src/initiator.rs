use url::Url;
use villa_core::{normalize_origin, AllowedOrigin};

use crate::error::{HandshakeError, HandshakeResult};
use crate::event::{HandshakeEvent, Identity};
use crate::params::ResponderParams;
use crate::wire::WireMessage;

/// Caller callbacks. Only `on_success` is required.
pub trait HandshakeHandler {
    fn on_ready(&mut self) {}
    fn on_success(&mut self, identity: Identity);
    fn on_error(&mut self, _message: &str, _code: Option<&str>) {}
    fn on_cancel(&mut self) {}
}

/// The iframe overlay or popup window hosting the responder.
pub trait Surface {
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    ForeignOrigin,
    Unrecognized,
    Duplicate,
    AfterTerminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Delivered(&'static str),
    Ignored(IgnoreReason),
}

/// Consuming-page side of one handshake.
///
/// Validates `event.origin` against the responder origin before looking at
/// the payload, folds the namespaced/legacy pair into one callback, and
/// closes the surface on the first terminal event. There is no timeout; the
/// caller owns that.
pub struct Initiator<H: HandshakeHandler, S: Surface> {
    responder_origin: AllowedOrigin,
    handler: H,
    surface: S,
    ready_seen: bool,
    finished: bool,
}

impl<H: HandshakeHandler, S: Surface> Initiator<H, S> {
    pub fn new(responder_origin: AllowedOrigin, handler: H, surface: S) -> Self {
        Self {
            responder_origin,
            handler,
            surface,
            ready_seen: false,
            finished: false,
        }
    }

    /// URL to load into the surface. The responder origin is taken from it.
    pub fn responder_url(base: &str, params: &ResponderParams) -> HandshakeResult<(Url, AllowedOrigin)> {
        let url = params.apply_to(base)?;
        let origin = AllowedOrigin::from_url(url.as_str()).ok_or_else(|| {
            HandshakeError::InvalidOrigin(format!("responder url {} has no valid origin", base))
        })?;
        Ok((url, origin))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Handle one `message` event.
    pub fn handle_message(&mut self, origin: &str, data: &serde_json::Value) -> Dispatch {
        if normalize_origin(origin) != self.responder_origin.as_str() {
            tracing::debug!(origin = %origin, "ignoring message from foreign origin");
            return Dispatch::Ignored(IgnoreReason::ForeignOrigin);
        }
        if self.finished {
            return Dispatch::Ignored(IgnoreReason::AfterTerminal);
        }
        let event = match WireMessage::from_value(data) {
            Ok(message) => message.into_event(),
            Err(_) => return Dispatch::Ignored(IgnoreReason::Unrecognized),
        };

        let kind = event.kind();
        match event {
            HandshakeEvent::Ready => {
                if self.ready_seen {
                    return Dispatch::Ignored(IgnoreReason::Duplicate);
                }
                self.ready_seen = true;
                self.handler.on_ready();
            }
            HandshakeEvent::Success(identity) => {
                self.finish();
                self.handler.on_success(identity);
            }
            HandshakeEvent::Error { message, code } => {
                self.finish();
                self.handler.on_error(&message, code.as_deref());
            }
            HandshakeEvent::Cancel => {
                self.finish();
                self.handler.on_cancel();
            }
        }
        Dispatch::Delivered(kind)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.surface.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TransportMode;
    use crate::wire::encode;
    use serde_json::json;
    use villa_core::Address;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl HandshakeHandler for Recorder {
        fn on_ready(&mut self) {
            self.calls.push("ready".into());
        }
        fn on_success(&mut self, identity: Identity) {
            self.calls.push(format!("success:{}", identity.nickname));
        }
        fn on_error(&mut self, message: &str, code: Option<&str>) {
            self.calls.push(format!("error:{}:{}", message, code.unwrap_or("-")));
        }
        fn on_cancel(&mut self) {
            self.calls.push("cancel".into());
        }
    }

    #[derive(Default)]
    struct Overlay {
        closed: usize,
    }

    impl Surface for Overlay {
        fn close(&mut self) {
            self.closed += 1;
        }
    }

    const VILLA: &str = "https://villa.cash";

    fn initiator() -> Initiator<Recorder, Overlay> {
        Initiator::new(
            AllowedOrigin::parse(VILLA).unwrap(),
            Recorder::default(),
            Overlay::default(),
        )
    }

    fn send_pair(i: &mut Initiator<Recorder, Overlay>, event: &HandshakeEvent) -> Vec<Dispatch> {
        encode(event)
            .iter()
            .map(|m| i.handle_message(VILLA, &m.to_value().unwrap()))
            .collect()
    }

    fn identity() -> Identity {
        Identity {
            address: Address::parse("0x00000000000000000000000000000000000000a1").unwrap(),
            nickname: "alice".into(),
            avatar: None,
        }
    }

    #[test]
    fn test_pair_dispatched_once() {
        let mut i = initiator();
        let d = send_pair(&mut i, &HandshakeEvent::Ready);
        assert_eq!(
            d,
            vec![
                Dispatch::Delivered("ready"),
                Dispatch::Ignored(IgnoreReason::Duplicate)
            ]
        );

        let d = send_pair(&mut i, &HandshakeEvent::Success(identity()));
        assert_eq!(d[0], Dispatch::Delivered("success"));
        assert_eq!(d[1], Dispatch::Ignored(IgnoreReason::AfterTerminal));

        assert_eq!(i.handler().calls, vec!["ready", "success:alice"]);
        assert_eq!(i.surface().closed, 1);
        assert!(i.is_finished());
    }

    #[test]
    fn test_foreign_origin_never_reaches_handler() {
        let mut i = initiator();
        let forged = json!({"type": "AUTH_SUCCESS", "identity": {
            "address": "0x00000000000000000000000000000000000000a1", "nickname": "mallory"}});
        assert_eq!(
            i.handle_message("https://evil.example", &forged),
            Dispatch::Ignored(IgnoreReason::ForeignOrigin)
        );
        assert_eq!(
            i.handle_message("null", &forged),
            Dispatch::Ignored(IgnoreReason::ForeignOrigin)
        );
        assert!(i.handler().calls.is_empty());
        assert!(!i.is_finished());

        // Trailing slash and default port normalize to the responder origin
        assert_eq!(
            i.handle_message("https://villa.cash:443/", &json!({"type": "VILLA_READY"})),
            Dispatch::Delivered("ready")
        );
    }

    #[test]
    fn test_error_and_cancel() {
        let mut i = initiator();
        i.handle_message(
            VILLA,
            &json!({"type": "VILLA_AUTH_ERROR", "payload": {"error": "denied", "code": "E_PASSKEY"}}),
        );
        assert_eq!(i.handler().calls, vec!["error:denied:E_PASSKEY"]);

        let mut i = initiator();
        i.handle_message(VILLA, &json!({"type": "AUTH_CLOSE"}));
        assert_eq!(i.handler().calls, vec!["cancel"]);
        assert_eq!(i.surface().closed, 1);
    }

    #[test]
    fn test_unrecognized_payload_ignored() {
        let mut i = initiator();
        assert_eq!(
            i.handle_message(VILLA, &json!({"type": "PING"})),
            Dispatch::Ignored(IgnoreReason::Unrecognized)
        );
        assert_eq!(
            i.handle_message(VILLA, &json!("hello")),
            Dispatch::Ignored(IgnoreReason::Unrecognized)
        );
    }

    #[test]
    fn test_responder_url() {
        let params = ResponderParams {
            app_id: Some("app_1".into()),
            scopes: vec!["profile".into()],
            origin: None,
            mode: Some(TransportMode::Popup),
        };
        let (url, origin) =
            Initiator::<Recorder, Overlay>::responder_url("https://villa.cash/auth", &params).unwrap();
        assert_eq!(origin.as_str(), VILLA);
        assert!(url.as_str().starts_with("https://villa.cash/auth?appId=app_1"));
        assert!(Initiator::<Recorder, Overlay>::responder_url("ftp://villa.cash", &params).is_err());
    }
}
