// src/upgrade.rs
use crate::error::{UvhttpError, UvhttpResult};
use crate::http::{Request, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use std::any::Any;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// RFC 6455 §4.2 handshake GUID.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub type UserData = Option<Arc<dyn Any + Send + Sync>>;

/// Inspects a parsed request (plus the pre-extracted `Upgrade` and
/// `Connection` header values) and claims it, or not.
pub type UpgradeDetector = fn(&Request, Option<&str>, Option<&str>) -> bool;

/// Runs when a detector claimed the request. May produce any response via
/// the normal `Response` API and may request the socket via
/// [`UpgradeAction::transfer_ownership`].
pub type UpgradeHandler = fn(&Request, &mut Response, &mut UpgradeAction);

/// Receives the raw socket once the handshake response has drained. From
/// that point the callback is the sole owner: the connection neither
/// reads, writes, nor closes the descriptor again.
pub type TransferCallback = fn(OwnedFd, UserData);

/// Socket-handoff intent collected from an upgrade handler. The actual
/// transfer happens on the reactor after the response bytes drain.
pub struct UpgradeAction {
    registered: Option<TransferCallback>,
    pub(crate) pending: Option<TransferCallback>,
}

impl UpgradeAction {
    fn new(registered: Option<TransferCallback>) -> Self {
        Self {
            registered,
            pending: None,
        }
    }

    /// Hand the socket to `callback` once the response has been written.
    pub fn transfer_ownership(&mut self, callback: TransferCallback) {
        self.pending = Some(callback);
    }

    /// Hand the socket to the callback this protocol was registered with.
    pub fn transfer_to_registered(&mut self) {
        self.pending = self.registered;
    }
}

struct UpgradeRegistration {
    name: String,
    detector: UpgradeDetector,
    handler: UpgradeHandler,
    transfer: Option<TransferCallback>,
    user_data: UserData,
}

/// Ordered registry of protocol upgrades. Detectors run in registration
/// order after a message completes and before the rate limiter; the first
/// claim wins.
#[derive(Default)]
pub struct UpgradeRegistry {
    entries: Vec<UpgradeRegistration>,
}

/// Result of running an upgrade handler: the callback (if any) that takes
/// the socket, plus the registration's user data.
pub(crate) struct ClaimedUpgrade {
    pub transfer: Option<TransferCallback>,
    pub user_data: UserData,
}

impl UpgradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a protocol under a stable name. Duplicate names are
    /// rejected.
    pub fn register(
        &mut self,
        name: &str,
        detector: UpgradeDetector,
        handler: UpgradeHandler,
        transfer: Option<TransferCallback>,
        user_data: UserData,
    ) -> UvhttpResult<()> {
        if name.is_empty() {
            return Err(UvhttpError::InvalidParam("upgrade name must not be empty"));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(UvhttpError::InvalidParam("duplicate upgrade name"));
        }
        self.entries.push(UpgradeRegistration {
            name: name.to_string(),
            detector,
            handler,
            transfer,
            user_data,
        });
        Ok(())
    }

    /// Register the built-in WebSocket handshake. `transfer` receives the
    /// socket after the 101 drains; frame I/O is outside the core.
    pub fn register_websocket(
        &mut self,
        transfer: TransferCallback,
        user_data: UserData,
    ) -> UvhttpResult<()> {
        self.register(
            "websocket",
            websocket_detector,
            websocket_handshake,
            Some(transfer),
            user_data,
        )
    }

    /// Run detectors in order; on a claim, run that protocol's handler.
    /// Returns `None` when no detector claimed the request.
    pub(crate) fn dispatch(&self, req: &Request, resp: &mut Response) -> Option<ClaimedUpgrade> {
        if self.entries.is_empty() {
            return None;
        }
        let upgrade_hdr = req.header("Upgrade");
        let connection_hdr = req.header("Connection");
        let entry = self
            .entries
            .iter()
            .find(|e| (e.detector)(req, upgrade_hdr, connection_hdr))?;

        let mut action = UpgradeAction::new(entry.transfer);
        (entry.handler)(req, resp, &mut action);
        Some(ClaimedUpgrade {
            transfer: action.pending,
            user_data: entry.user_data.clone(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

// ── WebSocket ──

/// `Sec-WebSocket-Accept` for a client key: base64(sha1(key ‖ GUID)).
pub fn websocket_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn websocket_detector(_req: &Request, upgrade: Option<&str>, connection: Option<&str>) -> bool {
    let Some(upgrade) = upgrade else { return false };
    let Some(connection) = connection else { return false };
    upgrade.eq_ignore_ascii_case("websocket") && crate::http::contains_token(connection, "upgrade")
}

fn websocket_handshake(req: &Request, resp: &mut Response, action: &mut UpgradeAction) {
    // The handshake is claimed on Upgrade/Connection alone; a missing key
    // is answered with a 400 and the connection closes.
    let Some(key) = req.header("Sec-WebSocket-Key") else {
        let _ = resp.set_status(400);
        let _ = resp.set_header("Content-Type", "text/plain");
        let _ = resp.set_body("Missing Sec-WebSocket-Key header");
        let _ = resp.send();
        return;
    };

    let accept = websocket_accept_key(key);
    let _ = resp.set_status(101);
    let _ = resp.set_header("Upgrade", "websocket");
    let _ = resp.set_header("Connection", "Upgrade");
    let _ = resp.set_header("Sec-WebSocket-Accept", &accept);
    let _ = resp.send();
    action.transfer_to_registered();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn ws_request(key: Option<&str>) -> Request {
        let mut req = Request::new();
        req.method = Method::Get;
        req.headers.append("Host", "example.com").unwrap();
        req.headers.append("Upgrade", "websocket").unwrap();
        req.headers.append("Connection", "Upgrade").unwrap();
        if let Some(key) = key {
            req.headers.append("Sec-WebSocket-Key", key).unwrap();
        }
        req
    }

    fn noop_transfer(_fd: OwnedFd, _data: UserData) {}

    #[test]
    fn test_accept_key_rfc_sample() {
        // The RFC 6455 sample nonce and its published accept value.
        assert_eq!(
            websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_detector_requires_upgrade_headers() {
        let req = ws_request(Some("dGhlIHNhbXBsZSBub25jZQ=="));
        assert!(websocket_detector(
            &req,
            req.header("Upgrade"),
            req.header("Connection")
        ));

        // A different upgrade protocol is not claimed.
        let mut req = Request::new();
        req.headers.append("Upgrade", "h2c").unwrap();
        req.headers.append("Connection", "Upgrade").unwrap();
        assert!(!websocket_detector(
            &req,
            req.header("Upgrade"),
            req.header("Connection")
        ));

        // No Connection: Upgrade token, no claim.
        let mut req = Request::new();
        req.headers.append("Upgrade", "websocket").unwrap();
        req.headers.append("Connection", "keep-alive").unwrap();
        assert!(!websocket_detector(
            &req,
            req.header("Upgrade"),
            req.header("Connection")
        ));
    }

    #[test]
    fn test_missing_key_answers_400() {
        let mut registry = UpgradeRegistry::new();
        registry.register_websocket(noop_transfer, None).unwrap();

        let req = ws_request(None);
        let mut resp = Response::new();
        let claimed = registry.dispatch(&req, &mut resp).expect("claimed");
        assert_eq!(resp.status(), 400);
        assert_eq!(resp.body().as_bytes(), b"Missing Sec-WebSocket-Key header");
        assert!(claimed.transfer.is_none());
    }

    #[test]
    fn test_detector_case_insensitive() {
        let mut req = Request::new();
        req.headers.append("Upgrade", "WebSocket").unwrap();
        req.headers.append("Connection", "keep-alive, UPGRADE").unwrap();
        req.headers.append("Sec-WebSocket-Key", "x").unwrap();
        assert!(websocket_detector(
            &req,
            req.header("Upgrade"),
            req.header("Connection")
        ));
    }

    #[test]
    fn test_handshake_response() {
        let mut registry = UpgradeRegistry::new();
        registry.register_websocket(noop_transfer, None).unwrap();

        let req = ws_request(Some("dGhlIHNhbXBsZSBub25jZQ=="));
        let mut resp = Response::new();
        let claimed = registry.dispatch(&req, &mut resp).expect("claim");

        assert_eq!(resp.status(), 101);
        assert!(resp.is_sent());
        assert_eq!(resp.headers.get("Upgrade"), Some("websocket"));
        assert_eq!(resp.headers.get("Connection"), Some("Upgrade"));
        assert_eq!(
            resp.headers.get("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert!(claimed.transfer.is_some());
    }

    #[test]
    fn test_non_upgrade_request_not_claimed() {
        let mut registry = UpgradeRegistry::new();
        registry.register_websocket(noop_transfer, None).unwrap();

        let mut req = Request::new();
        req.headers.append("Host", "example.com").unwrap();
        let mut resp = Response::new();
        assert!(registry.dispatch(&req, &mut resp).is_none());
        assert!(!resp.is_sent());
    }

    #[test]
    fn test_first_claim_wins() {
        fn claim_all(_req: &Request, _u: Option<&str>, _c: Option<&str>) -> bool {
            true
        }
        fn first_handler(_req: &Request, resp: &mut Response, _a: &mut UpgradeAction) {
            let _ = resp.respond(200, "text/plain", "first");
        }
        fn second_handler(_req: &Request, resp: &mut Response, _a: &mut UpgradeAction) {
            let _ = resp.respond(200, "text/plain", "second");
        }

        let mut registry = UpgradeRegistry::new();
        registry
            .register("ipps", claim_all, first_handler, None, None)
            .unwrap();
        registry
            .register("other", claim_all, second_handler, None, None)
            .unwrap();

        let req = Request::new();
        let mut resp = Response::new();
        registry.dispatch(&req, &mut resp).unwrap();
        assert_eq!(resp.body().as_bytes(), b"first");
    }

    #[test]
    fn test_duplicate_name_rejected() {
        fn never(_req: &Request, _u: Option<&str>, _c: Option<&str>) -> bool {
            false
        }
        fn noop(_req: &Request, _resp: &mut Response, _a: &mut UpgradeAction) {}

        let mut registry = UpgradeRegistry::new();
        registry.register("x", never, noop, None, None).unwrap();
        assert!(registry.register("x", never, noop, None, None).is_err());
    }
}
