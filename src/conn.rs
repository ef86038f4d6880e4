// src/conn.rs
use crate::http::{Request, Response};
use crate::parser::Parser;
use crate::static_files::FileStream;
use crate::upgrade::{TransferCallback, UserData};

/// Connection state machine.
///
/// `Free` is slab bookkeeping; a freed slot is the terminal "closed"
/// state. `Upgraded` is one-way: the socket has left this module and is
/// never read, written, or closed here again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Free = 0,
    /// Accepted, awaiting the first byte.
    Idle = 1,
    /// Bytes arriving, parser running.
    Parsing = 2,
    /// Message complete, pipeline/handler running.
    Handling = 3,
    /// Response bytes draining.
    Writing = 4,
    /// Response headers drained, file chunks streaming.
    SendingFile = 5,
    /// Socket handed off to another protocol.
    Upgraded = 6,
    /// Draining then closing.
    Closing = 7,
}

impl Default for ConnState {
    fn default() -> Self {
        ConnState::Free
    }
}

/// Socket handoff queued by an upgrade handler; executed by the worker
/// once the handshake response drains.
pub struct PendingUpgrade {
    pub callback: TransferCallback,
    pub user_data: UserData,
}

/// One connection slot. Owns the socket, the parser, exactly one in-flight
/// request/response pair, the serialized write buffer, and any residual
/// pipelined bytes for the next cycle.
pub struct Conn {
    /// File descriptor, or the free-list next index while `Free`.
    pub fd: i32,
    pub state: ConnState,
    pub parser: Parser,
    pub request: Request,
    pub response: Response,
    /// Serialized response headers (and inline body).
    pub write_buf: Vec<u8>,
    /// Bytes of `write_buf` + shared body already written.
    pub write_pos: usize,
    /// Cached-file body written after `write_buf`, shared with the cache.
    pub body_out: Option<std::sync::Arc<[u8]>>,
    /// Residual input past the last `message_complete`.
    pub pending: Vec<u8>,
    /// Whether to recycle after the current response drains.
    pub keep_alive: bool,
    pub peer: String,
    pub last_active: u32,
    pub requests_served: u32,
    pub stream: Option<FileStream>,
    pub upgrade: Option<PendingUpgrade>,
}

impl Conn {
    pub fn empty() -> Self {
        Self {
            fd: -1,
            state: ConnState::Free,
            parser: Parser::new(),
            request: Request::new(),
            response: Response::new(),
            write_buf: Vec::new(),
            write_pos: 0,
            body_out: None,
            pending: Vec::new(),
            keep_alive: true,
            peer: String::new(),
            last_active: 0,
            requests_served: 0,
            stream: None,
            upgrade: None,
        }
    }

    /// Reinitialize a recycled slot for a fresh socket.
    pub fn open(&mut self, fd: i32, parser: Parser, peer: String, now: u32) {
        self.fd = fd;
        self.state = ConnState::Idle;
        self.parser = parser;
        self.request.reset();
        self.request.peer = peer.clone();
        self.response.reset();
        self.write_buf.clear();
        self.write_pos = 0;
        self.body_out = None;
        self.pending.clear();
        self.keep_alive = true;
        self.peer = peer;
        self.last_active = now;
        self.requests_served = 0;
        self.stream = None;
        self.upgrade = None;
    }

    /// Reset between keep-alive cycles. Residual pipelined bytes survive
    /// in `pending`; everything request-scoped is cleared.
    pub fn recycle(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset();
        self.write_buf.clear();
        self.write_pos = 0;
        self.body_out = None;
        self.keep_alive = true;
        self.stream = None;
        self.upgrade = None;
        self.state = if self.pending.is_empty() {
            ConnState::Idle
        } else {
            ConnState::Parsing
        };
    }

    /// Total response bytes to put on the wire this cycle.
    pub fn write_total(&self) -> usize {
        self.write_buf.len() + self.body_out.as_ref().map_or(0, |b| b.len())
    }

    /// True when the serialized response (headers + shared body) drained.
    pub fn write_done(&self) -> bool {
        self.write_pos >= self.write_total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_resets_slot_state() {
        let mut conn = Conn::empty();
        conn.pending.extend_from_slice(b"stale");
        conn.requests_served = 7;
        conn.write_buf.extend_from_slice(b"old");

        conn.open(9, Parser::new(), "10.0.0.1".to_string(), 100);
        assert_eq!(conn.fd, 9);
        assert_eq!(conn.state, ConnState::Idle);
        assert!(conn.pending.is_empty());
        assert!(conn.write_buf.is_empty());
        assert_eq!(conn.requests_served, 0);
        assert_eq!(conn.peer, "10.0.0.1");
        assert_eq!(conn.request.peer, "10.0.0.1");
    }

    #[test]
    fn test_recycle_keeps_pending_bytes() {
        let mut conn = Conn::empty();
        conn.open(9, Parser::new(), "p".to_string(), 100);
        conn.state = ConnState::Writing;
        conn.pending.extend_from_slice(b"GET /next HTTP/1.1\r\n");

        conn.recycle();
        assert_eq!(conn.state, ConnState::Parsing);
        assert_eq!(conn.pending, b"GET /next HTTP/1.1\r\n");

        conn.pending.clear();
        conn.recycle();
        assert_eq!(conn.state, ConnState::Idle);
    }

    #[test]
    fn test_write_accounting_with_shared_body() {
        let mut conn = Conn::empty();
        conn.write_buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");
        conn.body_out = Some(vec![0u8; 100].into());
        assert_eq!(conn.write_total(), 19 + 100);
        conn.write_pos = 50;
        assert!(!conn.write_done());
        conn.write_pos = 119;
        assert!(conn.write_done());
    }
}
