// src/worker.rs
use crate::conn::{Conn, ConnState, PendingUpgrade};
use crate::error::{ErrorKind, UvhttpResult};
use crate::http::{Body, Context, Method};
use crate::metrics::WorkerMetrics;
use crate::middleware::ChainOutcome;
use crate::parser::{ParseStatus, Parser};
use crate::rate_limit::{RateDecision, unix_now};
use crate::server::ServerShared;
use crate::slab::ConnectionSlab;
use crate::static_files::{StaticOutcome, StreamProgress, now_ms};
use crate::syscalls::{self, EPOLLIN, EPOLLOUT, Epoll, ReadOutcome, WriteOutcome, epoll_event};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const LISTEN_TOKEN: u64 = u64::MAX;
const READ_CHUNK: usize = 64 * 1024;

/// Why the per-connection pump stopped.
enum Exit {
    /// Waiting on the reactor; the connection stays in its slot.
    Stay,
    /// Tear the connection down.
    Close,
    /// Hand the socket to an upgrade callback without closing it.
    Upgrade(PendingUpgrade),
}

pub struct Worker {
    id: usize,
    listen_fd: i32,
    shared: Arc<ServerShared>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    pub fn new(
        id: usize,
        listen_fd: i32,
        shared: Arc<ServerShared>,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            id,
            listen_fd,
            shared,
            metrics,
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> UvhttpResult<()> {
        let epoll = Epoll::new()?;
        epoll.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)?;

        let mut slab = ConnectionSlab::new(self.shared.limits.max_connections);
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 1024];
        let mut read_chunk = vec![0u8; READ_CHUNK];

        info!(worker = self.id, "entering event loop");

        let mut timeout = 1000;
        let mut now = unix_now() as u32;
        let mut last_sweep = now;
        // The Date header is rendered once per second, not per request.
        let mut date = httpdate::fmt_http_date(SystemTime::now());
        let mut date_at = now;

        while !shutdown.load(Ordering::Acquire) {
            now = unix_now() as u32;
            if now != date_at {
                date = httpdate::fmt_http_date(SystemTime::now());
                date_at = now;
            }
            if now.wrapping_sub(last_sweep) >= 1 {
                self.sweep(&mut slab, &epoll, now);
                last_sweep = now;
            }

            let n = match epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(_) => continue,
            };

            for i in 0..n {
                let token = events[i].u64;
                let readable = (events[i].events & EPOLLIN as u32) != 0;
                let writable = (events[i].events & EPOLLOUT as u32) != 0;

                if token == LISTEN_TOKEN {
                    if shutdown.load(Ordering::Acquire) {
                        continue;
                    }
                    self.accept_all(&mut slab, &epoll, now);
                } else {
                    self.drive_conn(
                        &mut slab,
                        &epoll,
                        token as usize,
                        readable,
                        writable,
                        now,
                        &mut read_chunk,
                        &date,
                        &shutdown,
                    );
                }
            }

            if shutdown.load(Ordering::Acquire) {
                timeout = 100;
            }
        }

        info!(worker = self.id, "exiting event loop");

        // Drain: no new accepts, close whatever is still open.
        for i in 0..slab.capacity() {
            if let Some(conn) = slab.get(i) {
                if conn.state != ConnState::Free {
                    epoll.delete(conn.fd).ok();
                    syscalls::close_fd(conn.fd);
                }
            }
        }
        Ok(())
    }

    fn accept_all(&self, slab: &mut ConnectionSlab, epoll: &Epoll, now: u32) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some(fd)) => {
                    let Some(idx) = slab.allocate() else {
                        // Out of capacity: shed the connection immediately.
                        self.shared
                            .stats
                            .record(ErrorKind::SlabFull, "connection table full");
                        syscalls::close_fd(fd);
                        continue;
                    };
                    let peer = syscalls::peer_addr(fd).unwrap_or_default();
                    let parser = Parser::with_limits(
                        self.shared.limits.url_max,
                        self.shared.limits.body_max,
                    );
                    let conn = slab.get_mut(idx).expect("allocated index");
                    conn.open(fd, parser, peer, now);
                    if epoll.add(fd, idx as u64, EPOLLIN).is_err() {
                        slab.free(idx);
                        syscalls::close_fd(fd);
                        continue;
                    }
                    self.metrics.inc_conn();
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    /// Pump one connection as far as it will go: consume residual bytes,
    /// read, parse, dispatch, write, stream, recycle — until it blocks on
    /// the reactor, closes, or hands its socket away.
    #[allow(clippy::too_many_arguments)]
    fn drive_conn(
        &self,
        slab: &mut ConnectionSlab,
        epoll: &Epoll,
        idx: usize,
        readable: bool,
        writable: bool,
        now: u32,
        read_chunk: &mut [u8],
        date: &str,
        shutdown: &AtomicBool,
    ) {
        let mut can_read = readable;
        let mut can_write = writable;

        let exit = loop {
            let Some(conn) = slab.get_mut(idx) else {
                return;
            };
            if conn.state == ConnState::Free || conn.state == ConnState::Upgraded {
                return;
            }
            conn.last_active = now;
            let fd = conn.fd;

            match conn.state {
                ConnState::Idle | ConnState::Parsing => {
                    // Residual pipelined bytes first; the socket is only
                    // read once they are gone.
                    if !conn.pending.is_empty() {
                        let pending = std::mem::take(&mut conn.pending);
                        match self.consume(conn, &pending, date, shutdown) {
                            Ok(true) => {
                                can_write = true;
                                continue;
                            }
                            Ok(false) => continue,
                            Err(exit) => break exit,
                        }
                    }

                    if !can_read {
                        break Exit::Stay;
                    }
                    match syscalls::read_nonblocking(fd, read_chunk) {
                        Ok(ReadOutcome::Data(n)) => {
                            match self.consume(conn, &read_chunk[..n], date, shutdown) {
                                Ok(true) => {
                                    can_write = true;
                                    continue;
                                }
                                Ok(false) => continue,
                                Err(exit) => break exit,
                            }
                        }
                        Ok(ReadOutcome::WouldBlock) => {
                            can_read = false;
                        }
                        Ok(ReadOutcome::Eof) => {
                            // Peer closed while no response was owed.
                            break Exit::Close;
                        }
                        Err(_) => {
                            self.shared
                                .stats
                                .record(ErrorKind::IoFatal, "socket read failed");
                            break Exit::Close;
                        }
                    }
                }

                ConnState::Handling => {
                    // Dispatch always moves straight to Writing; seeing
                    // Handling here means a bug, not a wait state.
                    break Exit::Close;
                }

                ConnState::Writing => {
                    if conn.write_done() {
                        // Nothing left to put on the wire (silent upgrade
                        // transfer, or an empty serialization).
                        match self.post_write(conn, epoll, idx, shutdown) {
                            Some(exit) => break exit,
                            None => {
                                can_read = true;
                                continue;
                            }
                        }
                    }
                    if !can_write {
                        break Exit::Stay;
                    }
                    let header_part: &[u8] = &conn.write_buf[conn.write_pos.min(conn.write_buf.len())..];
                    let body = conn.body_out.clone();
                    let outcome = if let Some(body) = &body {
                        if conn.write_pos < conn.write_buf.len() {
                            syscalls::writev_nonblocking(fd, &[header_part, body])
                        } else {
                            let body_off = conn.write_pos - conn.write_buf.len();
                            syscalls::write_nonblocking(fd, &body[body_off..])
                        }
                    } else {
                        syscalls::write_nonblocking(fd, header_part)
                    };
                    match outcome {
                        Ok(WriteOutcome::Wrote(n)) => {
                            conn.write_pos += n;
                            self.metrics.add_bytes(n);
                            if conn.write_done() {
                                match self.post_write(conn, epoll, idx, shutdown) {
                                    Some(exit) => break exit,
                                    None => {
                                        // A read edge may have fired (and been
                                        // consumed) while this response was in
                                        // flight; always probe the socket after
                                        // a recycle.
                                        can_read = true;
                                        continue;
                                    }
                                }
                            }
                        }
                        Ok(WriteOutcome::WouldBlock) => {
                            can_write = false;
                            let _ = epoll.modify(fd, idx as u64, EPOLLIN | EPOLLOUT);
                            break Exit::Stay;
                        }
                        Err(_) => {
                            self.shared
                                .stats
                                .record(ErrorKind::IoFatal, "socket write failed");
                            break Exit::Close;
                        }
                    }
                }

                ConnState::SendingFile => {
                    if !can_write {
                        break Exit::Stay;
                    }
                    let Some(stream) = conn.stream.as_mut() else {
                        break Exit::Close;
                    };
                    match stream.drive(fd) {
                        Ok(StreamProgress::Finished) => {
                            self.metrics.add_bytes(stream.size as usize);
                            conn.stream = None;
                            match self.post_write(conn, epoll, idx, shutdown) {
                                Some(exit) => break exit,
                                None => {
                                    can_read = true;
                                    continue;
                                }
                            }
                        }
                        Ok(StreamProgress::Pending) => {
                            can_write = false;
                            let _ = epoll.modify(fd, idx as u64, EPOLLIN | EPOLLOUT);
                            break Exit::Stay;
                        }
                        Err(_) => {
                            self.shared
                                .stats
                                .record(ErrorKind::IoFatal, "file stream failed");
                            break Exit::Close;
                        }
                    }
                }

                ConnState::Closing => break Exit::Close,
                ConnState::Free | ConnState::Upgraded => return,
            }
        };

        match exit {
            Exit::Stay => {}
            Exit::Close => self.close_conn(slab, epoll, idx),
            Exit::Upgrade(upgrade) => {
                let Some(conn) = slab.get_mut(idx) else { return };
                let fd = conn.fd;
                conn.state = ConnState::Upgraded;
                epoll.delete(fd).ok();
                slab.free(idx);
                self.metrics.dec_conn();
                self.metrics.inc_upgraded();
                debug!(worker = self.id, fd, "socket ownership transferred");
                // From here the callback owns the descriptor; this worker
                // never touches it again.
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                (upgrade.callback)(owned, upgrade.user_data);
            }
        }
    }

    /// Feed bytes to the parser. `Ok(true)` means a message completed and
    /// was dispatched (the connection is now Writing); `Ok(false)` means
    /// more bytes are needed.
    fn consume(
        &self,
        conn: &mut Conn,
        data: &[u8],
        date: &str,
        shutdown: &AtomicBool,
    ) -> Result<bool, Exit> {
        if conn.state == ConnState::Idle {
            conn.state = ConnState::Parsing;
        }
        match conn.parser.advance(&mut conn.request, data) {
            Ok((_, ParseStatus::NeedMore)) => Ok(false),
            Ok((consumed, ParseStatus::Complete)) => {
                conn.pending.extend_from_slice(&data[consumed..]);
                self.dispatch(conn, date, shutdown);
                Ok(true)
            }
            Err(e) => {
                if e.is_oversize() {
                    self.shared.stats.record(ErrorKind::ParseOversize, &e.to_string());
                    if conn.parser.headers_done() {
                        // Headers made it through: answer 400, then close.
                        conn.response.bad_request();
                        conn.keep_alive = false;
                        conn.pending.clear();
                        self.finish_response(conn, date);
                        return Ok(true);
                    }
                } else {
                    self.shared.stats.record(ErrorKind::ParseProtocol, &e.to_string());
                }
                Err(Exit::Close)
            }
        }
    }

    /// Run the completed request through upgrades → rate limiter →
    /// middleware → static mounts → router, then serialize the response.
    fn dispatch(&self, conn: &mut Conn, date: &str, shutdown: &AtomicBool) {
        conn.state = ConnState::Handling;
        conn.requests_served += 1;
        self.metrics.inc_req();

        let shared = &self.shared;
        let req = &conn.request;
        let resp = &mut conn.response;

        let mut keep_alive = req.keep_alive()
            && conn.requests_served < shared.limits.max_requests_per_conn
            && !shutdown.load(Ordering::Acquire);

        // 1. Protocol upgrades claim the request before anything else.
        if let Some(claimed) = shared.upgrades.dispatch(req, resp) {
            match claimed.transfer {
                // A transfer without a response is legal: the new owner
                // speaks first. Nothing is serialized in that case.
                Some(callback) => {
                    conn.upgrade = Some(PendingUpgrade {
                        callback,
                        user_data: claimed.user_data,
                    });
                }
                // A rejected handshake (e.g. missing key) answers and
                // closes.
                None => {
                    if !resp.is_sent() {
                        resp.internal_error();
                    }
                    keep_alive = false;
                    if resp.status() >= 400 {
                        shared
                            .stats
                            .record(ErrorKind::UpgradeRejected, "upgrade handshake rejected");
                    }
                }
            }
        } else {
            // 2. Rate limiter, keyed by the socket peer address.
            let limited = match &shared.rate_limiter {
                Some(limiter) => match limiter.check(&conn.peer) {
                    RateDecision::Allowed => false,
                    RateDecision::Limited { retry_after } => {
                        let mut buf = itoa::Buffer::new();
                        let _ = resp.set_status(429);
                        let _ = resp.set_header("Retry-After", buf.format(retry_after));
                        let _ = resp.set_header("Content-Type", "text/plain");
                        let _ = resp.set_body("Too Many Requests");
                        let _ = resp.send();
                        self.metrics.inc_rate_limited();
                        shared
                            .stats
                            .record(ErrorKind::RateLimited, &format!("peer {}", conn.peer));
                        true
                    }
                },
                None => false,
            };

            if !limited {
                // 3. Middleware chain.
                if shared.middleware.execute(req, resp, &shared.stats) == ChainOutcome::Continue {
                    // 4. Static mounts, longest matching prefix first.
                    let mount = shared
                        .mounts
                        .iter()
                        .filter(|m| m.matches(req.path()))
                        .max_by_key(|m| m.prefix().len());
                    if let Some(mount) = mount {
                        if let StaticOutcome::Stream(stream) = mount.handle(req, resp) {
                            conn.stream = Some(stream);
                        }
                    } else {
                        // 5. Router.
                        match shared.router.find_handler(req.path(), req.method) {
                            Some((handler, params)) => {
                                let mut ctx = Context { req, params };
                                handler(&mut ctx, resp);
                                if !resp.is_sent() {
                                    // The handler returned without sending.
                                    warn!(path = req.path(), "handler produced no response");
                                    resp.internal_error();
                                }
                            }
                            None => {
                                shared.stats.record(
                                    ErrorKind::RouteNotFound,
                                    &format!("{} {}", req.method.as_str(), req.path()),
                                );
                                resp.not_found();
                            }
                        }
                    }
                }
            }
        }

        conn.keep_alive = keep_alive && conn.upgrade.is_none();
        self.finish_response(conn, date);
    }

    /// Serialize the response into the connection's write buffer and move
    /// to Writing.
    fn finish_response(&self, conn: &mut Conn, date: &str) {
        let head_only = conn.request.method == Method::Head;
        conn.write_buf.clear();
        conn.write_pos = 0;
        conn.body_out = None;

        // An upgrade handler may hand the socket off without answering;
        // the wire then carries nothing from this side.
        let silent_transfer = conn.upgrade.is_some() && !conn.response.is_sent();
        if !silent_transfer {
            conn.response
                .serialize_headers_into(&mut conn.write_buf, conn.keep_alive, date);

            let status = conn.response.status();
            let body_allowed = !head_only && status >= 200 && status != 304;
            if body_allowed {
                match conn.response.body() {
                    Body::Empty => {}
                    Body::Bytes(bytes) => conn.write_buf.extend_from_slice(bytes),
                    Body::Shared(bytes) => conn.body_out = Some(bytes.clone()),
                }
            }
        }
        conn.state = ConnState::Writing;
    }

    /// The serialized response has drained. Hand off, stream, recycle, or
    /// close. `None` means the pump continues with the connection's new
    /// state.
    fn post_write(
        &self,
        conn: &mut Conn,
        epoll: &Epoll,
        idx: usize,
        shutdown: &AtomicBool,
    ) -> Option<Exit> {
        if let Some(upgrade) = conn.upgrade.take() {
            return Some(Exit::Upgrade(upgrade));
        }
        if conn.stream.is_some() {
            conn.state = ConnState::SendingFile;
            return None;
        }
        if conn.keep_alive && !shutdown.load(Ordering::Acquire) {
            conn.recycle();
            // Back to read interest only; pending bytes keep the pump
            // going without another reactor trip.
            let _ = epoll.modify(conn.fd, idx as u64, EPOLLIN);
            return None;
        }
        conn.state = ConnState::Closing;
        Some(Exit::Close)
    }

    fn close_conn(&self, slab: &mut ConnectionSlab, epoll: &Epoll, idx: usize) {
        if let Some(conn) = slab.get(idx) {
            if conn.state == ConnState::Free {
                return;
            }
            let fd = conn.fd;
            epoll.delete(fd).ok();
            syscalls::close_fd(fd);
            slab.free(idx);
            self.metrics.dec_conn();
        }
    }

    /// Once-per-second sweep: idle-timeout pruning and sendfile chunk
    /// deadlines.
    fn sweep(&self, slab: &mut ConnectionSlab, epoll: &Epoll, now: u32) {
        let idle_timeout = self.shared.limits.idle_timeout_secs;
        let ms = now_ms();
        for idx in 0..slab.capacity() {
            let Some(conn) = slab.get_mut(idx) else { continue };
            if conn.state == ConnState::Free {
                continue;
            }

            if conn.state == ConnState::SendingFile {
                let mut expired = false;
                if let Some(stream) = conn.stream.as_mut() {
                    if stream.deadline_ms > 0 && ms > stream.deadline_ms {
                        match stream.on_timeout() {
                            Ok(_) => {
                                self.shared.stats.record(
                                    ErrorKind::IoTransient,
                                    "sendfile chunk timed out, retrying",
                                );
                                let _ = epoll.modify(conn.fd, idx as u64, EPOLLIN | EPOLLOUT);
                            }
                            Err(_) => expired = true,
                        }
                    }
                }
                if expired {
                    self.shared
                        .stats
                        .record(ErrorKind::IoFatal, "sendfile retries exhausted");
                    self.close_conn(slab, epoll, idx);
                    continue;
                }
            }

            let Some(conn) = slab.get(idx) else { continue };
            if conn.state != ConnState::Free
                && now.wrapping_sub(conn.last_active) > idle_timeout
            {
                debug!(worker = self.id, fd = conn.fd, "idle timeout");
                self.close_conn(slab, epoll, idx);
            }
        }
    }
}
