// tests/pipeline.rs
//! End-to-end tests driving a served port over real loopback sockets.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use uvhttp::{Context, Response, Router, Server, ServerHandle, StaticConfig, UpgradeRegistry};

fn hello(_ctx: &mut Context, resp: &mut Response) {
    let _ = resp.respond(200, "text/plain", "Hello, World!");
}

fn user_post(ctx: &mut Context, resp: &mut Response) {
    let body = format!(
        "id={};post_id={}",
        ctx.param("id").unwrap_or("?"),
        ctx.param("post_id").unwrap_or("?")
    );
    let _ = resp.respond(200, "text/plain", body);
}

struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// Minimal HTTP/1.1 client that buffers across replies, so pipelined
/// responses arriving in one segment are split correctly.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    fn connect(handle: &ServerHandle) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", handle.port())).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send");
    }

    fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 8192];
        let n = self.stream.read(&mut chunk).expect("read");
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    /// Bytes read until the peer closes; fails the test on a timeout.
    fn read_to_eof(&mut self) -> usize {
        loop {
            let mut chunk = [0u8; 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return self.buf.len(),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(_) => return self.buf.len(),
            }
        }
    }

    fn read_reply(&mut self) -> Reply {
        let header_end = loop {
            if let Some(pos) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            assert!(self.fill() > 0, "connection closed before headers completed");
        };

        let head = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        assert!(
            status_line.starts_with("HTTP/1.1 "),
            "bad status line: {}",
            status_line
        );
        let status: u16 = status_line[9..12].parse().unwrap();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let body_len: usize = headers
            .get("content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);
        while self.buf.len() < header_end + body_len {
            assert!(self.fill() > 0, "connection closed mid-body");
        }

        let body = self.buf[header_end..header_end + body_len].to_vec();
        self.buf.drain(..header_end + body_len);

        Reply {
            status,
            headers,
            body,
        }
    }
}

fn basic_server() -> ServerHandle {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    router
        .get("/api/users/:id/posts/:post_id", user_post)
        .unwrap();
    Server::bind("127.0.0.1:0")
        .router(router)
        .spawn()
        .expect("spawn server")
}

#[test]
fn test_basic_get_and_keep_alive_reuse() {
    let handle = basic_server();
    let mut client = Client::connect(&handle);

    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(reply.headers.get("content-length").unwrap(), "13");
    assert_eq!(reply.body, b"Hello, World!");
    assert_eq!(reply.headers.get("connection").unwrap(), "keep-alive");
    assert!(reply.headers.contains_key("date"));

    // Same socket, second request: the connection was recycled.
    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"Hello, World!");

    handle.stop();
}

#[test]
fn test_not_found() {
    let handle = basic_server();
    let mut client = Client::connect(&handle);

    client.send(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, b"Not Found");

    handle.stop();
}

#[test]
fn test_param_routes_capture() {
    let handle = basic_server();
    let mut client = Client::connect(&handle);

    client.send(b"GET /api/users/42/posts/7 HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"id=42;post_id=7");

    handle.stop();
}

static WS_TRANSFERRED: AtomicBool = AtomicBool::new(false);

fn ws_take_socket(fd: std::os::fd::OwnedFd, _data: uvhttp::upgrade::UserData) {
    WS_TRANSFERRED.store(true, Ordering::Release);
    // The socket is ours now; dropping it closes it, which the test
    // observes as EOF after the 101.
    drop(fd);
}

#[test]
fn test_websocket_handshake_and_transfer() {
    let mut upgrades = UpgradeRegistry::new();
    upgrades.register_websocket(ws_take_socket, None).unwrap();

    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let handle = Server::bind("127.0.0.1:0")
        .router(router)
        .upgrades(upgrades)
        .spawn()
        .unwrap();

    let mut client = Client::connect(&handle);
    client.send(
        b"GET /chat HTTP/1.1\r\n\
          Host: x\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
    );
    let reply = client.read_reply();
    assert_eq!(reply.status, 101);
    assert_eq!(reply.headers.get("upgrade").unwrap(), "websocket");
    assert_eq!(reply.headers.get("connection").unwrap(), "Upgrade");
    assert_eq!(
        reply.headers.get("sec-websocket-accept").unwrap(),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );

    // The callback received the descriptor and dropped it; the peer sees
    // EOF rather than any further HTTP bytes.
    assert_eq!(client.read_to_eof(), 0);
    assert!(WS_TRANSFERRED.load(Ordering::Acquire));

    handle.stop();
}

#[test]
fn test_rate_limit_third_request_429() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let handle = Server::bind("127.0.0.1:0")
        .router(router)
        .rate_limit(2, 60)
        .spawn()
        .unwrap();

    let mut client = Client::connect(&handle);
    for _ in 0..2 {
        client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let reply = client.read_reply();
        assert_eq!(reply.status, 200);
    }

    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 429);
    // All three requests normally land in the same second, giving 60; a
    // second-boundary straddle gives 59.
    let retry: u64 = reply.headers.get("retry-after").unwrap().parse().unwrap();
    assert!((59..=60).contains(&retry), "retry-after was {}", retry);
    assert_eq!(reply.body, b"Too Many Requests");

    handle.stop();
}

#[test]
fn test_rate_limit_whitelist_exempt() {
    let mut router = Router::new();
    router.get("/", hello).unwrap();
    let handle = Server::bind("127.0.0.1:0")
        .router(router)
        .rate_limit(1, 60)
        .rate_limit_whitelist(["127.0.0.1"])
        .spawn()
        .unwrap();

    let mut client = Client::connect(&handle);
    for _ in 0..5 {
        client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let reply = client.read_reply();
        assert_eq!(reply.status, 200);
    }

    handle.stop();
}

#[test]
fn test_static_file_conditional_get() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), vec![b'z'; 1024]).unwrap();

    let handle = Server::bind("127.0.0.1:0")
        .static_mount("/static", StaticConfig::new(dir.path()))
        .unwrap()
        .spawn()
        .unwrap();

    let mut client = Client::connect(&handle);
    client.send(b"GET /static/data.bin HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.headers.get("content-length").unwrap(), "1024");
    assert_eq!(reply.body.len(), 1024);
    let etag = reply.headers.get("etag").unwrap().clone();

    let conditional = format!(
        "GET /static/data.bin HTTP/1.1\r\nHost: x\r\nIf-None-Match: {}\r\n\r\n",
        etag
    );
    client.send(conditional.as_bytes());
    let reply = client.read_reply();
    assert_eq!(reply.status, 304);
    assert_eq!(reply.headers.get("etag").unwrap(), &etag);
    assert!(reply.body.is_empty());
    assert!(!reply.headers.contains_key("content-length"));

    handle.stop();
}

#[test]
fn test_large_file_streams_completely() {
    let dir = tempfile::tempdir().unwrap();
    // Well past the 256 KiB chunk threshold, so this goes down the
    // streaming path in multiple chunks.
    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("big.bin"), &payload).unwrap();

    let handle = Server::bind("127.0.0.1:0")
        .static_mount("/files", StaticConfig::new(dir.path()))
        .unwrap()
        .spawn()
        .unwrap();

    let mut client = Client::connect(&handle);
    client.send(b"GET /files/big.bin HTTP/1.1\r\nHost: x\r\n\r\n");
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(
        reply.headers.get("content-length").unwrap(),
        &payload.len().to_string()
    );
    // Every chunk arrived, in order.
    assert_eq!(reply.body, payload);

    handle.stop();
}

#[test]
fn test_post_body_echo_and_close() {
    fn echo(ctx: &mut Context, resp: &mut Response) {
        let _ = resp.respond(200, "application/octet-stream", ctx.req.body().to_vec());
    }

    let mut router = Router::new();
    router.post("/echo", echo).unwrap();
    let handle = Server::bind("127.0.0.1:0").router(router).spawn().unwrap();

    let mut client = Client::connect(&handle);
    client.send(
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
    );
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello world");
    assert_eq!(reply.headers.get("connection").unwrap(), "close");

    // Connection: close drains the response and then closes the socket.
    assert_eq!(client.read_to_eof(), 0);

    handle.stop();
}

#[test]
fn test_pipelined_second_request_served_after_first() {
    let handle = basic_server();
    let mut client = Client::connect(&handle);

    // Both requests in one segment: the residual bytes after the first
    // message_complete must be preserved and replayed for the next cycle.
    client.send(
        b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /api/users/1/posts/2 HTTP/1.1\r\nHost: x\r\n\r\n",
    );
    let first = client.read_reply();
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"Hello, World!");
    let second = client.read_reply();
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"id=1;post_id=2");

    handle.stop();
}

#[test]
fn test_oversize_url_closes_connection() {
    let handle = basic_server();
    let mut client = Client::connect(&handle);

    let request = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(4096));
    client.send(request.as_bytes());

    // URL overflow happens before the headers parse: immediate close, no
    // response bytes.
    assert_eq!(client.read_to_eof(), 0);

    handle.stop();
}

#[test]
fn test_chunked_request_body() {
    fn echo(ctx: &mut Context, resp: &mut Response) {
        let _ = resp.respond(200, "text/plain", ctx.req.body().to_vec());
    }

    let mut router = Router::new();
    router.post("/echo", echo).unwrap();
    let handle = Server::bind("127.0.0.1:0").router(router).spawn().unwrap();

    let mut client = Client::connect(&handle);
    client.send(
        b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let reply = client.read_reply();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"Wikipedia");

    handle.stop();
}
