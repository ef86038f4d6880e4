// src/http.rs
use crate::error::{UvhttpError, UvhttpResult};
use crate::headers::HeaderMap;
use crate::router::Params;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    /// Route-side wildcard: matches every request method. Never parsed off
    /// the wire.
    Any,
    Unknown,
}

impl Method {
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Any => "ANY",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// Canonical reason phrase for well-known status codes.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A parsed inbound request. One lives inline in each connection slot and
/// is reset between keep-alive cycles.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    url: String,
    pub headers: HeaderMap,
    body: Vec<u8>,
    /// HTTP/1.1 (true) or HTTP/1.0.
    pub http11: bool,
    /// Textual peer address, captured at accept time.
    pub peer: String,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Get,
            url: String::new(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            http11: true,
            peer: String::new(),
        }
    }

    /// Full request target, including any query string. Empty URLs
    /// normalize to "/".
    pub fn url(&self) -> &str {
        if self.url.is_empty() { "/" } else { &self.url }
    }

    pub(crate) fn set_url(&mut self, url: &str) {
        debug_assert!(self.url.is_empty(), "URL is set exactly once per request");
        self.url.push_str(url);
    }

    /// Path component of the URL, without the query string.
    pub fn path(&self) -> &str {
        let url = self.url();
        match url.find('?') {
            Some(idx) => &url[..idx],
            None => url,
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.url().find('?').map(|idx| &self.url()[idx + 1..])
    }

    /// Value of a single `name=value` query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let qs = self.query_string()?;
        for pair in qs.split('&') {
            let mut it = pair.splitn(2, '=');
            if it.next() == Some(name) {
                return Some(it.next().unwrap_or(""));
            }
        }
        None
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub(crate) fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    /// Client address as reported by proxies, falling back to the socket
    /// peer: first element of `X-Forwarded-For`, then `X-Real-IP`, then
    /// the TCP peer address.
    pub fn client_ip(&self) -> &str {
        if let Some(fwd) = self.headers.get("X-Forwarded-For") {
            let first = match fwd.find(',') {
                Some(idx) => &fwd[..idx],
                None => fwd,
            };
            return first.trim();
        }
        if let Some(real) = self.headers.get("X-Real-IP") {
            return real;
        }
        &self.peer
    }

    /// Whether the connection should be reused after this request.
    /// HTTP/1.1 defaults to keep-alive; `Connection: close` is honored;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) => {
                if contains_token(v, "close") {
                    false
                } else if contains_token(v, "keep-alive") {
                    true
                } else {
                    self.http11
                }
            }
            None => self.http11,
        }
    }

    /// Re-serialize the parsed request as an HTTP/1.1 message.
    /// Byte-equivalent to the original input modulo header ordering and
    /// optional whitespace.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.url().as_bytes());
        buf.extend_from_slice(if self.http11 {
            b" HTTP/1.1\r\n".as_slice()
        } else {
            b" HTTP/1.0\r\n".as_slice()
        });
        for h in self.headers.iter() {
            buf.extend_from_slice(h.name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(h.value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
    }

    /// Reset for the next request on the same connection. The peer address
    /// is a connection property and survives.
    pub fn reset(&mut self) {
        self.method = Method::Get;
        self.url.clear();
        self.headers.clear();
        self.body.clear();
        self.http11 = true;
    }
}

/// Case-insensitive search for `token` in a comma-separated header value.
pub(crate) fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Response body storage. Cached static files are shared by reference so
/// eviction cannot free bytes an in-flight response still needs.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Shared(Arc<[u8]>),
}

impl Body {
    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
            Body::Shared(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(b) => b.as_slice(),
            Body::Shared(b) => b,
        }
    }
}

/// The in-construction outbound message. Exactly one send per response;
/// writes after `send` are rejected.
#[derive(Debug)]
pub struct Response {
    status: u16,
    pub headers: HeaderMap,
    body: Body,
    sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            body: Body::Empty,
            sent: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) -> UvhttpResult<()> {
        if !(100..=599).contains(&status) {
            return Err(UvhttpError::InvalidParam("status code out of range"));
        }
        if self.sent {
            return Err(UvhttpError::DoubleSend);
        }
        self.status = status;
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> UvhttpResult<()> {
        if self.sent {
            return Err(UvhttpError::DoubleSend);
        }
        self.headers
            .append(name, value)
            .map_err(|_| UvhttpError::InvalidParam("header too long or too many"))
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> UvhttpResult<()> {
        if self.sent {
            return Err(UvhttpError::DoubleSend);
        }
        self.body = Body::Bytes(body.into());
        Ok(())
    }

    pub(crate) fn set_shared_body(&mut self, body: Arc<[u8]>) -> UvhttpResult<()> {
        if self.sent {
            return Err(UvhttpError::DoubleSend);
        }
        self.body = Body::Shared(body);
        Ok(())
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Mark the response as produced. The connection serializes and writes
    /// it when the handler returns. A second send is a programming error.
    pub fn send(&mut self) -> UvhttpResult<()> {
        if self.sent {
            return Err(UvhttpError::DoubleSend);
        }
        self.sent = true;
        Ok(())
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Status + headers + body in one step, the common handler tail.
    pub fn respond(&mut self, status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> UvhttpResult<()> {
        self.set_status(status)?;
        self.set_header("Content-Type", content_type)?;
        self.set_body(body)?;
        self.send()
    }

    pub fn reset(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body = Body::Empty;
        self.sent = false;
    }

    /// Serialize the status line and headers into `buf`.
    ///
    /// `Date`, `Content-Length` and `Connection` are appended unless the
    /// handler already set them; 1xx and 304 responses get no body and no
    /// `Content-Length`. The body itself is written separately so shared
    /// cache bytes can go out via vectored writes without copying.
    pub(crate) fn serialize_headers_into(&self, buf: &mut Vec<u8>, keep_alive: bool, date: &str) {
        let mut status_buf = itoa::Buffer::new();
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(status_buf.format(self.status).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(reason_phrase(self.status).as_bytes());
        buf.extend_from_slice(b"\r\n");

        for h in self.headers.iter() {
            buf.extend_from_slice(h.name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(h.value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains("Date") {
            buf.extend_from_slice(b"Date: ");
            buf.extend_from_slice(date.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        let body_allowed = self.status >= 200 && self.status != 304;
        if body_allowed && !self.headers.contains("Content-Type") && !self.body.is_empty() {
            buf.extend_from_slice(b"Content-Type: text/plain\r\n");
        }
        if body_allowed && !self.headers.contains("Content-Length") {
            let mut len_buf = itoa::Buffer::new();
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(len_buf.format(self.body.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !self.headers.contains("Connection") {
            buf.extend_from_slice(if keep_alive {
                b"Connection: keep-alive\r\n".as_slice()
            } else {
                b"Connection: close\r\n".as_slice()
            });
        }
        buf.extend_from_slice(b"\r\n");
    }

    // Canned responses used by the dispatch pipeline. Headers already set
    // by middleware (CORS and friends) survive; only the content fields
    // are overridden.

    pub(crate) fn canned(&mut self, status: u16, body: &'static str) {
        self.status = status;
        let _ = self.headers.set("Content-Type", "text/plain");
        self.headers.remove("Content-Length");
        self.body = Body::Bytes(body.as_bytes().to_vec());
        self.sent = true;
    }

    pub(crate) fn not_found(&mut self) {
        self.canned(404, "Not Found");
    }

    pub(crate) fn bad_request(&mut self) {
        self.canned(400, "Bad Request");
    }

    pub(crate) fn internal_error(&mut self) {
        self.canned(500, "Internal Server Error");
    }
}

/// Per-request view handed to route handlers.
pub struct Context<'a> {
    pub req: &'a Request,
    pub params: Params<'a>,
}

impl<'a> Context<'a> {
    /// Captured value of a `:name` or `*name` pattern segment.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_from_bytes() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"PATCH"), Method::Patch);
        assert_eq!(Method::from_bytes(b"BREW"), Method::Unknown);
    }

    #[test]
    fn test_url_accessors() {
        let mut req = Request::new();
        req.set_url("/api/users?id=42&sort=asc");
        assert_eq!(req.path(), "/api/users");
        assert_eq!(req.query_string(), Some("id=42&sort=asc"));
        assert_eq!(req.query_param("id"), Some("42"));
        assert_eq!(req.query_param("sort"), Some("asc"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_empty_url_normalizes_to_root() {
        let req = Request::new();
        assert_eq!(req.url(), "/");
        assert_eq!(req.path(), "/");
    }

    #[test]
    fn test_keep_alive_defaults() {
        let mut req = Request::new();
        assert!(req.keep_alive());

        req.headers.append("Connection", "close").unwrap();
        assert!(!req.keep_alive());

        let mut old = Request::new();
        old.http11 = false;
        assert!(!old.keep_alive());
        old.headers.append("Connection", "keep-alive").unwrap();
        assert!(old.keep_alive());

        let mut multi = Request::new();
        multi.headers.append("Connection", "keep-alive, Upgrade").unwrap();
        assert!(multi.keep_alive());
    }

    #[test]
    fn test_client_ip_precedence() {
        let mut req = Request::new();
        req.peer = "192.168.1.9".to_string();
        assert_eq!(req.client_ip(), "192.168.1.9");

        req.headers.append("X-Real-IP", "10.1.1.1").unwrap();
        assert_eq!(req.client_ip(), "10.1.1.1");

        req.headers
            .append("X-Forwarded-For", "203.0.113.5, 10.1.1.1")
            .unwrap();
        assert_eq!(req.client_ip(), "203.0.113.5");
    }

    #[test]
    fn test_double_send_rejected() {
        let mut resp = Response::new();
        resp.set_status(200).unwrap();
        resp.send().unwrap();
        assert!(matches!(resp.send(), Err(UvhttpError::DoubleSend)));
        assert!(matches!(
            resp.set_header("X-Late", "no"),
            Err(UvhttpError::DoubleSend)
        ));
        assert!(matches!(resp.set_body("late"), Err(UvhttpError::DoubleSend)));
    }

    #[test]
    fn test_status_range_validated() {
        let mut resp = Response::new();
        assert!(resp.set_status(99).is_err());
        assert!(resp.set_status(600).is_err());
        assert!(resp.set_status(101).is_ok());
    }

    #[test]
    fn test_serialize_basic() {
        let mut resp = Response::new();
        resp.respond(200, "text/plain", "Hello, World!").unwrap();

        let mut buf = Vec::new();
        resp.serialize_headers_into(&mut buf, true, "Thu, 01 Jan 1970 00:00:00 GMT");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_304_has_no_content_length() {
        let mut resp = Response::new();
        resp.set_status(304).unwrap();
        resp.set_header("ETag", "\"abc\"").unwrap();
        resp.send().unwrap();

        let mut buf = Vec::new();
        resp.serialize_headers_into(&mut buf, true, "Thu, 01 Jan 1970 00:00:00 GMT");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!text.contains("Content-Length"));
        assert!(text.contains("ETag: \"abc\"\r\n"));
    }

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(101), "Switching Protocols");
        assert_eq!(reason_phrase(429), "Too Many Requests");
        assert_eq!(reason_phrase(599), "Unknown");
    }
}
