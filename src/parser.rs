// src/parser.rs
use crate::headers::{HeaderError, MAX_HEADER_NAME, MAX_HEADER_VALUE};
use crate::http::{Method, Request, contains_token};
use memchr::memchr;
use thiserror::Error;

pub const URL_MAX_DEFAULT: usize = 2048;
pub const BODY_MAX_DEFAULT: usize = 1024 * 1024;

// Room for the method token, separating spaces and the version around the URL.
const REQUEST_LINE_SLACK: usize = 32;
const HEADER_LINE_MAX: usize = MAX_HEADER_NAME + MAX_HEADER_VALUE + 4;
const CHUNK_LINE_MAX: usize = 256;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed request line or chunk framing.
    #[error("malformed HTTP request")]
    Protocol,
    #[error("header name exceeds {MAX_HEADER_NAME} bytes")]
    HeaderTooLong,
    #[error("header value exceeds {MAX_HEADER_VALUE} bytes")]
    HeaderValueTooLong,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("request URL too long")]
    UrlTooLong,
    #[error("request body too large")]
    BodyTooLarge,
}

impl ParseError {
    /// Oversize failures can still be answered with a 400 when the request
    /// line and headers made it through; protocol failures cannot.
    pub fn is_oversize(&self) -> bool {
        !matches!(self, ParseError::Protocol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The whole input belonged to the current message; feed more bytes.
    NeedMore,
    /// `message_complete`: the request in `Request` is finished. Bytes past
    /// the reported offset belong to the next message.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd { seen_cr: bool },
    Trailers,
    Complete,
}

/// Incremental HTTP/1.1 request parser.
///
/// Fed arbitrary byte chunks via [`advance`](Parser::advance); a partial
/// line (including a partially received header field name) is carried in a
/// bounded scratch buffer across calls, so one-byte-at-a-time input parses
/// identically to a single full buffer. The parser never straddles two
/// logical requests: on `Complete` it reports how many input bytes it
/// consumed and the caller keeps the residue for the next cycle.
#[derive(Debug)]
pub struct Parser {
    state: State,
    line: Vec<u8>,
    url_max: usize,
    body_max: usize,
    headers_done: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::with_limits(URL_MAX_DEFAULT, BODY_MAX_DEFAULT)
    }

    pub fn with_limits(url_max: usize, body_max: usize) -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::new(),
            url_max,
            body_max,
            headers_done: false,
        }
    }

    /// Prepare for the next message on the same connection.
    pub fn reset(&mut self) {
        self.state = State::RequestLine;
        self.line.clear();
        self.headers_done = false;
    }

    /// True once the request line and all headers parsed cleanly.
    pub fn headers_done(&self) -> bool {
        self.headers_done
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Feed a chunk. Returns the number of input bytes consumed and whether
    /// the message completed. On `NeedMore` the whole input was consumed.
    pub fn advance(
        &mut self,
        req: &mut Request,
        input: &[u8],
    ) -> Result<(usize, ParseStatus), ParseError> {
        let mut pos = 0;
        loop {
            match self.state {
                State::Complete => return Ok((pos, ParseStatus::Complete)),
                State::RequestLine | State::Headers | State::ChunkSize | State::Trailers => {
                    match memchr(b'\n', &input[pos..]) {
                        None => {
                            self.line.extend_from_slice(&input[pos..]);
                            self.check_line_overflow()?;
                            return Ok((input.len(), ParseStatus::NeedMore));
                        }
                        Some(idx) => {
                            self.line.extend_from_slice(&input[pos..pos + idx]);
                            pos += idx + 1;
                            self.check_line_overflow()?;
                            if self.line.last() == Some(&b'\r') {
                                self.line.pop();
                            }
                            let line = std::mem::take(&mut self.line);
                            self.process_line(req, &line)?;
                        }
                    }
                }
                State::Body { remaining } => {
                    let take = (remaining as usize).min(input.len() - pos);
                    if take == 0 {
                        return Ok((pos, ParseStatus::NeedMore));
                    }
                    self.append_body(req, &input[pos..pos + take])?;
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::Complete
                    } else {
                        State::Body { remaining: left }
                    };
                }
                State::ChunkData { remaining } => {
                    let take = (remaining as usize).min(input.len() - pos);
                    if take == 0 {
                        return Ok((pos, ParseStatus::NeedMore));
                    }
                    self.append_body(req, &input[pos..pos + take])?;
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::ChunkDataEnd { seen_cr: false }
                    } else {
                        State::ChunkData { remaining: left }
                    };
                }
                State::ChunkDataEnd { seen_cr } => {
                    if pos == input.len() {
                        return Ok((pos, ParseStatus::NeedMore));
                    }
                    match input[pos] {
                        b'\r' if !seen_cr => {
                            self.state = State::ChunkDataEnd { seen_cr: true };
                            pos += 1;
                        }
                        b'\n' => {
                            self.state = State::ChunkSize;
                            pos += 1;
                        }
                        _ => return Err(ParseError::Protocol),
                    }
                }
            }
        }
    }

    fn check_line_overflow(&self) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => {
                if self.line.len() > self.url_max + REQUEST_LINE_SLACK {
                    return Err(ParseError::UrlTooLong);
                }
            }
            State::Headers => {
                if self.line.len() > HEADER_LINE_MAX {
                    return Err(match memchr(b':', &self.line) {
                        Some(colon) if colon <= MAX_HEADER_NAME => {
                            ParseError::HeaderValueTooLong
                        }
                        _ => ParseError::HeaderTooLong,
                    });
                }
            }
            State::ChunkSize | State::Trailers => {
                if self.line.len() > CHUNK_LINE_MAX {
                    return Err(ParseError::Protocol);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn process_line(&mut self, req: &mut Request, line: &[u8]) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => self.process_request_line(req, line),
            State::Headers => self.process_header_line(req, line),
            State::ChunkSize => self.process_chunk_size(req, line),
            State::Trailers => {
                if line.is_empty() {
                    self.state = State::Complete;
                }
                Ok(())
            }
            _ => unreachable!("not a line-oriented state"),
        }
    }

    fn process_request_line(&mut self, req: &mut Request, line: &[u8]) -> Result<(), ParseError> {
        // Leading empty lines before the request line are tolerated.
        if line.is_empty() {
            return Ok(());
        }
        let sp1 = memchr(b' ', line).ok_or(ParseError::Protocol)?;
        let rest = &line[sp1 + 1..];
        let sp2 = memchr(b' ', rest).ok_or(ParseError::Protocol)?;
        let method = &line[..sp1];
        let url = &rest[..sp2];
        let version = &rest[sp2 + 1..];

        if method.is_empty() || !method.iter().all(|b| b.is_ascii_alphabetic() || *b == b'-') {
            return Err(ParseError::Protocol);
        }
        if url.is_empty() {
            return Err(ParseError::Protocol);
        }
        if url.len() > self.url_max {
            return Err(ParseError::UrlTooLong);
        }

        req.http11 = match version {
            b"HTTP/1.1" => true,
            b"HTTP/1.0" => false,
            _ => return Err(ParseError::Protocol),
        };
        req.method = Method::from_bytes(method);
        let url = std::str::from_utf8(url).map_err(|_| ParseError::Protocol)?;
        req.set_url(url);

        self.state = State::Headers;
        Ok(())
    }

    fn process_header_line(&mut self, req: &mut Request, line: &[u8]) -> Result<(), ParseError> {
        if line.is_empty() {
            self.headers_done = true;
            return self.begin_body(req);
        }
        let colon = memchr(b':', line).ok_or(ParseError::Protocol)?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| *b == b' ' || *b == b'\t') {
            return Err(ParseError::Protocol);
        }
        if name.len() > MAX_HEADER_NAME {
            return Err(ParseError::HeaderTooLong);
        }
        let value = trim_ows(&line[colon + 1..]);
        if value.len() > MAX_HEADER_VALUE {
            return Err(ParseError::HeaderValueTooLong);
        }
        let name = std::str::from_utf8(name).map_err(|_| ParseError::Protocol)?;
        let value = std::str::from_utf8(value).map_err(|_| ParseError::Protocol)?;
        req.headers.append(name, value).map_err(|e| match e {
            HeaderError::NameTooLong => ParseError::HeaderTooLong,
            HeaderError::ValueTooLong => ParseError::HeaderValueTooLong,
            HeaderError::TooMany => ParseError::TooManyHeaders,
        })
    }

    fn begin_body(&mut self, req: &mut Request) -> Result<(), ParseError> {
        if let Some(te) = req.headers.get("Transfer-Encoding") {
            if contains_token(te, "chunked") {
                self.state = State::ChunkSize;
                return Ok(());
            }
            return Err(ParseError::Protocol);
        }
        match req.headers.get("Content-Length") {
            Some(v) => {
                let len: u64 = v.trim().parse().map_err(|_| ParseError::Protocol)?;
                if len > self.body_max as u64 {
                    return Err(ParseError::BodyTooLarge);
                }
                self.state = if len == 0 {
                    State::Complete
                } else {
                    State::Body { remaining: len }
                };
            }
            None => self.state = State::Complete,
        }
        Ok(())
    }

    fn process_chunk_size(&mut self, req: &mut Request, line: &[u8]) -> Result<(), ParseError> {
        // Chunk extensions after ';' are ignored.
        let size_part = match memchr(b';', line) {
            Some(idx) => &line[..idx],
            None => line,
        };
        let size_str = std::str::from_utf8(size_part)
            .map_err(|_| ParseError::Protocol)?
            .trim();
        if size_str.is_empty() {
            return Err(ParseError::Protocol);
        }
        let size = u64::from_str_radix(size_str, 16).map_err(|_| ParseError::Protocol)?;
        if size == 0 {
            self.state = State::Trailers;
            return Ok(());
        }
        if req.body().len() as u64 + size > self.body_max as u64 {
            return Err(ParseError::BodyTooLarge);
        }
        self.state = State::ChunkData { remaining: size };
        Ok(())
    }

    fn append_body(&self, req: &mut Request, data: &[u8]) -> Result<(), ParseError> {
        if req.body().len() + data.len() > self.body_max {
            return Err(ParseError::BodyTooLarge);
        }
        req.body_mut().extend_from_slice(data);
        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_ows(mut b: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = b {
        b = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = b {
        b = rest;
    }
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8]) -> Result<(Request, usize), ParseError> {
        let mut parser = Parser::new();
        let mut req = Request::new();
        let (consumed, status) = parser.advance(&mut req, input)?;
        assert_eq!(status, ParseStatus::Complete, "expected a complete message");
        Ok((req, consumed))
    }

    #[test]
    fn test_parse_basic_request() {
        let raw = b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";
        let (req, consumed) = parse_all(raw).unwrap();

        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path(), "/some/path");
        assert_eq!(req.query_string(), Some("foo=bar"));
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(consumed, raw.len());
        assert!(req.http11);
    }

    #[test]
    fn test_parse_byte_at_a_time() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = Parser::new();
        let mut req = Request::new();
        let mut done = false;
        for (i, b) in raw.iter().enumerate() {
            let (consumed, status) = parser.advance(&mut req, &[*b]).unwrap();
            if status == ParseStatus::Complete {
                assert_eq!(i, raw.len() - 1);
                assert_eq!(consumed, 1);
                done = true;
            }
        }
        assert!(done);
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.body(), b"hello");
    }

    #[test]
    fn test_residual_bytes_preserved() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\n";
        let mut parser = Parser::new();
        let mut req = Request::new();
        let (consumed, status) = parser.advance(&mut req, raw).unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(&raw[consumed..], b"GET /b HTTP/1.1\r\n");

        // The residue parses as the start of the next request after reset.
        parser.reset();
        let mut req2 = Request::new();
        let (_, status) = parser.advance(&mut req2, &raw[consumed..]).unwrap();
        assert_eq!(status, ParseStatus::NeedMore);
        let (_, status) = parser.advance(&mut req2, b"\r\n").unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(req2.url(), "/b");
    }

    #[test]
    fn test_chunked_body() {
        let raw = b"POST /up HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let (req, consumed) = parse_all(raw).unwrap();
        assert_eq!(req.body(), b"Wikipedia");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_chunk_extensions_ignored() {
        let raw = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3;ext=1\r\nabc\r\n0\r\n\r\n";
        let (req, _) = parse_all(raw).unwrap();
        assert_eq!(req.body(), b"abc");
    }

    #[test]
    fn test_malformed_request_line() {
        assert_eq!(
            parse_all(b"GARBAGE\r\n\r\n").unwrap_err(),
            ParseError::Protocol
        );
        assert_eq!(
            parse_all(b"GET /x HTTP/2.0\r\n\r\n").unwrap_err(),
            ParseError::Protocol
        );
        assert_eq!(
            parse_all(b"G@T /x HTTP/1.1\r\n\r\n").unwrap_err(),
            ParseError::Protocol
        );
    }

    #[test]
    fn test_url_length_boundary() {
        // Exactly URL_MAX: accepted.
        let url = format!("/{}", "a".repeat(URL_MAX_DEFAULT - 1));
        let raw = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", url);
        let (req, _) = parse_all(raw.as_bytes()).unwrap();
        assert_eq!(req.url().len(), URL_MAX_DEFAULT);

        // One byte over: parse error.
        let url = format!("/{}", "a".repeat(URL_MAX_DEFAULT));
        let raw = format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", url);
        assert_eq!(parse_all(raw.as_bytes()).unwrap_err(), ParseError::UrlTooLong);
    }

    #[test]
    fn test_header_value_boundary() {
        let v = "v".repeat(MAX_HEADER_VALUE);
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", v);
        let (req, _) = parse_all(raw.as_bytes()).unwrap();
        assert_eq!(req.header("X-Big").unwrap().len(), MAX_HEADER_VALUE);

        let v = "v".repeat(MAX_HEADER_VALUE + 1);
        let raw = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n\r\n", v);
        assert_eq!(
            parse_all(raw.as_bytes()).unwrap_err(),
            ParseError::HeaderValueTooLong
        );
    }

    #[test]
    fn test_header_name_too_long() {
        let n = "N".repeat(MAX_HEADER_NAME + 1);
        let raw = format!("GET / HTTP/1.1\r\n{}: v\r\n\r\n", n);
        assert_eq!(
            parse_all(raw.as_bytes()).unwrap_err(),
            ParseError::HeaderTooLong
        );
    }

    #[test]
    fn test_body_too_large() {
        let mut parser = Parser::with_limits(URL_MAX_DEFAULT, 16);
        let mut req = Request::new();
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n";
        assert_eq!(
            parser.advance(&mut req, raw).unwrap_err(),
            ParseError::BodyTooLarge
        );
        // Headers made it through, so a 400 is still possible.
        assert!(parser.headers_done());
        assert!(ParseError::BodyTooLarge.is_oversize());
    }

    #[test]
    fn test_lenient_close_with_trailing_bytes() {
        // Connection: close with pipelined trailing bytes must not fail the
        // current message; the residue is simply reported.
        let raw = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\ntrailing-garbage";
        let mut parser = Parser::new();
        let mut req = Request::new();
        let (consumed, status) = parser.advance(&mut req, raw).unwrap();
        assert_eq!(status, ParseStatus::Complete);
        assert_eq!(&raw[consumed..], b"trailing-garbage");
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_http10_defaults_to_close() {
        let raw = b"GET / HTTP/1.0\r\nHost: x\r\n\r\n";
        let (req, _) = parse_all(raw).unwrap();
        assert!(!req.http11);
        assert!(!req.keep_alive());
    }

    #[test]
    fn test_leading_crlf_tolerated() {
        let raw = b"\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let (req, _) = parse_all(raw).unwrap();
        assert_eq!(req.url(), "/");
    }

    #[test]
    fn test_obsolete_fold_rejected() {
        // A header line starting with whitespace has no valid name.
        let raw = b"GET / HTTP/1.1\r\nX-A: 1\r\n folded\r\n\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::Protocol);
    }

    #[test]
    fn test_parse_then_serialize_round_trips() {
        let raw = b"POST /submit?a=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody";
        let (req, _) = parse_all(raw).unwrap();

        let mut out = Vec::new();
        req.serialize_into(&mut out);
        assert_eq!(out, raw.to_vec());

        // And the re-serialized form parses to the same request.
        let (req2, _) = parse_all(&out).unwrap();
        assert_eq!(req2.method, req.method);
        assert_eq!(req2.url(), req.url());
        assert_eq!(req2.body(), req.body());
        assert_eq!(req2.headers.len(), req.headers.len());
    }

    #[test]
    fn test_bad_chunk_framing() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::Protocol);

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcX\r\n";
        assert_eq!(parse_all(raw).unwrap_err(), ParseError::Protocol);
    }
}
