//! Incremental HTTP/1.x request parser.
//!
//! The parser is fed whatever the socket produced and consumes as much as it
//! can, accumulating partial lines internally so tokens spanning read
//! boundaries are reassembled correctly. Limits are enforced inside the
//! parser: over-long URLs and header lines, header count, body ceilings and
//! malformed chunked framing all fail before the request reaches dispatch.

use crate::errors::{Error, Result};
use crate::http::request::Request;
use crate::http::types::{self, Method, Version};
use memchr::memchr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    FixedBody,
    ChunkSize,
    ChunkData,
    ChunkDataEnd,
    Trailer,
    Complete,
}

#[derive(Debug, Clone)]
pub(crate) struct ParserLimits {
    pub(crate) max_url: usize,
    pub(crate) max_body: usize,
    pub(crate) max_header_bytes: usize,
}

impl ParserLimits {
    // request line = method + target + version + separators
    fn line_cap(&self, state: State) -> usize {
        match state {
            State::RequestLine => self.max_url + 32,
            State::Headers | State::Trailer => {
                types::MAX_HEADER_NAME + types::MAX_HEADER_VALUE + 4
            }
            _ => 128,
        }
    }
}

#[derive(Debug)]
pub(crate) struct RequestParser {
    state: State,
    line: Vec<u8>,
    header_bytes: usize,
    content_length: Option<usize>,
    chunked: bool,
    remaining: usize,
    limits: ParserLimits,
}

impl RequestParser {
    pub(crate) fn new(limits: ParserLimits) -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::with_capacity(256),
            header_bytes: 0,
            content_length: None,
            chunked: false,
            remaining: 0,
            limits,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.state = State::RequestLine;
        self.line.clear();
        self.header_bytes = 0;
        self.content_length = None;
        self.chunked = false;
        self.remaining = 0;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Consumes bytes from `input` into `req`, returning how many were
    /// taken. Bytes past a completed request are left untouched for the
    /// next pipelined request.
    pub(crate) fn advance(&mut self, input: &[u8], req: &mut Request) -> Result<usize> {
        let mut pos = 0;

        while pos < input.len() && self.state != State::Complete {
            match self.state {
                State::RequestLine
                | State::Headers
                | State::ChunkSize
                | State::ChunkDataEnd
                | State::Trailer => match memchr(b'\n', &input[pos..]) {
                    Some(idx) => {
                        self.push_line(&input[pos..pos + idx])?;
                        pos += idx + 1;
                        if self.line.last() == Some(&b'\r') {
                            self.line.pop();
                        }
                        self.consume_line(req)?;
                    }
                    None => {
                        self.push_line(&input[pos..])?;
                        pos = input.len();
                    }
                },
                State::FixedBody => {
                    let take = (input.len() - pos).min(self.remaining);
                    req.body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = State::Complete;
                    }
                }
                State::ChunkData => {
                    let take = (input.len() - pos).min(self.remaining);
                    req.body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = State::ChunkDataEnd;
                    }
                }
                State::Complete => unreachable!(),
            }
        }

        Ok(pos)
    }

    fn push_line(&mut self, bytes: &[u8]) -> Result<()> {
        if self.line.len() + bytes.len() > self.limits.line_cap(self.state) {
            return Err(match self.state {
                State::RequestLine => Error::UrlTooLong,
                State::Headers | State::Trailer => Error::HeaderTooLarge,
                _ => Error::InvalidChunk,
            });
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    fn consume_line(&mut self, req: &mut Request) -> Result<()> {
        match self.state {
            State::RequestLine => self.parse_request_line(req),
            State::Headers => self.parse_header_line(req),
            State::ChunkSize => self.parse_chunk_size(req),
            State::ChunkDataEnd => {
                if !self.line.is_empty() {
                    return Err(Error::InvalidChunk);
                }
                self.line.clear();
                self.state = State::ChunkSize;
                Ok(())
            }
            State::Trailer => {
                // trailers are discarded; decode only
                if self.line.is_empty() {
                    self.state = State::Complete;
                }
                self.line.clear();
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn parse_request_line(&mut self, req: &mut Request) -> Result<()> {
        if self.line.is_empty() {
            // tolerate blank lines between keep-alive requests
            return Ok(());
        }

        let result = (|| {
            let mut parts = self.line.splitn(3, |b| *b == b' ');
            let method = parts.next().ok_or(Error::InvalidRequestLine)?;
            let target = parts.next().ok_or(Error::InvalidRequestLine)?;
            let version = parts.next().ok_or(Error::InvalidRequestLine)?;

            req.method = Method::from_bytes(method)?;
            if target.len() > self.limits.max_url {
                return Err(Error::UrlTooLong);
            }
            if !types::valid_path(target) {
                return Err(Error::InvalidRequestLine);
            }
            req.version = Version::from_bytes(version)?;
            req.keep_alive = req.version.default_keep_alive();

            let target = std::str::from_utf8(target).map_err(|_| Error::InvalidRequestLine)?;
            match target.split_once('?') {
                Some((path, query)) => {
                    req.path.push_str(path);
                    req.query.push_str(query);
                }
                None => req.path.push_str(target),
            }
            Ok(())
        })();

        self.line.clear();
        self.state = State::Headers;
        result
    }

    fn parse_header_line(&mut self, req: &mut Request) -> Result<()> {
        if self.line.is_empty() {
            return self.finish_headers(req);
        }

        self.header_bytes += self.line.len() + 2;
        if self.header_bytes > self.limits.max_header_bytes {
            self.line.clear();
            return Err(Error::HeaderTooLarge);
        }

        let result = (|| {
            let colon = memchr(b':', &self.line).ok_or(Error::InvalidHeader)?;
            let name = &self.line[..colon];
            let value = trim_ows(&self.line[colon + 1..]);

            if !types::valid_header_name(name) || !types::valid_header_value(value) {
                return Err(Error::InvalidHeader);
            }
            let name = std::str::from_utf8(name).map_err(|_| Error::InvalidHeader)?;
            let value = std::str::from_utf8(value).map_err(|_| Error::InvalidHeader)?;

            if name.eq_ignore_ascii_case("content-length") {
                if self.content_length.is_some() {
                    return Err(Error::InvalidContentLength);
                }
                let len = parse_decimal(value.as_bytes()).ok_or(Error::InvalidContentLength)?;
                if len > self.limits.max_body {
                    return Err(Error::BodyTooLarge);
                }
                self.content_length = Some(len);
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && types::header_has_token(value, "chunked")
            {
                self.chunked = true;
            }

            req.headers.insert(name, value)
        })();

        self.line.clear();
        result
    }

    fn finish_headers(&mut self, req: &mut Request) -> Result<()> {
        self.line.clear();

        if let Some(connection) = req.headers.get("connection") {
            if types::header_has_token(connection, "close") {
                req.keep_alive = false;
            } else if types::header_has_token(connection, "keep-alive") {
                req.keep_alive = true;
            }
        }

        if self.chunked {
            self.state = State::ChunkSize;
        } else {
            match self.content_length {
                Some(len) if len > 0 => {
                    req.body.reserve(len.saturating_sub(req.body.capacity()));
                    self.remaining = len;
                    self.state = State::FixedBody;
                }
                _ => self.state = State::Complete,
            }
        }
        Ok(())
    }

    fn parse_chunk_size(&mut self, req: &mut Request) -> Result<()> {
        let result = (|| {
            let digits = match memchr(b';', &self.line) {
                Some(idx) => &self.line[..idx],
                None => &self.line[..],
            };
            let size = parse_hex(digits).ok_or(Error::InvalidChunk)?;

            if size == 0 {
                self.state = State::Trailer;
                return Ok(());
            }
            if req.body.len() + size > self.limits.max_body {
                return Err(Error::BodyTooLarge);
            }
            self.remaining = size;
            self.state = State::ChunkData;
            Ok(())
        })();

        self.line.clear();
        result
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn parse_decimal(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        result = result.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(result)
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() {
        return None;
    }
    let mut result: usize = 0;
    for b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        result = result.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(result)
}

#[cfg(test)]
mod parser_tests {
    use super::*;

    fn limits() -> ParserLimits {
        ParserLimits {
            max_url: 2048,
            max_body: 1024 * 1024,
            max_header_bytes: 8192,
        }
    }

    fn parse(input: &[u8]) -> Result<(Request, usize)> {
        parse_by(input, input.len().max(1))
    }

    // feeds `step` bytes at a time to exercise boundary-spanning tokens
    fn parse_by(input: &[u8], step: usize) -> Result<(Request, usize)> {
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        let mut total = 0;
        for piece in input.chunks(step) {
            total += parser.advance(piece, &mut req)?;
            if parser.is_complete() {
                break;
            }
        }
        assert!(parser.is_complete(), "parser did not complete");
        Ok((req, total))
    }

    #[test]
    fn simple_get() {
        let (req, consumed) = parse(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.path(), "/hello");
        assert_eq!(req.query(), "");
        assert_eq!(req.version(), Version::Http11);
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.keep_alive());
        assert_eq!(consumed, 32);
    }

    #[test]
    fn query_split() {
        let (req, _) = parse(b"GET /api/find?user=qwe&id=223 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/api/find");
        assert_eq!(req.query(), "user=qwe&id=223");
        assert_eq!(req.query_param("user"), Some("qwe"));
        assert_eq!(req.query_param("id"), Some("223"));
    }

    #[test]
    fn body_with_content_length() {
        let (req, _) =
            parse(b"POST /upload HTTP/1.1\r\nContent-Length: 12\r\n\r\nHello world!").unwrap();
        assert_eq!(req.body(), b"Hello world!");
    }

    #[test]
    fn byte_at_a_time() {
        let input = b"POST /upload HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"data\": \"value\"}";
        let (req, _) = parse_by(input, 1).unwrap();
        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.body(), b"{\"data\": \"value\"}");
    }

    #[test]
    fn chunked_body() {
        let input = b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n7\r\n, world\r\n0\r\n\r\n";
        for step in [1, 3, input.len()] {
            let (req, _) = parse_by(input, step).unwrap();
            assert_eq!(req.body(), b"Hello, world", "step {step}");
        }
    }

    #[test]
    fn chunk_extensions_ignored() {
        let input = b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nHello\r\n0\r\n\r\n";
        let (req, _) = parse(input).unwrap();
        assert_eq!(req.body(), b"Hello");
    }

    #[test]
    fn pipelined_leftover_untouched() {
        let input = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        let consumed = parser.advance(input, &mut req).unwrap();
        assert!(parser.is_complete());
        assert_eq!(req.path(), "/a");
        assert_eq!(consumed, 19);

        parser.reset();
        req.reset();
        let consumed = parser.advance(&input[19..], &mut req).unwrap();
        assert!(parser.is_complete());
        assert_eq!(req.path(), "/b");
        assert_eq!(consumed, 19);
    }

    #[test]
    fn keep_alive_matrix() {
        #[rustfmt::skip]
        let cases = [
            (&b"GET / HTTP/1.1\r\n\r\n"[..],                                   true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n",                   false),
            (b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",              true),
            (b"GET / HTTP/1.0\r\n\r\n",                                        false),
            (b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",              true),
            (b"GET / HTTP/1.0\r\nConnection: close\r\n\r\n",                   false),
            (b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n",     true),
        ];

        for (input, keep_alive) in cases {
            let (req, _) = parse(input).unwrap();
            assert_eq!(req.keep_alive(), keep_alive, "{:?}", std::str::from_utf8(input));
        }
    }

    #[test]
    fn invalid_requests() {
        #[rustfmt::skip]
        let cases: [(&[u8], fn(&Error) -> bool); 9] = [
            (b"PYU / HTTP/1.1\r\n\r\n",            |e| matches!(e, Error::InvalidMethod)),
            (b"GET relative HTTP/1.1\r\n\r\n",     |e| matches!(e, Error::InvalidRequestLine)),
            (b"GET /a<b HTTP/1.1\r\n\r\n",         |e| matches!(e, Error::InvalidRequestLine)),
            (b"GET / HTTP/2.0\r\n\r\n",            |e| matches!(e, Error::UnsupportedVersion)),
            (b"GET / HTTP/1.1\r\nNoColon\r\n\r\n", |e| matches!(e, Error::InvalidHeader)),
            (b"GET / HTTP/1.1\r\nBad Name: v\r\n\r\n", |e| matches!(e, Error::InvalidHeader)),
            (b"POST / HTTP/1.1\r\nContent-Length: 12x\r\n\r\n", |e| matches!(e, Error::InvalidContentLength)),
            (b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n", |e| matches!(e, Error::InvalidContentLength)),
            (b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n", |e| matches!(e, Error::InvalidChunk)),
        ];

        for (input, check) in cases {
            let mut parser = RequestParser::new(limits());
            let mut req = Request::new();
            let err = parser.advance(input, &mut req).unwrap_err();
            assert!(check(&err), "{:?} -> {err:?}", std::str::from_utf8(input));
        }
    }

    #[test]
    fn url_length_boundary() {
        let ok = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(2047));
        assert!(parse(ok.as_bytes()).is_ok());

        let over = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(2048));
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        let err = parser.advance(over.as_bytes(), &mut req).unwrap_err();
        assert!(matches!(err, Error::UrlTooLong));
    }

    #[test]
    fn header_count_boundary() {
        let ok: String = (0..32).map(|i| format!("h-{i}: v\r\n")).collect();
        let request = format!("GET / HTTP/1.1\r\n{ok}\r\n");
        assert!(parse(request.as_bytes()).is_ok());

        let over: String = (0..33).map(|i| format!("h-{i}: v\r\n")).collect();
        let request = format!("GET / HTTP/1.1\r\n{over}\r\n");
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        let err = parser.advance(request.as_bytes(), &mut req).unwrap_err();
        assert!(matches!(err, Error::TooManyHeaders));
    }

    #[test]
    fn body_over_limit() {
        let input = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", 1024 * 1024 + 1);
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        let err = parser.advance(input.as_bytes(), &mut req).unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge));
    }

    #[test]
    fn chunked_body_over_limit() {
        let mut parser = RequestParser::new(ParserLimits {
            max_body: 8,
            ..limits()
        });
        let mut req = Request::new();
        let input = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n9\r\n123456789\r\n0\r\n\r\n";
        let err = parser.advance(input, &mut req).unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge));
    }

    #[test]
    fn reset_reuses_state() {
        let mut parser = RequestParser::new(limits());
        let mut req = Request::new();
        parser
            .advance(b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nab", &mut req)
            .unwrap();
        assert!(parser.is_complete());

        parser.reset();
        req.reset();
        parser.advance(b"GET /b HTTP/1.1\r\n\r\n", &mut req).unwrap();
        assert!(parser.is_complete());
        assert_eq!(req.path(), "/b");
        assert!(req.body().is_empty());
    }
}
