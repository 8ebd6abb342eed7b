//! HTTP response builder and wire encoder.

use crate::errors::{Error, Result};
use crate::http::types::{reason_phrase, HeaderMap, Version};
use std::path::PathBuf;

/// A file scheduled to be streamed by the connection writer instead of
/// buffered in memory.
#[derive(Debug, Clone)]
pub(crate) struct FileBody {
    pub(crate) path: PathBuf,
    pub(crate) len: u64,
    pub(crate) offset: u64,
}

/// HTTP response under construction.
///
/// Handlers set status, headers and body, then call [`send`](Response::send).
/// A handler that returns without sending (or returns an error) gets a
/// synthesised `500` as long as no bytes have hit the wire. The connection
/// owns the instance and reuses it across keep-alive requests.
#[derive(Debug)]
pub struct Response {
    pub(crate) status: u16,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) file: Option<FileBody>,
    pub(crate) headers_sent: bool,
    pub(crate) finished: bool,
    pub(crate) keep_alive: bool,
    max_body: usize,
}

impl Response {
    pub(crate) fn new(max_body: usize) -> Self {
        Self {
            status: 200,
            headers: HeaderMap::new(),
            body: Vec::new(),
            file: None,
            headers_sent: false,
            finished: false,
            keep_alive: true,
            max_body,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.file = None;
        self.headers_sent = false;
        self.finished = false;
        self.keep_alive = true;
    }
}

// Public API
impl Response {
    /// Sets the status code; values outside 100..=599 are refused.
    pub fn set_status(&mut self, code: u16) -> Result<&mut Self> {
        if !(100..=599).contains(&code) {
            return Err(Error::InvalidStatus(code));
        }
        self.status = code;
        Ok(self)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Adds a header. The name must match `[A-Za-z0-9-]+` and the value may
    /// not contain CR, LF or control bytes other than TAB.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Replaces the body. Payloads above the configured `max_body_size`
    /// ceiling are refused.
    pub fn set_body(&mut self, data: impl AsRef<[u8]>) -> Result<&mut Self> {
        let data = data.as_ref();
        if data.len() > self.max_body {
            return Err(Error::BodyTooLarge);
        }
        self.body.clear();
        self.body.extend_from_slice(data);
        self.file = None;
        Ok(self)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Forces `Connection: close` after this response.
    pub fn set_close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    /// Finalizes the response for writing.
    pub fn send(&mut self) {
        self.finished = true;
    }

    /// Status-only response with an empty body, finalized.
    pub fn send_status(&mut self, code: u16) -> Result<()> {
        self.set_status(code)?;
        self.body.clear();
        self.file = None;
        self.send();
        Ok(())
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }
}

// Engine side
impl Response {
    pub(crate) fn set_file(&mut self, file: FileBody) {
        self.body.clear();
        self.file = Some(file);
    }

    /// Body path for engine-served content (static cache, listings); not
    /// subject to the handler body ceiling.
    pub(crate) fn set_cached_body(&mut self, data: &[u8]) {
        self.body.clear();
        self.body.extend_from_slice(data);
        self.file = None;
    }

    fn body_len(&self) -> u64 {
        match &self.file {
            Some(file) => file.len,
            None => self.body.len() as u64,
        }
    }

    /// Serializes status line, headers and (for in-memory bodies) the body
    /// into one buffer, supplying `Content-Type: text/plain` and the
    /// computed `Content-Length` when the handler set neither. Exactly one
    /// status line and one blank line separate head from body. `HEAD`
    /// responses keep the length header but drop the payload.
    pub(crate) fn encode(&mut self, version: Version, keep_alive: bool, head_only: bool) -> Vec<u8> {
        let body_len = self.body_len();
        let mut out = Vec::with_capacity(128 + self.body.len());

        out.extend_from_slice(version.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(reason_phrase(self.status).as_bytes());
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.headers.get("content-type").is_none() && body_len > 0 {
            out.extend_from_slice(b"content-type: text/plain\r\n");
        }
        if self.headers.get("content-length").is_none() {
            out.extend_from_slice(b"content-length: ");
            out.extend_from_slice(body_len.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if let Some(conn) = connection_header(version, keep_alive) {
            out.extend_from_slice(b"connection: ");
            out.extend_from_slice(conn);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if !head_only && self.file.is_none() {
            out.extend_from_slice(&self.body);
        }

        self.headers_sent = true;
        out
    }
}

const fn connection_header(version: Version, keep_alive: bool) -> Option<&'static [u8]> {
    match (version, keep_alive) {
        (Version::Http11, true) => None,
        (Version::Http11, false) => Some(b"close"),
        (Version::Http10, true) => Some(b"keep-alive"),
        (Version::Http10, false) => Some(b"close"),
    }
}


#[cfg(test)]
mod encode_tests {
    use super::*;

    fn text(buf: &[u8]) -> &str {
        std::str::from_utf8(buf).unwrap()
    }

    #[test]
    fn default_headers_supplied() {
        let mut r = Response::new(1024);
        r.set_status(200).unwrap();
        r.set_body("Hello").unwrap();
        r.send();

        let out = r.encode(Version::Http11, true, false);
        let out = text(&out);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-type: text/plain\r\n"));
        assert!(out.contains("content-length: 5\r\n"));
        assert!(!out.contains("connection:"));
        assert!(out.ends_with("\r\n\r\nHello"));
        assert!(r.headers_sent());
    }

    #[test]
    fn explicit_content_type_wins() {
        let mut r = Response::new(1024);
        r.set_status(200).unwrap();
        r.set_header("content-type", "application/json").unwrap();
        r.set_body(r#"{"ok":true}"#).unwrap();
        r.send();

        let out = r.encode(Version::Http11, true, false);
        let out = text(&out);
        assert!(out.contains("content-type: application/json\r\n"));
        assert!(!out.contains("text/plain"));
    }

    #[test]
    fn connection_header_matrix() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, true,  None),
            (Version::Http11, false, Some("connection: close\r\n")),
            (Version::Http10, true,  Some("connection: keep-alive\r\n")),
            (Version::Http10, false, Some("connection: close\r\n")),
        ];

        for (version, keep_alive, expected) in cases {
            let mut r = Response::new(64);
            r.set_status(204).unwrap();
            r.send();
            let out = r.encode(version, keep_alive, false);
            let out = String::from_utf8(out).unwrap();
            match expected {
                Some(header) => assert!(out.contains(header), "{out}"),
                None => assert!(!out.contains("connection:"), "{out}"),
            }
        }
    }

    #[test]
    fn unknown_reason() {
        let mut r = Response::new(64);
        r.set_status(299).unwrap();
        r.send();
        let out = r.encode(Version::Http11, true, false);
        assert!(text(&out).starts_with("HTTP/1.1 299 Unknown\r\n"));
    }

    #[test]
    fn head_drops_body_keeps_length() {
        let mut r = Response::new(64);
        r.set_status(200).unwrap();
        r.set_body("payload").unwrap();
        r.send();
        let out = r.encode(Version::Http11, true, true);
        let out = text(&out);
        assert!(out.contains("content-length: 7\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn single_blank_line() {
        let mut r = Response::new(64);
        r.set_status(200).unwrap();
        r.set_body("a\r\n\r\nb").unwrap();
        r.send();
        let out = r.encode(Version::Http11, true, false);
        let out = text(&out);
        let head_end = out.find("\r\n\r\n").unwrap();
        // exactly one status line, head terminated by the first blank line
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
        assert_eq!(&out[head_end + 4..], "a\r\n\r\nb");
    }
}
