//! WebSocket opening handshake, RFC 6455 version 13 only.

use crate::errors::{Error, Result};
use crate::http::request::Request;
use crate::http::types::header_has_token;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a client key.
pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID);
    BASE64.encode(hasher.finalize())
}

/// Validates the upgrade request headers and returns the client key.
///
/// Requires `Upgrade: websocket`, `Connection: upgrade`,
/// `Sec-WebSocket-Version: 13` and a key that decodes to 16 bytes; anything
/// else is a `400`.
pub(crate) fn validate_upgrade(req: &Request) -> Result<&str> {
    let upgrade = req.header("upgrade").ok_or(Error::BadUpgrade)?;
    if !header_has_token(upgrade, "websocket") {
        return Err(Error::BadUpgrade);
    }
    let connection = req.header("connection").ok_or(Error::BadUpgrade)?;
    if !header_has_token(connection, "upgrade") {
        return Err(Error::BadUpgrade);
    }
    if req.header("sec-websocket-version") != Some("13") {
        return Err(Error::BadUpgrade);
    }

    let key = req.header("sec-websocket-key").ok_or(Error::BadUpgrade)?;
    match BASE64.decode(key) {
        Ok(raw) if raw.len() == 16 => Ok(key),
        _ => Err(Error::BadUpgrade),
    }
}

/// `101 Switching Protocols` response completing the handshake.
pub(crate) fn response_bytes(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.extend_from_slice(b"upgrade: websocket\r\n");
    out.extend_from_slice(b"connection: upgrade\r\n");
    out.extend_from_slice(b"sec-websocket-accept: ");
    out.extend_from_slice(accept_key(key).as_bytes());
    out.extend_from_slice(b"\r\n\r\n");
    out
}

/// Whether a parsed request asks for a WebSocket upgrade at all, before any
/// validation of the remaining handshake headers.
pub(crate) fn is_upgrade_request(req: &Request) -> bool {
    req.header("upgrade")
        .is_some_and(|v| header_has_token(v, "websocket"))
}

#[cfg(test)]
mod handshake_tests {
    use super::*;

    // the worked example from RFC 6455 section 1.3
    const RFC_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const RFC_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn upgrade_request() -> Request {
        let mut req = Request::new();
        req.headers.insert("host", "example.com").unwrap();
        req.headers.insert("upgrade", "websocket").unwrap();
        req.headers.insert("connection", "Upgrade").unwrap();
        req.headers.insert("sec-websocket-version", "13").unwrap();
        req.headers.insert("sec-websocket-key", RFC_KEY).unwrap();
        req
    }

    #[test]
    fn rfc_example_accept() {
        assert_eq!(accept_key(RFC_KEY), RFC_ACCEPT);
    }

    #[test]
    fn valid_upgrade() {
        let req = upgrade_request();
        assert!(is_upgrade_request(&req));
        assert_eq!(validate_upgrade(&req).unwrap(), RFC_KEY);
    }

    #[test]
    fn connection_token_list() {
        let mut req = upgrade_request();
        req.headers.clear();
        req.headers.insert("upgrade", "websocket").unwrap();
        req.headers
            .insert("connection", "keep-alive, Upgrade")
            .unwrap();
        req.headers.insert("sec-websocket-version", "13").unwrap();
        req.headers.insert("sec-websocket-key", RFC_KEY).unwrap();
        assert!(validate_upgrade(&req).is_ok());
    }

    #[test]
    fn missing_or_malformed_headers() {
        // each mutation breaks exactly one handshake requirement
        let mutations: [fn(&mut Request); 5] = [
            |r| r.headers = {
                let mut h = crate::http::types::HeaderMap::new();
                h.insert("connection", "Upgrade").unwrap();
                h.insert("sec-websocket-version", "13").unwrap();
                h.insert("sec-websocket-key", RFC_KEY).unwrap();
                h
            },
            |r| r.headers = {
                let mut h = crate::http::types::HeaderMap::new();
                h.insert("upgrade", "websocket").unwrap();
                h.insert("sec-websocket-version", "13").unwrap();
                h.insert("sec-websocket-key", RFC_KEY).unwrap();
                h
            },
            |r| r.headers = {
                let mut h = crate::http::types::HeaderMap::new();
                h.insert("upgrade", "websocket").unwrap();
                h.insert("connection", "Upgrade").unwrap();
                h.insert("sec-websocket-version", "8").unwrap();
                h.insert("sec-websocket-key", RFC_KEY).unwrap();
                h
            },
            |r| r.headers = {
                let mut h = crate::http::types::HeaderMap::new();
                h.insert("upgrade", "websocket").unwrap();
                h.insert("connection", "Upgrade").unwrap();
                h.insert("sec-websocket-version", "13").unwrap();
                h
            },
            |r| r.headers = {
                let mut h = crate::http::types::HeaderMap::new();
                h.insert("upgrade", "websocket").unwrap();
                h.insert("connection", "Upgrade").unwrap();
                h.insert("sec-websocket-version", "13").unwrap();
                h.insert("sec-websocket-key", "too-short").unwrap();
                h
            },
        ];

        for (i, mutate) in mutations.into_iter().enumerate() {
            let mut req = upgrade_request();
            mutate(&mut req);
            assert!(matches!(validate_upgrade(&req), Err(Error::BadUpgrade)), "case {i}");
        }
    }

    #[test]
    fn response_contains_accept() {
        let bytes = response_bytes(RFC_KEY);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains(&format!("sec-websocket-accept: {RFC_ACCEPT}\r\n")));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
