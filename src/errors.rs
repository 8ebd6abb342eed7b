use std::io;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failures the server can produce.
///
/// Wire-facing variants know their HTTP status ([`Error::status`]) and can be
/// rendered as a minimal close-delimited response. Parameter errors are
/// returned synchronously from configuration and registration calls and never
/// reach the wire.
#[derive(Debug, Error)]
pub enum Error {
    // Parameter
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("invalid route pattern `{0}`")]
    RoutePattern(String),
    #[error("route table full")]
    RouteTableFull,
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("invalid header value")]
    InvalidHeaderValue,
    #[error("status code {0} outside 100..=599")]
    InvalidStatus(u16),

    // Protocol
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("invalid HTTP method")]
    InvalidMethod,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("invalid chunked encoding")]
    InvalidChunk,
    #[error("read buffer full without parser progress")]
    StalledParser,
    #[error("malformed websocket upgrade request")]
    BadUpgrade,
    #[error("websocket protocol violation: {0}")]
    WsProtocol(&'static str),

    // Limit
    #[error("request URL too long")]
    UrlTooLong,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("header line too large")]
    HeaderTooLarge,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("websocket message too large")]
    WsMessageTooLarge,
    #[error("rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("connection limit reached")]
    Overloaded,

    // Resource
    #[error("handler failed")]
    Handler,

    // NotFound
    #[error("no route matched")]
    RouteNotFound,
    #[error("method not allowed for route")]
    MethodNotAllowed,

    // I/O and TLS
    #[error("websocket session closed")]
    WsClosed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("operation timed out")]
    Timeout,
    #[error("tls failure: {0}")]
    Tls(String),
}

/// Coarse classification of an [`Error`], mirroring how the server reacts:
/// parameter errors bubble to the caller, wire-facing kinds are rendered as a
/// response where possible, I/O and TLS tear the connection down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parameter,
    Protocol,
    Limit,
    Resource,
    NotFound,
    Io,
    Tls,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            Config(_) | RoutePattern(_) | RouteTableFull | InvalidHeaderName
            | InvalidHeaderValue | InvalidStatus(_) => ErrorKind::Parameter,
            InvalidRequestLine | InvalidMethod | UnsupportedVersion | InvalidHeader
            | InvalidContentLength | InvalidChunk | StalledParser | BadUpgrade
            | WsProtocol(_) => ErrorKind::Protocol,
            UrlTooLong | TooManyHeaders | HeaderTooLarge | BodyTooLarge
            | WsMessageTooLarge | RateLimited { .. } | Overloaded => ErrorKind::Limit,
            Handler => ErrorKind::Resource,
            RouteNotFound | MethodNotAllowed => ErrorKind::NotFound,
            WsClosed | Io(_) | Timeout => ErrorKind::Io,
            Tls(_) => ErrorKind::Tls,
        }
    }

    /// HTTP status this error renders as, `None` for errors that never reach
    /// the wire (parameter, I/O, TLS).
    pub(crate) fn status(&self) -> Option<u16> {
        use Error::*;
        match self {
            InvalidRequestLine | InvalidMethod | InvalidHeader | InvalidContentLength
            | InvalidChunk | StalledParser | BadUpgrade | UrlTooLong | TooManyHeaders
            | HeaderTooLarge => Some(400),
            UnsupportedVersion => Some(505),
            BodyTooLarge => Some(413),
            RateLimited { .. } => Some(429),
            Overloaded => Some(503),
            Handler => Some(500),
            RouteNotFound => Some(404),
            MethodNotAllowed => Some(405),
            WsProtocol(_) | WsMessageTooLarge => None,
            _ => None,
        }
    }

    /// Minimal close-delimited response for the error, written best-effort
    /// before the connection transitions to CLOSING.
    pub(crate) fn wire_response(&self) -> Option<Vec<u8>> {
        let status = self.status()?;
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(crate::http::types::reason_phrase(status).as_bytes());
        out.extend_from_slice(b"\r\nconnection: close\r\n");
        if let Error::RateLimited { retry_after } = self {
            out.extend_from_slice(b"retry-after: ");
            out.extend_from_slice(retry_after.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"content-length: 0\r\n\r\n");
        Some(out)
    }
}
