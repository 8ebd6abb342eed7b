//! Parsed HTTP request, owned by its connection and reset between
//! keep-alive requests instead of reallocated.

use crate::http::types::{HeaderMap, Method, Version};
use std::net::SocketAddr;

/// Maximum captured route parameters per request.
pub(crate) const MAX_PARAMS: usize = 16;

/// A fully parsed HTTP request.
///
/// Instances are created by the connection when parsing begins and handed to
/// middleware and handlers by reference; the connection reuses the same
/// allocation for every request it serves.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) keep_alive: bool,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new() -> Self {
        Self {
            method: Method::Get,
            path: String::new(),
            query: String::new(),
            version: Version::Http11,
            headers: HeaderMap::new(),
            body: Vec::new(),
            params: Vec::with_capacity(MAX_PARAMS),
            keep_alive: true,
            peer_addr: None,
        }
    }

    /// Clears request content while keeping allocations. The peer address
    /// survives the reset; it belongs to the connection, not the request.
    pub(crate) fn reset(&mut self) {
        self.method = Method::Get;
        self.path.clear();
        self.query.clear();
        self.version = Version::Http11;
        self.headers.clear();
        self.body.clear();
        self.params.clear();
        self.keep_alive = true;
    }
}

// Public API
impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// Path component of the request target, without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`; empty when absent.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// First header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Route parameter captured by a `:name` pattern segment.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Whether the connection stays open after the response, per the
    /// HTTP version and `Connection` header.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Value of a single query parameter, unescaped verbatim.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == key).then_some(v)
        })
    }
}
