//! Typed server configuration.
//!
//! The crate consumes only this record; populating it from a file or from
//! the environment is the job of an external loader. Defaults are
//! conservative and [`ServerConfig::validate`] refuses out-of-range values
//! at configuration time rather than at request time.

use crate::errors::{Error, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level server configuration.
///
/// Construct with struct-update syntax:
/// ```
/// use ember_web::ServerConfig;
///
/// let config = ServerConfig {
///     max_connections: 512,
///     max_body_size: 64 * 1024,
///     ..ServerConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrently served connections (default: `2048`).
    ///
    /// One worker task is created per slot at build time. When all slots are
    /// busy and the admission queue is full, new connections receive an
    /// immediate `503` with `Connection: close`.
    pub max_connections: usize,

    /// Admission queue depth between accept and the workers (default: `256`).
    pub max_pending_connections: usize,

    /// Per-connection read buffer size in bytes (default: `8192`).
    pub read_buffer_size: usize,

    /// Listen backlog passed to the OS (default: `256`).
    pub backlog: i32,

    /// Idle time allowed between keep-alive requests (default: `30 s`).
    pub keepalive_timeout: Duration,

    /// Per-connection inactivity timeout, rearmed on any read or write
    /// progress (default: `60 s`, accepted range 5–300 s).
    pub request_timeout: Duration,

    /// Requests served on one connection before it is closed (default: `100`).
    pub max_requests_per_connection: usize,

    /// Maximum request body size in bytes (default: `1 MiB`).
    pub max_body_size: usize,

    /// Maximum cumulative header bytes per request (default: `8192`).
    pub max_header_size: usize,

    /// Maximum request-target length in bytes (default: `2048`).
    pub max_url_size: usize,

    /// Fixed-window rate limiting, server-wide.
    pub rate_limit: RateLimitConfig,

    /// TLS termination; plain TCP when `enabled` is false.
    pub tls: TlsConfig,

    /// Static file service; disabled when `None`.
    pub static_files: Option<StaticConfig>,

    /// WebSocket engine tuning and managed-connection registry.
    pub ws: WsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 2048,
            max_pending_connections: 256,
            read_buffer_size: 8192,
            backlog: 256,
            keepalive_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            max_requests_per_connection: 100,
            max_body_size: 1024 * 1024,
            max_header_size: 8192,
            max_url_size: 2048,
            rate_limit: RateLimitConfig::default(),
            tls: TlsConfig::default(),
            static_files: None,
            ws: WsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Checks every bound this record documents. Called by the server
    /// builder; also usable directly by configuration loaders.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1"));
        }
        if self.read_buffer_size < 512 {
            return Err(Error::Config("read_buffer_size must be at least 512"));
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be positive"));
        }
        let timeout = self.request_timeout.as_secs();
        if !(5..=300).contains(&timeout) {
            return Err(Error::Config("request_timeout must be within 5..=300 seconds"));
        }
        if self.max_body_size == 0 || self.max_url_size == 0 || self.max_header_size == 0 {
            return Err(Error::Config("size limits must be non-zero"));
        }
        self.rate_limit.validate()?;
        self.ws.validate()?;
        if self.tls.enabled && (self.tls.cert_file.as_os_str().is_empty() || self.tls.key_file.as_os_str().is_empty()) {
            return Err(Error::Config("tls enabled without cert_file/key_file"));
        }
        Ok(())
    }
}

/// Fixed-window rate limiting. The counter is server-wide, not per peer;
/// addresses on the whitelist bypass the limiter entirely.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests admitted per window (accepted range 1..=1_000_000).
    pub max_requests: u32,
    /// Window length in seconds (accepted range 1..=86_400).
    pub window_seconds: u64,
    /// Peer addresses exempt from limiting.
    pub whitelist: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 100,
            window_seconds: 60,
            whitelist: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !(1..=1_000_000).contains(&self.max_requests) {
            return Err(Error::Config("rate_limit.max_requests must be within 1..=1_000_000"));
        }
        if !(1..=86_400).contains(&self.window_seconds) {
            return Err(Error::Config("rate_limit.window_seconds must be within 1..=86_400"));
        }
        Ok(())
    }
}

/// TLS termination settings. Certificates are loaded once at build time;
/// handshake failures are not retried.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Static file service settings.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Directory every request path is resolved under. Resolutions escaping
    /// this root are refused.
    pub root: PathBuf,
    /// File served when the resolved path is a directory (default:
    /// `index.html`).
    pub index_file: String,
    /// Emit an HTML index for directories without an index file
    /// (default: `false`).
    pub enable_directory_listing: bool,
    /// Emit `ETag` and honour `If-None-Match` (default: `true`).
    pub enable_etag: bool,
    /// `Cache-Control` value emitted with file responses.
    pub cache_control: String,
    /// In-memory cache ceiling in bytes (default: `32 MiB`).
    pub max_cache_size: usize,
    /// Seconds before a cached entry is considered stale (default: `60`).
    pub cache_ttl: u64,
    /// Maximum number of cached entries (default: `1024`).
    pub max_cache_entries: usize,
    /// Chunked streaming for files too large for the cache path.
    pub sendfile: SendfileConfig,
}

impl StaticConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_file: "index.html".to_string(),
            enable_directory_listing: false,
            enable_etag: true,
            cache_control: "public, max-age=3600".to_string(),
            max_cache_size: 32 * 1024 * 1024,
            cache_ttl: 60,
            max_cache_entries: 1024,
            sendfile: SendfileConfig::default(),
        }
    }
}

/// Tuning for the chunked zero-copy-style file writer used for files above
/// the in-memory threshold.
#[derive(Debug, Clone)]
pub struct SendfileConfig {
    /// Per-chunk write timeout in milliseconds (default: `5000`).
    pub timeout_ms: u64,
    /// Retries per chunk before the transfer is abandoned (default: `3`).
    pub max_retry: u32,
    /// Chunk size in bytes; files larger than this stream instead of being
    /// cached (default: `64 KiB`).
    pub chunk_size: usize,
}

impl Default for SendfileConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_retry: 3,
            chunk_size: 64 * 1024,
        }
    }
}

/// WebSocket engine settings.
///
/// Registry intervals are in seconds; only the ping timeout is in
/// milliseconds, and each field name carries its unit.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Track sessions in the managed registry and run the heartbeat and
    /// timeout timers (default: `false`).
    pub connection_management: bool,
    /// Sessions idle longer than this are closed with `1001`
    /// (default: `300`).
    pub timeout_seconds: u64,
    /// Idle interval after which a PING is sent (default: `30`).
    pub heartbeat_interval: u64,
    /// An unanswered PING older than this closes the session with `1001`
    /// (default: `10_000`).
    pub ping_timeout_ms: u64,
    /// Largest single frame accepted before closing with `1009`
    /// (default: `16 MiB`).
    pub max_frame_size: usize,
    /// Largest assembled message accepted before closing with `1009`
    /// (default: `64 MiB`).
    pub max_message_size: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connection_management: false,
            timeout_seconds: 300,
            heartbeat_interval: 30,
            ping_timeout_ms: 10_000,
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
        }
    }
}

impl WsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connection_management {
            if self.timeout_seconds == 0 || self.heartbeat_interval == 0 || self.ping_timeout_ms == 0 {
                return Err(Error::Config("ws timers must be non-zero"));
            }
        }
        if self.max_frame_size == 0 || self.max_message_size < self.max_frame_size {
            return Err(Error::Config("ws.max_message_size must be at least ws.max_frame_size"));
        }
        Ok(())
    }
}
