//! Per-connection finite state machine.
//!
//! Each worker owns one `Connection` and drives it through the lifecycle:
//! optional TLS handshake, incremental request parse, dispatch through rate
//! limiting, WebSocket upgrade, middleware and routing, response write, and
//! either a keep-alive reset or teardown. All connection-local state lives
//! here; cross-connection state is reached through the shared server inner.

use crate::errors::{Error, Result};
use crate::http::parser::{ParserLimits, RequestParser};
use crate::http::request::Request;
use crate::http::response::{FileBody, Response};
use crate::http::types::Method;
use crate::limiter::RateDecision;
use crate::middleware::Flow;
use crate::router::RouteLookup;
use crate::server::server::Shared;
use crate::server::tls::Transport;
use crate::upgrade::ProtocolUpgrade;
use crate::ws::session::{WsSender, WsSession};
use crate::ws::{handshake, WsAuthResult, WsRoute};
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    New,
    TlsHandshake,
    HttpReading,
    HttpProcessing,
    HttpWriting,
    ProtocolUpgraded,
    Closing,
}

enum ReadOutcome {
    Request,
    /// Clean EOF between requests.
    Eof,
}

pub(crate) struct Connection {
    shared: Arc<Shared>,
    state: ConnState,
    parser: RequestParser,
    request: Request,
    response: Response,
    /// Unparsed inbound bytes; survives keep-alive resets so pipelined
    /// requests are not lost.
    buf: Vec<u8>,
    scratch: Vec<u8>,
    request_count: usize,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let config = shared.config.clone();
        let parser = RequestParser::new(ParserLimits {
            max_url: config.max_url_size,
            max_body: config.max_body_size,
            max_header_bytes: config.max_header_size,
        });
        let response = Response::new(config.max_body_size);
        let scratch = vec![0u8; config.read_buffer_size];
        Self {
            shared,
            state: ConnState::New,
            parser,
            request: Request::new(),
            response,
            buf: Vec::with_capacity(config.read_buffer_size),
            scratch,
            request_count: 0,
        }
    }

    /// Serves one accepted socket to completion. The worker reuses this
    /// `Connection` for the next socket afterwards.
    pub(crate) async fn run(&mut self, stream: TcpStream, peer: SocketAddr) {
        self.set_state(ConnState::New);
        self.request_count = 0;
        self.buf.clear();
        self.parser.reset();
        self.request.reset();
        self.response.reset();
        self.request.peer_addr = Some(peer);

        let mut transport = match self.establish(stream).await {
            Some(transport) => transport,
            None => {
                self.set_state(ConnState::Closing);
                return;
            }
        };

        if let Err(error) = self.serve(&mut transport).await {
            if !self.response.headers_sent {
                if let Some(bytes) = error.wire_response() {
                    let _ = timeout(self.shared.config.request_timeout, transport.write_all(&bytes))
                        .await;
                }
            }
            tracing::debug!(%error, %peer, "connection closed on error");
        }

        self.set_state(ConnState::Closing);
        let _ = transport.shutdown().await;
    }

    async fn establish(&mut self, stream: TcpStream) -> Option<Transport> {
        match self.shared.tls.clone() {
            None => Some(Transport::Plain(stream)),
            Some(acceptor) => {
                self.set_state(ConnState::TlsHandshake);
                // handshake failures are not retried
                match timeout(self.shared.config.request_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => Some(Transport::Tls(Box::new(tls))),
                    Ok(Err(error)) => {
                        tracing::debug!(%error, "tls handshake failed");
                        None
                    }
                    Err(_) => {
                        tracing::debug!("tls handshake timed out");
                        None
                    }
                }
            }
        }
    }

    async fn serve(&mut self, transport: &mut Transport) -> Result<()> {
        loop {
            self.set_state(ConnState::HttpReading);
            match self.read_request(transport).await? {
                ReadOutcome::Eof => return Ok(()),
                ReadOutcome::Request => {}
            }

            self.set_state(ConnState::HttpProcessing);

            if let RateDecision::Reject { retry_after } = self
                .shared
                .limiter
                .check(self.request.peer_addr.map(|a| a.ip()))
            {
                self.response.set_status(429)?;
                self.response
                    .set_header("retry-after", &retry_after.to_string())?;
                self.response.set_body("Too Many Requests")?;
                self.response.send();
            } else if self.request.header("upgrade").is_some() {
                if handshake::is_upgrade_request(&self.request) {
                    if let Some(route) = self.shared.find_ws_route(self.request.path()) {
                        return self.upgrade_websocket(transport, route).await;
                    }
                }
                if let Some(upgrade) = self.shared.find_protocol_upgrade(&self.request) {
                    return self.upgrade_custom(transport, upgrade).await;
                }
                self.dispatch().await?;
            } else {
                self.dispatch().await?;
            }

            let keep_alive = self.write_response(transport).await?;
            if !keep_alive {
                return Ok(());
            }

            // keep-alive reset: request, response and parser state clear,
            // socket and buffered pipelined bytes stay
            self.parser.reset();
            self.request.reset();
            self.response.reset();
        }
    }

    /// Reads until the parser has one complete request. The first wait of a
    /// follow-up request uses the keep-alive timeout; every later read is
    /// bounded by the request timeout.
    async fn read_request(&mut self, transport: &mut Transport) -> Result<ReadOutcome> {
        let mut progressed = false;

        loop {
            if !self.buf.is_empty() {
                let consumed = self.parser.advance(&self.buf, &mut self.request)?;
                self.buf.drain(..consumed);
                progressed |= consumed > 0;
                if self.parser.is_complete() {
                    return Ok(ReadOutcome::Request);
                }
                if consumed == 0 && self.buf.len() >= self.shared.config.read_buffer_size {
                    return Err(Error::StalledParser);
                }
            }

            let wait = if !progressed && self.request_count > 0 {
                self.shared.config.keepalive_timeout
            } else {
                self.shared.config.request_timeout
            };
            let read = timeout(wait, transport.read(&mut self.scratch))
                .await
                .map_err(|_| Error::Timeout)?;
            let n = read?;
            if n == 0 {
                return if progressed {
                    Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof inside request",
                    )))
                } else {
                    Ok(ReadOutcome::Eof)
                };
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Middleware, routing, the user handler and the static fallback. The
    /// health endpoint answers first so monitoring is never gated by
    /// middleware.
    async fn dispatch(&mut self) -> Result<()> {
        if let Some(path) = &self.shared.health_path {
            if self.request.path() == path
                && matches!(self.request.method, Method::Get | Method::Head)
            {
                return self.respond_health();
            }
        }

        let flow = self.shared.middleware.run(&self.request, &mut self.response);
        if flow == Flow::Stop || self.response.finished {
            return Ok(());
        }

        match self
            .shared
            .router
            .find(self.request.method, &self.request.path)
        {
            RouteLookup::Found { handler, params } => {
                self.request.params = params;
                let outcome = (handler.as_ref())(&self.request, &mut self.response);
                if outcome.is_err() || !self.response.finished {
                    self.synthesize(500, "Internal Server Error");
                }
            }
            RouteLookup::MethodMismatch => self.synthesize(405, "Method Not Allowed"),
            RouteLookup::NotFound => match &self.shared.statics {
                Some(statics) if matches!(self.request.method, Method::Get | Method::Head) => {
                    match statics.handle(&self.request, &mut self.response).await {
                        Ok(()) => {}
                        Err(Error::RouteNotFound) => self.synthesize(404, "Not Found"),
                        Err(Error::MethodNotAllowed) => self.synthesize(405, "Method Not Allowed"),
                        Err(error) => {
                            tracing::warn!(%error, path = self.request.path(), "static serve failed");
                            self.synthesize(500, "Internal Server Error");
                        }
                    }
                }
                _ => self.synthesize(404, "Not Found"),
            },
        }
        Ok(())
    }

    fn synthesize(&mut self, status: u16, body: &str) {
        if self.response.headers_sent {
            return;
        }
        let keep_alive = self.response.keep_alive;
        self.response.reset();
        self.response.keep_alive = keep_alive;
        self.response.status = status;
        self.response.set_cached_body(body.as_bytes());
        self.response.send();
    }

    fn respond_health(&mut self) -> Result<()> {
        let uptime = self.shared.started.elapsed().as_secs();
        let active = self.shared.active_connections.load(Ordering::Relaxed);
        let requests = self.shared.total_requests.load(Ordering::Relaxed);
        let errors = self.shared.total_errors.load(Ordering::Relaxed);
        let (status, message, code) = health_status(requests, errors);

        let body = format!(
            r#"{{"status":"{status}","message":"{message}","uptime_seconds":{uptime},"active_connections":{active},"total_requests":{requests},"total_errors":{errors}}}"#
        );
        self.response.set_status(code)?;
        self.response.set_header("content-type", "application/json")?;
        self.response.set_cached_body(body.as_bytes());
        self.response.send();
        Ok(())
    }

    async fn write_response(&mut self, transport: &mut Transport) -> Result<bool> {
        self.set_state(ConnState::HttpWriting);

        self.shared.total_requests.fetch_add(1, Ordering::Relaxed);
        if self.response.status >= 500 {
            self.shared.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.request_count += 1;
        let keep_alive = self.request.keep_alive
            && self.response.keep_alive
            && self.request_count < self.shared.config.max_requests_per_connection;
        let head_only = self.request.method == Method::Head;

        let head = self
            .response
            .encode(self.request.version, keep_alive, head_only);
        self.write_with_timeout(transport, &head).await?;

        if let Some(file) = self.response.file.take() {
            if !head_only {
                self.stream_file(transport, file).await?;
            }
        }
        transport.flush().await?;

        Ok(keep_alive)
    }

    async fn write_with_timeout(&self, transport: &mut Transport, bytes: &[u8]) -> Result<()> {
        timeout(self.shared.config.request_timeout, transport.write_all(bytes))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    /// Sendfile-style transfer: the file is copied to the socket in
    /// configured chunks, each write bounded by the configured timeout and
    /// retried up to the configured count.
    async fn stream_file(&self, transport: &mut Transport, body: FileBody) -> Result<()> {
        let sendfile = self
            .shared
            .statics
            .as_ref()
            .map(|s| s.sendfile().clone())
            .unwrap_or_default();
        let chunk_timeout = Duration::from_millis(sendfile.timeout_ms);

        let mut file = tokio::fs::File::open(&body.path).await?;
        if body.offset > 0 {
            file.seek(SeekFrom::Start(body.offset)).await?;
        }

        let mut chunk = vec![0u8; sendfile.chunk_size];
        let mut remaining = body.len;
        while remaining > 0 {
            let take = chunk.len().min(remaining as usize);
            let n = file.read(&mut chunk[..take]).await?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file truncated during transfer",
                )));
            }

            let mut attempt = 0;
            loop {
                match timeout(chunk_timeout, transport.write_all(&chunk[..n])).await {
                    Ok(result) => {
                        result?;
                        break;
                    }
                    Err(_) if attempt < sendfile.max_retry => attempt += 1,
                    Err(_) => return Err(Error::Timeout),
                }
            }
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Completes the handshake and hands the socket to the frame loop; the
    /// connection ends when the session does.
    async fn upgrade_websocket(
        &mut self,
        transport: &mut Transport,
        route: Arc<WsRoute>,
    ) -> Result<()> {
        if let Some(auth) = &route.auth {
            let verdict = auth.evaluate(self.request.peer_addr.map(|a| a.ip()), &self.request);
            let status = match verdict {
                WsAuthResult::Accept => None,
                WsAuthResult::Reject => Some(403),
                WsAuthResult::Error => Some(500),
            };
            if let Some(status) = status {
                self.response.set_close();
                self.response.send_status(status)?;
                self.write_response(transport).await?;
                return Ok(());
            }
        }

        let key = handshake::validate_upgrade(&self.request)?;
        let bytes = handshake::response_bytes(key);
        self.write_with_timeout(transport, &bytes).await?;
        self.set_state(ConnState::ProtocolUpgraded);
        tracing::debug!(path = self.request.path(), "websocket upgrade accepted");

        let ws = &self.shared.config.ws;
        let (tx, rx) = mpsc::unbounded_channel();
        let path: Arc<str> = Arc::from(self.request.path());
        let id = self.shared.next_session_id();
        let sender = WsSender { id, path, tx };

        let registry = self.shared.ws_registry.clone();
        if let Some(registry) = &registry {
            registry.register(id, sender.path.clone(), sender.tx.clone());
        }

        let session = WsSession::new(
            route.handler.clone(),
            sender,
            rx,
            registry,
            ws.max_frame_size,
            ws.max_message_size,
        );
        let initial = std::mem::take(&mut self.buf);
        session.run(transport, &initial).await
    }

    /// Generic protocol switch: write the `101` (with any headers the hook
    /// added) and hand the socket over until the connection ends.
    async fn upgrade_custom(
        &mut self,
        transport: &mut Transport,
        upgrade: Arc<dyn ProtocolUpgrade>,
    ) -> Result<()> {
        upgrade.accept(&self.request, &mut self.response)?;

        let mut head = Vec::with_capacity(160);
        head.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\nupgrade: ");
        head.extend_from_slice(upgrade.protocol().as_bytes());
        head.extend_from_slice(b"\r\nconnection: upgrade\r\n");
        for (name, value) in self.response.headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        self.write_with_timeout(transport, &head).await?;
        self.set_state(ConnState::ProtocolUpgraded);
        tracing::debug!(protocol = upgrade.protocol(), "protocol upgrade accepted");

        let initial = std::mem::take(&mut self.buf);
        upgrade.serve(transport, &initial).await
    }

    fn set_state(&mut self, state: ConnState) {
        tracing::trace!(from = ?self.state, to = ?state, "connection state");
        self.state = state;
    }
}

/// Health tiers by request error rate: above 10% the report is critical and
/// served as `503`, above 1% a warning, otherwise passing. Errors are only
/// ever counted alongside requests, so the rate is well-defined whenever
/// `errors` is non-zero.
fn health_status(requests: u64, errors: u64) -> (&'static str, String, u16) {
    if errors == 0 {
        return ("passing", "OK".to_string(), 200);
    }
    let error_rate = errors as f64 / requests as f64;
    if error_rate > 0.1 {
        (
            "critical",
            format!("Critical: High error rate ({:.2}%)", error_rate * 100.0),
            503,
        )
    } else if error_rate > 0.01 {
        (
            "warning",
            format!("Warning: Elevated error rate ({:.2}%)", error_rate * 100.0),
            200,
        )
    } else {
        ("passing", "OK".to_string(), 200)
    }
}
