//! Server wiring: builder, acceptor loop, worker pool and 503 backpressure.
//!
//! Accepted sockets flow through an admission queue into a fixed pool of
//! connection workers, each of which owns one pre-allocated [`Connection`]
//! and serves one socket at a time. When the queue is full the acceptor
//! still accepts, a dedicated overflow worker writes a fixed `503` and the
//! socket is dropped; only promoted connections count as active.

use crate::config::ServerConfig;
use crate::errors::{Error, Result};
use crate::limiter::RateLimiter;
use crate::middleware::MiddlewareChain;
use crate::router::Router;
use crate::http::request::Request;
use crate::http::types::header_has_token;
use crate::server::connection::Connection;
use crate::server::tls;
use crate::static_files::{CacheStats, StaticService};
use crate::upgrade::ProtocolUpgrade;
use crate::ws::registry::WsRegistry;
use crate::ws::{WsAuthConfig, WsHandler, WsRoute};
use crossbeam::queue::SegQueue;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;

const OVERLOAD_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nconnection: close\r\ncontent-length: 0\r\n\r\n";

type TcpQueue = Arc<SegQueue<(TcpStream, SocketAddr)>>;

/// State shared by the acceptor and every connection worker. The router,
/// middleware and config are immutable after build; the limiter, registry
/// and static cache guard their own interior state.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) router: Router,
    pub(crate) middleware: MiddlewareChain,
    pub(crate) limiter: RateLimiter,
    pub(crate) statics: Option<StaticService>,
    pub(crate) tls: Option<TlsAcceptor>,
    pub(crate) ws_routes: Vec<Arc<WsRoute>>,
    pub(crate) ws_registry: Option<Arc<WsRegistry>>,
    pub(crate) upgrades: Vec<Arc<dyn ProtocolUpgrade>>,
    pub(crate) health_path: Option<String>,
    pub(crate) started: Instant,
    next_ws_id: AtomicU64,
    pub(crate) active_connections: AtomicUsize,
    pub(crate) total_requests: AtomicU64,
    pub(crate) total_errors: AtomicU64,
    pub(crate) is_listening: AtomicBool,
}

impl Shared {
    pub(crate) fn find_ws_route(&self, path: &str) -> Option<Arc<WsRoute>> {
        self.ws_routes.iter().find(|r| r.path == path).cloned()
    }

    pub(crate) fn find_protocol_upgrade(&self, req: &Request) -> Option<Arc<dyn ProtocolUpgrade>> {
        let upgrade = req.header("upgrade")?;
        self.upgrades
            .iter()
            .find(|u| header_has_token(upgrade, u.protocol()) && u.detect(req))
            .cloned()
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        match &self.ws_registry {
            Some(registry) => registry.next_id(),
            None => self.next_ws_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// An embedded HTTP/1.1 server.
///
/// ```no_run
/// use ember_web::{Router, Server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let mut router = Router::new();
///     router
///         .get("/hello", |_req, resp| {
///             resp.set_status(200)?;
///             resp.set_body("Hello")?;
///             resp.send();
///             Ok(())
///         })
///         .unwrap();
///
///     Server::builder()
///         .bind("127.0.0.1:8080".parse().unwrap())
///         .config(ServerConfig::default())
///         .router(router)
///         .build()
///         .unwrap()
///         .launch()
///         .await;
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    queue: TcpQueue,
    overflow: TcpQueue,
    pub(crate) shared: Arc<Shared>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            addr: None,
            config: ServerConfig::default(),
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            ws_routes: Vec::new(),
            upgrades: Vec::new(),
            health_path: None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Currently promoted connections.
    pub fn active_connections(&self) -> usize {
        self.shared.active_connections.load(Ordering::Relaxed)
    }

    /// Static cache counters, when the static service is configured.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.shared.statics.as_ref().map(|s| s.cache_stats())
    }

    /// Live managed WebSocket sessions, when management is enabled.
    pub fn ws_session_count(&self) -> Option<usize> {
        self.shared.ws_registry.as_ref().map(|r| r.session_count())
    }

    /// Whether [`launch`](Self::launch) has started accepting.
    pub fn is_listening(&self) -> bool {
        self.shared.is_listening.load(Ordering::Relaxed)
    }

    /// Runs the accept loop forever.
    pub async fn launch(self) {
        self.shared.is_listening.store(true, Ordering::Relaxed);
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "listening");
        }

        loop {
            let Ok((stream, peer)) = self.listener.accept().await else {
                continue;
            };

            if self.queue.len() < self.shared.config.max_pending_connections {
                self.queue.push((stream, peer));
            } else {
                self.overflow.push((stream, peer));
            }
        }
    }
}

/// Configures and assembles a [`Server`]. Must be built inside a tokio
/// runtime; the worker pool and timers are spawned at build time.
pub struct ServerBuilder {
    listener: Option<TcpListener>,
    addr: Option<SocketAddr>,
    config: ServerConfig,
    router: Router,
    middleware: MiddlewareChain,
    ws_routes: Vec<Arc<WsRoute>>,
    upgrades: Vec<Arc<dyn ProtocolUpgrade>>,
    health_path: Option<String>,
}

impl ServerBuilder {
    /// Uses an already-bound listener instead of [`bind`](Self::bind).
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Address to bind at build time, honouring the configured backlog.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    /// Registers a WebSocket endpoint at an exact path.
    pub fn route_ws(mut self, path: &str, handler: impl WsHandler) -> Self {
        self.ws_routes.push(Arc::new(WsRoute {
            path: path.to_string(),
            handler: Arc::new(handler),
            auth: None,
        }));
        self
    }

    /// Registers an authenticated WebSocket endpoint.
    pub fn route_ws_with_auth(
        mut self,
        path: &str,
        handler: impl WsHandler,
        auth: WsAuthConfig,
    ) -> Self {
        self.ws_routes.push(Arc::new(WsRoute {
            path: path.to_string(),
            handler: Arc::new(handler),
            auth: Some(auth),
        }));
        self
    }

    /// Registers a protocol reachable through the generic `Upgrade` hook.
    /// WebSocket routes take precedence over these.
    pub fn register_upgrade(mut self, upgrade: impl ProtocolUpgrade) -> Self {
        self.upgrades.push(Arc::new(upgrade));
        self
    }

    /// Serves a JSON health report (status, uptime, connection and request
    /// counters) at `path`, bypassing router and middleware.
    pub fn enable_health(mut self, path: &str) -> Self {
        self.health_path = Some(path.to_string());
        self
    }

    /// Validates the configuration, loads TLS material, pins the static
    /// root, and spawns the worker pool plus the overflow responder.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;

        let listener = match self.listener {
            Some(listener) => listener,
            None => {
                let addr = self
                    .addr
                    .ok_or(Error::Config("either listener() or bind() is required"))?;
                bind_listener(addr, self.config.backlog)?
            }
        };

        let tls = if self.config.tls.enabled {
            Some(tls::build_acceptor(&self.config.tls)?)
        } else {
            None
        };
        let statics = self
            .config
            .static_files
            .clone()
            .map(StaticService::new)
            .transpose()?;
        let limiter = RateLimiter::new(&self.config.rate_limit);
        let ws_registry = self
            .config
            .ws
            .connection_management
            .then(|| Arc::new(WsRegistry::new(&self.config.ws)));
        if let Some(registry) = &ws_registry {
            registry.spawn_timers();
        }

        let shared = Arc::new(Shared {
            router: self.router,
            middleware: self.middleware,
            limiter,
            statics,
            tls,
            ws_routes: self.ws_routes,
            ws_registry,
            upgrades: self.upgrades,
            health_path: self.health_path,
            started: Instant::now(),
            next_ws_id: AtomicU64::new(1),
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            is_listening: AtomicBool::new(false),
            config: self.config,
        });

        let queue: TcpQueue = Arc::new(SegQueue::new());
        let overflow: TcpQueue = Arc::new(SegQueue::new());

        for _ in 0..shared.config.max_connections {
            spawn_worker(&queue, &shared);
        }
        spawn_overflow_worker(&overflow);

        Ok(Server {
            listener,
            queue,
            overflow,
            shared,
        })
    }
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn next_stream(queue: &TcpQueue) -> (TcpStream, SocketAddr) {
    loop {
        if let Some(value) = queue.pop() {
            return value;
        }
        sleep(Duration::from_micros(50)).await;
    }
}

fn spawn_worker(queue: &TcpQueue, shared: &Arc<Shared>) {
    let queue = queue.clone();
    let shared = shared.clone();

    tokio::spawn(async move {
        let mut conn = Connection::new(shared.clone());
        loop {
            let (stream, peer) = next_stream(&queue).await;

            shared.active_connections.fetch_add(1, Ordering::Relaxed);
            conn.run(stream, peer).await;
            shared.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    });
}

fn spawn_overflow_worker(queue: &TcpQueue) {
    let queue = queue.clone();

    tokio::spawn(async move {
        loop {
            let (mut stream, peer) = next_stream(&queue).await;
            tracing::warn!(%peer, "connection limit reached, refusing with 503");
            let _ = stream.write_all(OVERLOAD_RESPONSE).await;
            drop(stream);
        }
    });
}
