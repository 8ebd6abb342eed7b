//! ember_web - embedded HTTP/1.1 server library for in-process use by
//! backend services.
//!
//! The server accepts TCP (and optionally TLS) connections, parses requests
//! incrementally, dispatches them through a routing and middleware pipeline,
//! supports the WebSocket upgrade with authenticated and managed long-lived
//! connections, enforces a fixed-window rate limit with an IP allow-list,
//! and serves static files with content-addressed caching.
//!
//! # Architecture
//!
//! One acceptor task feeds a fixed pool of connection workers through an
//! admission queue; each worker owns a pre-allocated connection state
//! machine and serves one socket at a time. When the pool and queue are
//! saturated, new connections receive an immediate `503` with
//! `Connection: close`. Request, response and parser state are reset, not
//! reallocated, between keep-alive requests.
//!
//! # Quick start
//!
//! ```no_run
//! use ember_web::{Router, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = Router::new();
//!     router
//!         .get("/hello", |_req, resp| {
//!             resp.set_status(200)?;
//!             resp.set_body("Hello")?;
//!             resp.send();
//!             Ok(())
//!         })
//!         .unwrap();
//!
//!     Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .config(ServerConfig::default())
//!         .router(router)
//!         .build()
//!         .unwrap()
//!         .launch()
//!         .await;
//! }
//! ```
//!
//! WebSocket endpoints are registered on the builder with
//! [`ServerBuilder::route_ws`]; handlers implement [`WsHandler`] and talk
//! back through the [`WsSender`] handle. Static file serving is enabled by
//! setting [`StaticConfig`] on the [`ServerConfig`]; unrouted `GET`/`HEAD`
//! requests then fall through to the configured root.

pub(crate) mod http {
    pub(crate) mod parser;
    pub mod request;
    pub mod response;
    pub mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    #[allow(clippy::module_inception)]
    pub(crate) mod server;
    pub(crate) mod tls;
}
pub mod config;
pub(crate) mod errors;
pub(crate) mod limiter;
pub mod middleware;
pub mod router;
pub mod static_files;
pub mod upgrade;
pub mod ws;

pub use crate::config::{
    RateLimitConfig, SendfileConfig, ServerConfig, StaticConfig, TlsConfig, WsConfig,
};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::http::{
    request::Request,
    response::Response,
    types::{reason_phrase, HeaderMap, Method, MethodMask, Version},
};
pub use crate::middleware::{
    bearer_auth, content_type_gate, cors, request_logger, Context, CorsPolicy, Flow,
    MiddlewareChain,
};
pub use crate::router::{Handler, Router};
pub use crate::server::server::{Server, ServerBuilder};
pub use crate::static_files::CacheStats;
pub use crate::upgrade::{ProtocolUpgrade, UpgradeFuture, UpgradedIo};
pub use crate::ws::{
    close_code, Frame, MessageKind, OpCode, WsAuthConfig, WsAuthResult, WsHandler, WsSender,
};
