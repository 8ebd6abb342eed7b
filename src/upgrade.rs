//! Generic protocol upgrade hook.
//!
//! The WebSocket engine covers RFC 6455; this hook lets embedders switch a
//! connection to any other protocol negotiated through the HTTP `Upgrade`
//! mechanism. After the engine writes the `101`, the registered handler
//! owns the socket until the connection ends.

use crate::errors::Result;
use crate::http::request::Request;
use crate::http::response::Response;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Type-erased view of the upgraded socket, plain TCP or TLS alike.
pub trait UpgradedIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpgradedIo for T {}

pub type UpgradeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A protocol reachable through `Upgrade: <token>`.
///
/// Registration order decides precedence; the WebSocket route table is
/// consulted first, then these hooks.
pub trait ProtocolUpgrade: Send + Sync + 'static {
    /// Token matched case-insensitively against the request's `Upgrade`
    /// header (e.g. `"grpc-web"`).
    fn protocol(&self) -> &'static str;

    /// Closer inspection of the request once the token matched; returning
    /// `false` falls through to ordinary HTTP dispatch.
    fn detect(&self, req: &Request) -> bool {
        let _ = req;
        true
    }

    /// Adds protocol-specific headers to the `101` response before it is
    /// written. The engine supplies the status line and the `upgrade` and
    /// `connection` headers itself.
    fn accept(&self, req: &Request, resp: &mut Response) -> Result<()> {
        let _ = (req, resp);
        Ok(())
    }

    /// Drives the switched protocol until the connection ends. `initial`
    /// holds any bytes the peer sent behind the upgrade request.
    fn serve<'a>(&'a self, stream: &'a mut dyn UpgradedIo, initial: &'a [u8])
        -> UpgradeFuture<'a>;
}
