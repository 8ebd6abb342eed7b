//! WebSocket engine: handshake, frame codec, session loop and the managed
//! connection registry.

pub mod frame;
pub(crate) mod handshake;
pub(crate) mod registry;
pub mod session;

pub use frame::{close_code, Frame, OpCode};
pub use session::{MessageKind, WsHandler, WsSender};

use crate::http::request::Request;
use std::net::IpAddr;
use std::sync::Arc;

/// Verdict of a WebSocket authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsAuthResult {
    Accept,
    /// Refused: the handshake is answered with `403`.
    Reject,
    /// The validator itself failed: the handshake is answered with `500`.
    Error,
}

/// Per-path authentication for WebSocket routes.
///
/// The deny list is evaluated before the allow list; a non-empty allow list
/// admits only the addresses it names. The token is taken from
/// `Authorization: Bearer` or, failing that, from the `token` query
/// parameter.
#[derive(Clone, Default)]
pub struct WsAuthConfig {
    pub allow: Vec<IpAddr>,
    pub deny: Vec<IpAddr>,
    pub token_validator: Option<Arc<dyn Fn(&str) -> WsAuthResult + Send + Sync>>,
}

impl WsAuthConfig {
    pub(crate) fn evaluate(&self, peer: Option<IpAddr>, req: &Request) -> WsAuthResult {
        if let Some(ip) = peer {
            if self.deny.contains(&ip) {
                return WsAuthResult::Reject;
            }
        }
        if !self.allow.is_empty() {
            match peer {
                Some(ip) if self.allow.contains(&ip) => {}
                _ => return WsAuthResult::Reject,
            }
        }

        if let Some(validator) = &self.token_validator {
            let token = req
                .header("authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .or_else(|| req.query_param("token"));
            match token {
                Some(token) if !token.is_empty() => (validator.as_ref())(token),
                _ => WsAuthResult::Reject,
            }
        } else {
            WsAuthResult::Accept
        }
    }
}

/// A registered WebSocket endpoint: exact path, callbacks, optional auth.
pub(crate) struct WsRoute {
    pub(crate) path: String,
    pub(crate) handler: Arc<dyn WsHandler>,
    pub(crate) auth: Option<WsAuthConfig>,
}
