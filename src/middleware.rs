//! Ordered, short-circuiting middleware pipeline.
//!
//! A middleware receives the request, the response under construction and a
//! per-request context, and either lets the chain continue or stops it after
//! producing a complete response itself. Chains exist server-wide and per
//! path prefix; both shapes run through the same executor.

use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::types::Method;
use std::sync::Arc;

/// Outcome of one middleware invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Proceed to the next middleware, then the route handler.
    Continue,
    /// The middleware produced a complete response; skip the rest of the
    /// chain and the handler.
    Stop,
}

pub type Middleware = Arc<dyn Fn(&Request, &mut Response, &mut Context) -> Flow + Send + Sync>;

type Cleanup = Box<dyn FnOnce(&Request, &Response) + Send>;

/// Per-request context handed to every middleware in the chain. It lives on
/// the stack of a single dispatch and is never shared across requests.
#[derive(Default)]
pub struct Context {
    cleanup: Vec<Cleanup>,
}

impl Context {
    /// Registers a callback that runs when the chain finishes, on both the
    /// completed and the short-circuited path.
    pub fn on_cleanup<F>(&mut self, f: F)
    where
        F: FnOnce(&Request, &Response) + Send + 'static,
    {
        self.cleanup.push(Box::new(f));
    }

    fn finish(self, req: &Request, resp: &Response) {
        for f in self.cleanup {
            f(req, resp);
        }
    }
}

/// Server-wide chain plus prefix-scoped chains, executed in registration
/// order.
#[derive(Default)]
pub struct MiddlewareChain {
    global: Vec<Middleware>,
    prefixed: Vec<(String, Middleware)>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware that runs for every request.
    pub fn push<F>(&mut self, middleware: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.global.push(Arc::new(middleware));
        self
    }

    /// Appends an already-built middleware such as one of the built-ins.
    pub fn push_arc(&mut self, middleware: Middleware) -> &mut Self {
        self.global.push(middleware);
        self
    }

    /// Appends a middleware that runs only for paths under `prefix`.
    pub fn push_prefix<F>(&mut self, prefix: &str, middleware: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response, &mut Context) -> Flow + Send + Sync + 'static,
    {
        self.prefixed.push((prefix.to_string(), Arc::new(middleware)));
        self
    }

    /// Prefix-scoped variant of [`push_arc`](Self::push_arc).
    pub fn push_prefix_arc(&mut self, prefix: &str, middleware: Middleware) -> &mut Self {
        self.prefixed.push((prefix.to_string(), middleware));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.prefixed.is_empty()
    }

    /// Runs the chain for one request. Cleanup callbacks registered on the
    /// context fire before this returns, regardless of the outcome.
    pub(crate) fn run(&self, req: &Request, resp: &mut Response) -> Flow {
        let mut ctx = Context::default();
        let mut flow = Flow::Continue;

        for middleware in self.global.iter().chain(
            self.prefixed
                .iter()
                .filter(|(prefix, _)| req.path().starts_with(prefix.as_str()))
                .map(|(_, m)| m),
        ) {
            if (middleware.as_ref())(req, resp, &mut ctx) == Flow::Stop {
                flow = Flow::Stop;
                break;
            }
        }

        ctx.finish(req, resp);
        flow
    }
}

// Built-in middlewares

/// CORS policy applied by [`cors`].
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization".to_string(),
        }
    }
}

/// Emits the `Access-Control-Allow-*` headers from `policy` on every
/// response and answers CORS preflights (`OPTIONS` with
/// `Access-Control-Request-Method`) with `200` and [`Flow::Stop`].
pub fn cors(policy: CorsPolicy) -> Middleware {
    Arc::new(move |req, resp, _ctx| {
        let ok = resp
            .set_header("access-control-allow-origin", &policy.allow_origin)
            .and_then(|r| r.set_header("access-control-allow-methods", &policy.allow_methods))
            .and_then(|r| r.set_header("access-control-allow-headers", &policy.allow_headers));
        if ok.is_err() {
            return Flow::Continue;
        }

        if req.method() == Method::Options && req.header("access-control-request-method").is_some()
        {
            let _ = resp.send_status(200);
            return Flow::Stop;
        }
        Flow::Continue
    })
}

/// Requires `Authorization: Bearer <token>` and validates the token with
/// `validator`; missing or rejected tokens answer `401` and stop the chain.
pub fn bearer_auth<F>(validator: F) -> Middleware
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(move |req, resp, _ctx| {
        let token = req
            .header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty());

        match token {
            Some(token) if validator(token) => Flow::Continue,
            _ => {
                let _ = resp.set_header("www-authenticate", "Bearer");
                let _ = resp.send_status(401);
                Flow::Stop
            }
        }
    })
}

/// For `POST` and `PUT` requests, requires the `Content-Type` header to
/// contain `expected`; otherwise answers `415` and stops the chain.
pub fn content_type_gate(expected: &'static str) -> Middleware {
    Arc::new(move |req, resp, _ctx| {
        if !matches!(req.method(), Method::Post | Method::Put) {
            return Flow::Continue;
        }
        let matches = req
            .header("content-type")
            .is_some_and(|v| v.contains(expected));
        if matches {
            Flow::Continue
        } else {
            let _ = resp.send_status(415);
            Flow::Stop
        }
    })
}

/// Logs one line per request once the chain finishes. Never stops the chain.
pub fn request_logger() -> Middleware {
    Arc::new(|_req, _resp, ctx| {
        ctx.on_cleanup(|req, resp| {
            tracing::info!(
                method = req.method().as_str(),
                path = req.path(),
                status = resp.status(),
                "request"
            );
        });
        Flow::Continue
    })
}


#[cfg(test)]
mod builtin_tests {
    use super::*;

    fn request(method: Method, path: &str) -> Request {
        let mut req = Request::new();
        req.method = method;
        req.path.push_str(path);
        req
    }

    #[test]
    fn cors_headers_and_preflight() {
        let mw = cors(CorsPolicy::default());

        let req = request(Method::Get, "/");
        let mut resp = Response::new(1024);
        let mut ctx = Context::default();
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Continue);
        assert_eq!(resp.header("access-control-allow-origin"), Some("*"));

        let mut req = request(Method::Options, "/");
        req.headers
            .insert("access-control-request-method", "POST")
            .unwrap();
        let mut resp = Response::new(1024);
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Stop);
        assert_eq!(resp.status(), 200);
        assert!(resp.finished());
    }

    #[test]
    fn plain_options_passes_cors() {
        let mw = cors(CorsPolicy::default());
        let req = request(Method::Options, "/");
        let mut resp = Response::new(1024);
        let mut ctx = Context::default();
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Continue);
    }

    #[test]
    fn bearer_auth_gate() {
        let mw = bearer_auth(|token| token == "sesame");
        let mut ctx = Context::default();

        #[rustfmt::skip]
        let cases = [
            (None,                          Flow::Stop),
            (Some("Bearer sesame"),         Flow::Continue),
            (Some("Bearer wrong"),          Flow::Stop),
            (Some("Basic sesame"),          Flow::Stop),
            (Some("Bearer "),               Flow::Stop),
        ];

        for (header, expected) in cases {
            let mut req = request(Method::Get, "/");
            if let Some(value) = header {
                req.headers.insert("authorization", value).unwrap();
            }
            let mut resp = Response::new(1024);
            assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), expected, "{header:?}");
            if expected == Flow::Stop {
                assert_eq!(resp.status(), 401);
            }
        }
    }

    #[test]
    fn content_type_gate_only_for_writes() {
        let mw = content_type_gate("application/json");
        let mut ctx = Context::default();

        let req = request(Method::Get, "/");
        let mut resp = Response::new(1024);
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Continue);

        let mut req = request(Method::Post, "/");
        req.headers
            .insert("content-type", "application/json; charset=utf-8")
            .unwrap();
        let mut resp = Response::new(1024);
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Continue);

        let mut req = request(Method::Put, "/");
        req.headers.insert("content-type", "text/plain").unwrap();
        let mut resp = Response::new(1024);
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Stop);
        assert_eq!(resp.status(), 415);

        let req = request(Method::Post, "/");
        let mut resp = Response::new(1024);
        assert_eq!((mw.as_ref())(&req, &mut resp, &mut ctx), Flow::Stop);
    }
}
