//! Method- and path-based request routing.
//!
//! The table is a fixed-capacity array searched linearly; with at most 64
//! entries the scan stays cache-friendly and the match order is exactly the
//! registration order. Literal patterns always win over parameterised ones.

use crate::errors::{Error, Result};
use crate::http::request::{Request, MAX_PARAMS};
use crate::http::response::Response;
use crate::http::types::{Method, MethodMask};
use std::sync::Arc;

/// Hard ceiling on registered routes.
pub(crate) const MAX_ROUTES: usize = 64;
/// Longest accepted route pattern.
const MAX_PATTERN_LEN: usize = 256;

/// Request handler: build the response, call [`Response::send`], return
/// `Ok(())`. An `Err` (or a handler that never sends) makes the engine
/// synthesise a `500` if no bytes have been written yet.
pub type Handler = Arc<dyn Fn(&Request, &mut Response) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    Literal(String),
    Segments(Vec<Segment>),
}

struct Route {
    pattern: Pattern,
    methods: MethodMask,
    handler: Handler,
}

pub(crate) enum RouteLookup {
    Found {
        handler: Handler,
        params: Vec<(String, String)>,
    },
    MethodMismatch,
    NotFound,
}

/// Route table. Registration happens before the server starts; lookups are
/// read-only afterwards.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::with_capacity(MAX_ROUTES),
        }
    }

    /// Registers a handler for `pattern` and the methods in `methods`.
    ///
    /// Patterns are absolute paths whose segments are either literals or
    /// `:name` captures (`/users/:id/posts`). At most 64 routes and 16
    /// captures per pattern are accepted.
    pub fn route<F>(&mut self, methods: MethodMask, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        if self.routes.len() >= MAX_ROUTES {
            return Err(Error::RouteTableFull);
        }
        let pattern = parse_pattern(pattern)?;
        self.routes.push(Route {
            pattern,
            methods,
            handler: Arc::new(handler),
        });
        Ok(self)
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.route(MethodMask::GET, pattern, handler)
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.route(MethodMask::POST, pattern, handler)
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.route(MethodMask::PUT, pattern, handler)
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Request, &mut Response) -> Result<()> + Send + Sync + 'static,
    {
        self.route(MethodMask::DELETE, pattern, handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Selection rule: among routes whose method mask admits `method`, the
    /// first literal match wins; failing that, the first parameterised match
    /// in insertion order. A path that only matched entries with other
    /// methods reports a method mismatch.
    pub(crate) fn find(&self, method: Method, path: &str) -> RouteLookup {
        let mut path_matched = false;

        for route in &self.routes {
            if let Pattern::Literal(lit) = &route.pattern {
                if lit == path {
                    if route.methods.contains(method) {
                        return RouteLookup::Found {
                            handler: route.handler.clone(),
                            params: Vec::new(),
                        };
                    }
                    path_matched = true;
                }
            }
        }

        for route in &self.routes {
            if let Pattern::Segments(segments) = &route.pattern {
                if let Some(params) = match_segments(segments, path) {
                    if route.methods.contains(method) {
                        return RouteLookup::Found {
                            handler: route.handler.clone(),
                            params,
                        };
                    }
                    path_matched = true;
                }
            }
        }

        if path_matched {
            RouteLookup::MethodMismatch
        } else {
            RouteLookup::NotFound
        }
    }
}

fn parse_pattern(pattern: &str) -> Result<Pattern> {
    if !pattern.starts_with('/') || pattern.len() > MAX_PATTERN_LEN {
        return Err(Error::RoutePattern(pattern.to_string()));
    }
    if !pattern.contains(':') {
        return Ok(Pattern::Literal(pattern.to_string()));
    }

    let mut segments = Vec::new();
    let mut captures = 0;
    for part in pattern[1..].split('/') {
        if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(Error::RoutePattern(pattern.to_string()));
            }
            captures += 1;
            if captures > MAX_PARAMS {
                return Err(Error::RoutePattern(pattern.to_string()));
            }
            segments.push(Segment::Param(name.to_string()));
        } else {
            segments.push(Segment::Literal(part.to_string()));
        }
    }
    Ok(Pattern::Segments(segments))
}

/// Each `:name` segment matches exactly one path segment.
fn match_segments(segments: &[Segment], path: &str) -> Option<Vec<(String, String)>> {
    if !path.starts_with('/') {
        return None;
    }
    let mut params = Vec::new();
    let mut parts = path[1..].split('/');

    for segment in segments {
        let part = parts.next()?;
        match segment {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param(_) if part.is_empty() => return None,
            Segment::Param(name) => params.push((name.clone(), part.to_string())),
        }
    }
    if parts.next().is_some() {
        return None;
    }
    Some(params)
}
