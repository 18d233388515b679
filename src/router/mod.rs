//! Request routing — middleware chain, method+pattern matching, static files.
//!
//! Routes are registered before the server starts and are read-only at
//! request time; no locking is involved on the hot path. Patterns support
//! named single-segment captures:
//!
//! | Pattern        | Example match | Captured params |
//! |----------------|---------------|-----------------|
//! | `/users`       | `/users`      | *(none)*        |
//! | `/user/:id`    | `/user/42`    | `id → "42"`     |
//!
//! Routes are matched in registration order; the first pattern that matches
//! the whole path wins. A request matched by no route falls through to the
//! static file branch, and failing that to `404` (or `405` when the method
//! has no routes registered at all).
//!
//! Middleware wrap the terminal handler in reverse registration order, so the
//! first-registered middleware is the outermost layer. Each middleware either
//! calls [`Next::run`] exactly once or short-circuits with its own response.

pub mod middleware;
pub mod static_files;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::http::{Method, Request, Response, StatusCode};
use static_files::StaticFiles;

/// Path parameters captured by a matched route pattern.
pub type Params = BTreeMap<String, String>;

/// A route handler: receives the request, the captured path parameters, and
/// the pre-parsed JSON body (when the request carried one).
pub type Handler = Arc<dyn Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync>;

/// A middleware function: may short-circuit with a response or delegate by
/// calling [`Next::run`] exactly once.
pub type MiddlewareFn = Arc<dyn Fn(&Request, Option<&Value>, Next<'_>) -> Response + Send + Sync>;

/// Cursor into the remaining middleware chain for one request.
///
/// Consumed by [`run`](Self::run), so a middleware cannot invoke the rest of
/// the chain twice.
pub struct Next<'a> {
    chain: &'a [MiddlewareFn],
    terminal: &'a dyn Fn() -> Response,
    request: &'a Request,
    json: Option<&'a Value>,
}

impl Next<'_> {
    /// Invokes the next middleware, or the terminal handler when the chain is
    /// exhausted.
    pub fn run(self) -> Response {
        match self.chain.split_first() {
            Some((mw, rest)) => mw(
                self.request,
                self.json,
                Next {
                    chain: rest,
                    ..self
                },
            ),
            None => (self.terminal)(),
        }
    }
}

// One segment of a compiled route pattern.
#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

// A pattern compiled from a template like `/user/:id`. Matching is exact on
// segment count (no trailing-slash normalization) and a capture never spans
// or matches an empty segment.
#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn compile(template: &str) -> Self {
        let segments = template
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) if !name.is_empty() => Segment::Param(name.to_owned()),
                _ => Segment::Literal(seg.to_owned()),
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<Params> {
        let mut params = Params::new();
        let mut path_segments = path.split('/');
        let mut pattern_segments = self.segments.iter();
        loop {
            match (pattern_segments.next(), path_segments.next()) {
                (None, None) => return Some(params),
                (Some(Segment::Literal(lit)), Some(seg)) if lit == seg => {}
                (Some(Segment::Param(name)), Some(seg)) if !seg.is_empty() => {
                    params.insert(name.clone(), seg.to_owned());
                }
                _ => return None,
            }
        }
    }
}

struct Route {
    pattern: Pattern,
    handler: Handler,
}

/// The process-wide routing table: ordered middleware, routes grouped by
/// method, and optional static file serving.
///
/// # Examples
///
/// ```
/// use hearth::http::{Response, StatusCode};
/// use hearth::router::Router;
///
/// let mut router = Router::new();
/// router.get("/user/:id", |_req, params, _json| {
///     Response::new(StatusCode::Ok, "text/plain", params["id"].clone())
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: HashMap<Method, Vec<Route>>,
    middlewares: Vec<MiddlewareFn>,
    static_files: Option<StaticFiles>,
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `middleware` at the end of the chain. Registration order is
    /// wrapping order: the first registered middleware is outermost.
    pub fn add_middleware<M>(&mut self, middleware: M)
    where
        M: Fn(&Request, Option<&Value>, Next<'_>) -> Response + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
    }

    /// Registers an already type-erased middleware, e.g. one built by the
    /// constructors in [`middleware`].
    pub fn add_middleware_fn(&mut self, middleware: MiddlewareFn) {
        self.middlewares.push(middleware);
    }

    /// Registers a handler for `method` requests matching `template`.
    pub fn add_route<H>(&mut self, method: Method, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.routes.entry(method).or_default().push(Route {
            pattern: Pattern::compile(template),
            handler: Arc::new(handler),
        });
    }

    /// Registers a `GET` route.
    pub fn get<H>(&mut self, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.add_route(Method::Get, template, handler);
    }

    /// Registers a `POST` route.
    pub fn post<H>(&mut self, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.add_route(Method::Post, template, handler);
    }

    /// Registers a `PUT` route.
    pub fn put<H>(&mut self, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.add_route(Method::Put, template, handler);
    }

    /// Registers a `DELETE` route.
    pub fn delete<H>(&mut self, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.add_route(Method::Delete, template, handler);
    }

    /// Registers a `PATCH` route.
    pub fn patch<H>(&mut self, template: &str, handler: H)
    where
        H: Fn(&Request, &Params, Option<&Value>) -> Response + Send + Sync + 'static,
    {
        self.add_route(Method::Patch, template, handler);
    }

    /// Serves files under `root` at URLs beginning with `url_prefix`.
    ///
    /// `root` is canonicalized now, once; `url_prefix` must begin with `/`
    /// and gains a trailing `/` if missing.
    ///
    /// # Errors
    ///
    /// Fails when `root` cannot be canonicalized, is not a directory, or the
    /// prefix is invalid.
    pub fn serve_static(&mut self, root: impl AsRef<Path>, url_prefix: &str) -> io::Result<()> {
        self.static_files = Some(StaticFiles::new(root, url_prefix)?);
        Ok(())
    }

    /// Replaces the static file configuration wholesale (used to tune cache
    /// size or stream threshold).
    pub fn set_static_files(&mut self, static_files: StaticFiles) {
        self.static_files = Some(static_files);
    }

    /// Dispatches a request through the middleware chain to the terminal
    /// handler and returns the response.
    pub fn route(&self, request: &Request, json: Option<&Value>) -> Response {
        let matched = self.match_route(request);
        let terminal = || self.terminal(request, json, matched.as_ref());
        Next {
            chain: &self.middlewares,
            terminal: &terminal,
            request,
            json,
        }
        .run()
    }

    /// Returns `true` iff the client's `Accept` header admits `text/html`.
    /// Used to pick HTML or JSON error bodies.
    pub fn client_prefers_html(request: &Request) -> bool {
        request
            .headers()
            .get("accept")
            .is_some_and(|accept| accept.to_ascii_lowercase().contains("text/html"))
    }

    fn match_route(&self, request: &Request) -> Option<(&Route, Params)> {
        let candidates = self.routes.get(&request.method())?;
        for route in candidates {
            if let Some(params) = route.pattern.matches(request.path()) {
                return Some((route, params));
            }
        }
        None
    }

    fn terminal(
        &self,
        request: &Request,
        json: Option<&Value>,
        matched: Option<&(&Route, Params)>,
    ) -> Response {
        if let Some(static_files) = &self.static_files {
            if let Some(response) = static_files.handle(request) {
                return response;
            }
        }

        match matched {
            Some((route, params)) => (route.handler)(request, params, json),
            None => {
                if self.has_method_routes(request.method()) {
                    debug!(path = request.path(), "no route matched");
                    error_response(request, StatusCode::NotFound, "Page not found")
                } else {
                    debug!(method = %request.method(), "no routes for method");
                    error_response(request, StatusCode::MethodNotAllowed, "Method not allowed")
                }
            }
        }
    }

    fn has_method_routes(&self, method: Method) -> bool {
        self.routes.get(&method).is_some_and(|v| !v.is_empty())
    }
}

pub(crate) const ERROR_403_HTML: &str = "<!DOCTYPE html><html><head><title>403 Forbidden</title></head><body><h1>403 Forbidden</h1><p>Access denied.</p></body></html>";
pub(crate) const ERROR_404_HTML: &str = "<!DOCTYPE html><html><head><title>404 Not Found</title></head><body><h1>404 Not Found</h1><p>The requested resource was not found.</p></body></html>";
pub(crate) const ERROR_405_HTML: &str = "<!DOCTYPE html><html><head><title>405 Method Not Allowed</title></head><body><h1>405 Method Not Allowed</h1></body></html>";
pub(crate) const ERROR_416_HTML: &str = "<!DOCTYPE html><html><head><title>416 Range Not Satisfiable</title></head><body><h1>416 Range Not Satisfiable</h1></body></html>";
pub(crate) const ERROR_500_HTML: &str = "<!DOCTYPE html><html><head><title>500 Internal Server Error</title></head><body><h1>500 Internal Server Error</h1></body></html>";

/// Builds an error response whose body is negotiated from the `Accept`
/// header: a fixed HTML template, or `{"error": message}` as JSON.
pub(crate) fn error_response(request: &Request, status: StatusCode, message: &str) -> Response {
    if Router::client_prefers_html(request) {
        let template = match status {
            StatusCode::Forbidden => ERROR_403_HTML,
            StatusCode::NotFound => ERROR_404_HTML,
            StatusCode::MethodNotAllowed => ERROR_405_HTML,
            StatusCode::RangeNotSatisfiable => ERROR_416_HTML,
            _ => ERROR_500_HTML,
        };
        Response::new(status, "text/html; charset=utf-8", template)
    } else {
        Response::json(status, &serde_json::json!({ "error": message }))
    }
}
