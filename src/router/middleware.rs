//! Built-in middleware: request logging and a bearer-token guard.

use std::sync::Arc;

use tracing::info;

use crate::http::{Body, Response, StatusCode};

use super::MiddlewareFn;

/// Middleware that logs each request's method and path before dispatch, and
/// the response status and body size after.
pub fn request_logger() -> MiddlewareFn {
    Arc::new(|request, _json, next| {
        info!("Request: {} {}", request.method(), request.path());
        let response = next.run();
        match response.body() {
            Body::InMemory(bytes) => {
                info!("Response: {} ({} bytes)", response.status().as_u16(), bytes.len());
            }
            Body::Stream { size, .. } => {
                info!(
                    "Response: {} ({} bytes, streamed)",
                    response.status().as_u16(),
                    size
                );
            }
        }
        response
    })
}

/// Middleware that guards paths starting with `path_prefix` behind a static
/// bearer token: requests without `Authorization: Bearer <token>` are
/// short-circuited with `401` and a JSON error body. Everything else passes
/// through untouched.
///
/// # Examples
///
/// ```
/// use hearth::router::{middleware, Router};
///
/// let mut router = Router::new();
/// router.add_middleware_fn(middleware::bearer_auth("/user/", "dummy_token"));
/// ```
pub fn bearer_auth(path_prefix: &str, token: &str) -> MiddlewareFn {
    let path_prefix = path_prefix.to_owned();
    let expected = format!("Bearer {token}");
    Arc::new(move |request, _json, next| {
        if request.path().starts_with(&path_prefix)
            && request.headers().get("authorization") != Some(expected.as_str())
        {
            return Response::json(
                StatusCode::Unauthorized,
                &serde_json::json!({"error": "Unauthorized"}),
            );
        }
        next.run()
    })
}
