//! # hearth
//!
//! A from-scratch synchronous HTTP/1.1 server: a `poll`-driven accept loop
//! feeding a fixed pool of worker threads, each owning one connection at a
//! time through parsing, routing, and response writing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth::http::{Response, StatusCode};
//! use hearth::router::Router;
//! use hearth::server::{Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!     router.get("/", |_req, _params, _json| {
//!         Response::new(StatusCode::Ok, "text/plain", "Hello, World!")
//!     });
//!     router.serve_static("static", "/assets/")?;
//!
//!     let server = Server::new(ServerConfig::default(), router)?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```
//!
//! Routes, middleware, and static mounts are registered before
//! [`Server::run`](server::Server::run) and are read-only afterwards;
//! handlers run synchronously on worker threads.

pub mod cache;
pub mod http;
pub mod net;
pub mod pool;
pub mod router;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{HeaderMap, Method, Request, Response, StatusCode, Version};
pub use router::Router;
pub use server::{Server, ServerConfig, ServerError};
