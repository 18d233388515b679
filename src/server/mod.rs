//! The accept loop: signal-driven shutdown, polled accepts, and dispatch of
//! connections onto the worker pool.
//!
//! The `RUNNING` flag flipped by the signal handler is the only process
//! global; everything else — listener, pool, router — is owned by the
//! [`Server`] value.

pub mod connection;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{signal, SigHandler, Signal};
use thiserror::Error;
use tracing::{error, info};

use crate::net::{Listener, NetError};
use crate::pool::{self, ThreadPool};
use crate::router::Router;
use connection::{Connection, ConnectionConfig};

/// Set by [`Server::run`], cleared by `SIGINT`/`SIGTERM` (or
/// [`request_shutdown`]). Checked once per poll interval by the accept loop.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_signal: nix::libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Asks the accept loop to exit after its current poll tick. The same flag
/// the signal handler flips.
pub fn request_shutdown() {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Errors that prevent the server from starting or running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error("failed to install signal handler: {0}")]
    Signal(nix::Error),
}

/// In-process server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    /// Worker thread count; defaults to `max(4, 2 × hardware threads)`.
    pub workers: usize,
    /// How long each `poll` on the listener may block before the running
    /// flag is re-checked.
    pub poll_interval: Duration,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            backlog: 10,
            workers: pool::default_workers(),
            poll_interval: Duration::from_millis(100),
            connection: ConnectionConfig::default(),
        }
    }
}

/// A bound HTTP server: listener, worker pool, and routing table.
///
/// # Examples
///
/// ```no_run
/// use hearth::http::{Response, StatusCode};
/// use hearth::router::Router;
/// use hearth::server::{Server, ServerConfig};
///
/// let mut router = Router::new();
/// router.get("/", |_req, _params, _json| {
///     Response::new(StatusCode::Ok, "text/plain", "hello")
/// });
/// let server = Server::new(ServerConfig::default(), router).unwrap();
/// server.run().unwrap();
/// ```
pub struct Server {
    listener: Listener,
    pool: ThreadPool,
    router: Arc<Router>,
    config: ServerConfig,
    next_connection_id: AtomicU64,
}

impl Server {
    /// Binds and listens. Bind or listen failures are fatal and returned.
    pub fn new(config: ServerConfig, router: Router) -> Result<Self, ServerError> {
        let listener = Listener::bind(&config.host, config.port, config.backlog)?;
        let pool = ThreadPool::spawn(config.workers);
        info!(
            addr = %listener.local_addr(),
            workers = config.workers,
            "server listening"
        );
        Ok(Self {
            listener,
            pool,
            router: Arc::new(router),
            config,
            next_connection_id: AtomicU64::new(1),
        })
    }

    /// Returns the bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Installs the `SIGINT`/`SIGTERM` handlers and serves until one fires.
    ///
    /// On shutdown the listening socket closes first, then the pool stops:
    /// workers finish the connection they are on and exit; connections still
    /// queued are dropped.
    pub fn run(self) -> Result<(), ServerError> {
        install_signal_handlers()?;
        RUNNING.store(true, Ordering::SeqCst);

        info!("waiting for connections");
        while RUNNING.load(Ordering::SeqCst) {
            self.accept_one();
        }

        info!("server shutting down");
        drop(self.listener);
        self.pool.stop();
        Ok(())
    }

    /// One poll tick: accept and dispatch a connection if one is pending.
    /// Accept errors are transient — logged, and the loop continues.
    fn accept_one(&self) {
        match self.listener.poll_readable(self.config.poll_interval) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!(error = %e, "poll failed");
                return;
            }
        }

        match self.listener.accept() {
            Ok((stream, peer)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                info!(conn = id, peer = %peer, "accepted connection");
                let router = Arc::clone(&self.router);
                let config = self.config.connection.clone();
                self.pool.enqueue(Box::new(move || {
                    Connection::new(stream, peer, id, config).handle(&router);
                }));
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

fn install_signal_handlers() -> Result<(), ServerError> {
    let handler = SigHandler::Handler(handle_shutdown_signal);
    // Safety: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        signal(Signal::SIGINT, handler).map_err(ServerError::Signal)?;
        signal(Signal::SIGTERM, handler).map_err(ServerError::Signal)?;
    }
    Ok(())
}
