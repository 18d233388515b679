//! Per-connection request lifecycle: incremental reads, pipelining,
//! keep-alive, and variant-sensitive response sending.
//!
//! A [`Connection`] exclusively owns its socket. It loops up to
//! `max_requests` times over [`process_single_request`], which consumes one
//! request from the connection buffer per call — leftover bytes after a
//! request are the pipelined tail for the next iteration, never re-read.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytes::BytesMut;
use memchr::memmem;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::http::{Body, Request, Response, StatusCode, Version};
use crate::net::{RecvOutcome, Stream};
use crate::router::Router;

/// Tunables for a single connection. The defaults carry the server's
/// protocol-level resource bounds.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Per-`recv` timeout.
    pub recv_timeout: Duration,
    /// Per-`send` timeout.
    pub send_timeout: Duration,
    /// Maximum requests served on one connection before it closes.
    pub max_requests: usize,
    /// Maximum size of a request's header block.
    pub max_header_size: usize,
    /// Maximum `Content-Length` accepted.
    pub max_content_length: usize,
    /// Chunk size used when streaming file bodies.
    pub stream_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            max_requests: 100,
            max_header_size: 8 * 1024,
            max_content_length: 1024 * 1024,
            stream_buffer_size: 64 * 1024,
        }
    }
}

/// What a single request cycle decided about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Response sent; loop for the next request.
    KeepAlive,
    /// Response sent (or peer finished); close cleanly.
    Close,
    /// The request could not be completed; any error response has already
    /// been attempted, close immediately.
    Fail,
}

/// Handles every request arriving on one accepted socket.
pub struct Connection {
    stream: Stream,
    peer: SocketAddr,
    config: ConnectionConfig,
    id: u64,
    buf: BytesMut,
}

impl Connection {
    /// Wraps an accepted stream, applying the configured socket timeouts.
    pub fn new(stream: Stream, peer: SocketAddr, id: u64, config: ConnectionConfig) -> Self {
        if let Err(e) = stream.set_recv_timeout(config.recv_timeout) {
            error!(conn = id, error = %e, "failed to set recv timeout");
        }
        if let Err(e) = stream.set_send_timeout(config.send_timeout) {
            error!(conn = id, error = %e, "failed to set send timeout");
        }
        Self {
            stream,
            peer,
            config,
            id,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Serves requests until the peer closes, an error occurs, or
    /// `max_requests` is reached. Consumes the connection; the socket closes
    /// on return.
    pub fn handle(mut self, router: &Router) {
        info!(conn = self.id, peer = %self.peer, "handling connection");
        let mut handled = 0;
        while handled < self.config.max_requests {
            match self.process_single_request(router) {
                Outcome::KeepAlive => handled += 1,
                Outcome::Close => {
                    debug!(conn = self.id, "connection closed per request");
                    break;
                }
                Outcome::Fail => {
                    debug!(conn = self.id, "request processing failed, closing");
                    break;
                }
            }
        }
        if !self.buf.is_empty() {
            warn!(
                conn = self.id,
                remaining = self.buf.len(),
                "unconsumed pipelined bytes at connection end"
            );
        }
        info!(conn = self.id, peer = %self.peer, requests = handled, "connection done");
    }

    fn process_single_request(&mut self, router: &Router) -> Outcome {
        let request_id: u64 = rand::random();

        let header_end = match self.read_headers(request_id) {
            Ok(n) => n,
            Err(outcome) => return outcome,
        };

        let content_length = match self.content_length(header_end, request_id) {
            Ok(n) => n,
            Err(outcome) => return outcome,
        };

        if let Err(outcome) = self.read_body(header_end, content_length, request_id) {
            return outcome;
        }

        // Consume exactly this request from the buffer; anything left is the
        // next pipelined request.
        let raw = self.buf.split_to(header_end + content_length).freeze();

        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = self.id, req = request_id, error = %e, "malformed request");
                return self.fail_with(
                    request_id,
                    Response::new(StatusCode::BadRequest, "text/plain", "Malformed request"),
                );
            }
        };
        debug!(
            conn = self.id,
            req = request_id,
            method = %request.method(),
            path = request.path(),
            "parsed request"
        );

        if request.is_upgrade_request() {
            debug!(
                conn = self.id,
                req = request_id,
                "websocket upgrade requested, not supported; serving as plain HTTP"
            );
        }

        let json_body = match self.parse_json_body(&request, request_id) {
            Ok(json) => json,
            Err(outcome) => return outcome,
        };

        if request.version() == Version::Http11 && request.headers().get("host").is_none() {
            warn!(conn = self.id, req = request_id, "missing Host header on HTTP/1.1 request");
            return self.fail_with(
                request_id,
                Response::new(StatusCode::BadRequest, "text/plain", "Missing Host header"),
            );
        }

        let keep_alive = request.wants_keep_alive();

        let mut response =
            match catch_unwind(AssertUnwindSafe(|| router.route(&request, json_body.as_ref()))) {
                Ok(response) => response,
                Err(_) => {
                    error!(conn = self.id, req = request_id, "handler or middleware panicked");
                    Response::json(
                        StatusCode::InternalServerError,
                        &serde_json::json!({"error": "Internal server error"}),
                    )
                }
            };
        response.set_header("Connection", if keep_alive { "keep-alive" } else { "close" });

        if let Err(e) = self.send_response(&response, request_id) {
            error!(conn = self.id, req = request_id, error = %e, "send error");
            return Outcome::Fail;
        }

        if keep_alive {
            Outcome::KeepAlive
        } else {
            Outcome::Close
        }
    }

    /// Reads until the connection buffer holds a complete header block,
    /// normalizing a bare `\n\n` terminator to `\r\n\r\n` in place. Returns
    /// the offset one past the terminator.
    fn read_headers(&mut self, request_id: u64) -> Result<usize, Outcome> {
        loop {
            let crlf = memmem::find(&self.buf, b"\r\n\r\n");
            let bare = memmem::find(&self.buf, b"\n\n");
            // Whichever terminator appears first ends this request's headers.
            match (crlf, bare) {
                (Some(c), b) if b.map_or(true, |l| c < l) => {
                    return self.check_header_size(c + 4, request_id);
                }
                (_, Some(l)) => {
                    let mut normalized = BytesMut::with_capacity(self.buf.len() + 2);
                    normalized.extend_from_slice(&self.buf[..l]);
                    normalized.extend_from_slice(b"\r\n\r\n");
                    normalized.extend_from_slice(&self.buf[l + 2..]);
                    self.buf = normalized;
                    return self.check_header_size(l + 4, request_id);
                }
                _ => {}
            }

            // No terminator yet; the current request's headers start at the
            // front of the buffer, so the whole buffer counts against the cap.
            if self.buf.len() >= self.config.max_header_size {
                return Err(self.headers_too_large(request_id));
            }

            match self.recv_chunk() {
                Ok(RecvOutcome::Data(_)) => {}
                Ok(RecvOutcome::Eof) => {
                    if self.buf.is_empty() {
                        debug!(conn = self.id, req = request_id, "connection closed by peer");
                        return Err(Outcome::Close);
                    }
                    warn!(conn = self.id, req = request_id, "peer closed mid-headers");
                    return Err(Outcome::Fail);
                }
                Ok(RecvOutcome::TimedOut) => {
                    warn!(conn = self.id, req = request_id, "recv timeout");
                    return Err(Outcome::Fail);
                }
                Err(e) => {
                    error!(conn = self.id, req = request_id, error = %e, "recv error");
                    return Err(Outcome::Fail);
                }
            }
        }
    }

    fn check_header_size(&mut self, header_end: usize, request_id: u64) -> Result<usize, Outcome> {
        if header_end > self.config.max_header_size {
            return Err(self.headers_too_large(request_id));
        }
        Ok(header_end)
    }

    fn headers_too_large(&mut self, request_id: u64) -> Outcome {
        error!(conn = self.id, req = request_id, "headers too large");
        self.fail_with(
            request_id,
            Response::new(StatusCode::PayloadTooLarge, "text/plain", "Headers too large"),
        )
    }

    /// Scans the raw header block for `Content-Length`. Absent means zero;
    /// more than one occurrence, a non-numeric value, or a value over the
    /// configured maximum is an error.
    fn content_length(&mut self, header_end: usize, request_id: u64) -> Result<usize, Outcome> {
        let block = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
        let mut values = block.lines().filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().to_owned())
        });

        let Some(value) = values.next() else {
            return Ok(0);
        };
        if values.next().is_some() {
            error!(conn = self.id, req = request_id, "multiple Content-Length headers");
            return Err(self.fail_with(
                request_id,
                Response::new(
                    StatusCode::BadRequest,
                    "text/plain",
                    "Multiple Content-Length headers",
                ),
            ));
        }

        let length: usize = match value.parse() {
            Ok(n) => n,
            Err(_) => {
                error!(conn = self.id, req = request_id, value = %value, "invalid Content-Length");
                return Err(self.fail_with(
                    request_id,
                    Response::new(StatusCode::BadRequest, "text/plain", "Invalid Content-Length"),
                ));
            }
        };
        if length > self.config.max_content_length {
            error!(conn = self.id, req = request_id, length, "Content-Length too large");
            return Err(self.fail_with(
                request_id,
                Response::new(StatusCode::PayloadTooLarge, "text/plain", "Content too large"),
            ));
        }
        Ok(length)
    }

    /// Reads until the buffer holds the full body declared by `Content-Length`.
    fn read_body(
        &mut self,
        header_end: usize,
        content_length: usize,
        request_id: u64,
    ) -> Result<(), Outcome> {
        while self.buf.len() < header_end + content_length {
            match self.recv_chunk() {
                Ok(RecvOutcome::Data(_)) => {}
                Ok(RecvOutcome::Eof) | Ok(RecvOutcome::TimedOut) => {
                    error!(
                        conn = self.id,
                        req = request_id,
                        expected = content_length,
                        "body incomplete"
                    );
                    return Err(self.fail_with(
                        request_id,
                        Response::new(StatusCode::BadRequest, "text/plain", "Incomplete request body"),
                    ));
                }
                Err(e) => {
                    error!(conn = self.id, req = request_id, error = %e, "recv error during body");
                    return Err(Outcome::Fail);
                }
            }
        }
        Ok(())
    }

    fn recv_chunk(&mut self) -> io::Result<RecvOutcome> {
        let mut temp = [0u8; 1024];
        let outcome = self.stream.recv(&mut temp)?;
        if let RecvOutcome::Data(n) = outcome {
            self.buf.extend_from_slice(&temp[..n]);
        }
        Ok(outcome)
    }

    /// Pre-parses a JSON body once, so handlers and middleware share one DOM.
    fn parse_json_body(
        &mut self,
        request: &Request,
        request_id: u64,
    ) -> Result<Option<Value>, Outcome> {
        let is_json = request
            .headers()
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"));
        if !is_json || request.body().is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice(request.body()) {
            Ok(value) => {
                debug!(conn = self.id, req = request_id, "parsed JSON body");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(conn = self.id, req = request_id, error = %e, "JSON parse error");
                Err(self.fail_with(
                    request_id,
                    Response::new(StatusCode::BadRequest, "text/plain", "Invalid JSON"),
                ))
            }
        }
    }

    /// Sends a best-effort error response and reports failure.
    fn fail_with(&mut self, request_id: u64, mut response: Response) -> Outcome {
        response.set_header("Connection", "close");
        if let Err(e) = self.send_response(&response, request_id) {
            debug!(conn = self.id, req = request_id, error = %e, "error response not delivered");
        }
        Outcome::Fail
    }

    /// Sends a response; for stream bodies the file is opened before any
    /// bytes go out, so an open failure still yields a clean `500`.
    fn send_response(&mut self, response: &Response, request_id: u64) -> io::Result<()> {
        match response.body() {
            Body::InMemory(_) => {
                let wire = response.serialize();
                self.stream.send_all(&wire)?;
                info!(
                    conn = self.id,
                    req = request_id,
                    bytes = wire.len(),
                    status = response.status().as_u16(),
                    "response sent"
                );
            }
            Body::Stream { path, size, offset } => {
                let mut file = match File::open(path) {
                    Ok(file) => file,
                    Err(e) => {
                        error!(
                            conn = self.id,
                            req = request_id,
                            path = %path.display(),
                            error = %e,
                            "failed to open file for streaming"
                        );
                        let mut fallback = Response::json(
                            StatusCode::InternalServerError,
                            &serde_json::json!({"error": "Failed to stream file"}),
                        );
                        if let Some(connection) = response.headers().get("connection") {
                            fallback.set_header("Connection", connection);
                        }
                        self.stream.send_all(&fallback.serialize())?;
                        return Ok(());
                    }
                };

                let headers = response.serialize_headers();
                self.stream.send_all(&headers)?;

                // Headers are on the wire now; any failure past this point
                // must abort the connection rather than emit a second
                // response.
                file.seek(SeekFrom::Start(*offset))?;
                let mut chunk = vec![0u8; self.config.stream_buffer_size.max(1)];
                let mut remaining = *size;
                while remaining > 0 {
                    let want = remaining.min(chunk.len() as u64) as usize;
                    let read = file.read(&mut chunk[..want])?;
                    if read == 0 {
                        warn!(
                            conn = self.id,
                            req = request_id,
                            remaining,
                            "file ended before promised size"
                        );
                        break;
                    }
                    self.stream.send_all(&chunk[..read])?;
                    remaining -= read as u64;
                }
                info!(
                    conn = self.id,
                    req = request_id,
                    bytes = size - remaining,
                    status = response.status().as_u16(),
                    "response streamed"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Listener;
    use crate::router::middleware;
    use std::io::Write;
    use std::net::{Shutdown, TcpStream};
    use std::sync::Arc;

    fn demo_router() -> Router {
        let mut router = Router::new();
        router.add_middleware_fn(middleware::bearer_auth("/user/", "dummy_token"));
        router.get("/", |_req, _params, _json| {
            Response::new(StatusCode::Ok, "text/plain", "Welcome to the home page!")
        });
        router.post("/echo", |req, _params, _json| {
            Response::new(StatusCode::Ok, "text/plain", req.body().clone())
        });
        router.get("/user/:id", |_req, params, _json| {
            Response::json(
                StatusCode::Ok,
                &serde_json::json!({"id": params["id"], "message": "User found"}),
            )
        });
        router.post("/json", |_req, _params, json| match json {
            Some(value) => Response::json(
                StatusCode::Ok,
                &serde_json::json!({"status": "received", "name": value.get("name").and_then(Value::as_str).unwrap_or("Unknown")}),
            ),
            None => Response::json(
                StatusCode::BadRequest,
                &serde_json::json!({"error": "Missing or invalid JSON body"}),
            ),
        });
        router.get("/panic", |_req, _params, _json| panic!("handler exploded"));
        router
    }

    /// Writes `input` to a fresh connection served by `router` and returns
    /// everything the server sent back.
    fn exchange_with(router: Arc<Router>, config: ConnectionConfig, input: &[u8]) -> String {
        let listener = Listener::bind("127.0.0.1", 0, 8).unwrap();
        let addr = listener.local_addr();
        let server = std::thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            Connection::new(stream, peer, 1, config).handle(&router);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(input).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let mut output = Vec::new();
        client.read_to_end(&mut output).unwrap();
        server.join().unwrap();
        String::from_utf8_lossy(&output).into_owned()
    }

    fn exchange(input: &[u8]) -> String {
        exchange_with(Arc::new(demo_router()), ConnectionConfig::default(), input)
    }

    #[test]
    fn echo_round_trip() {
        let reply = exchange(b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Content-Type: text/plain\r\n"));
        assert!(reply.contains("Content-Length: 5\r\n"));
        assert!(reply.ends_with("hello"));
    }

    #[test]
    fn parameterized_route_with_token() {
        let reply = exchange(
            b"GET /user/42 HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer dummy_token\r\n\r\n",
        );
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains(r#"{"id":"42","message":"User found"}"#));
    }

    #[test]
    fn missing_token_is_rejected() {
        let reply = exchange(b"GET /user/42 HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(reply.contains(r#"{"error":"Unauthorized"}"#));
    }

    #[test]
    fn pipelined_requests_share_the_connection() {
        let reply = exchange(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(reply.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(reply.matches("Connection: keep-alive\r\n").count(), 2);
        assert_eq!(reply.matches("Welcome to the home page!").count(), 2);
    }

    #[test]
    fn missing_host_on_http11_is_rejected() {
        let reply = exchange(b"GET / HTTP/1.1\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(reply.contains("Missing Host header"));
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[test]
    fn http10_without_host_is_fine_but_closes() {
        let reply = exchange(b"GET / HTTP/1.0\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[test]
    fn multiple_content_length_headers_are_rejected() {
        let reply = exchange(
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\nhello",
        );
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn bare_lf_terminator_is_normalized() {
        let reply = exchange(b"GET / HTTP/1.1\r\nHost: x\n\n");
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains("Welcome"));
    }

    #[test]
    fn invalid_json_body_is_rejected() {
        let reply = exchange(
            b"POST /json HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 9\r\n\r\n{\"name\": ",
        );
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(reply.contains("Invalid JSON"));
    }

    #[test]
    fn valid_json_body_reaches_the_handler() {
        let body = br#"{"name": "ada"}"#;
        let raw = format!(
            "POST /json HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut input = raw.into_bytes();
        input.extend_from_slice(body);
        let reply = exchange(&input);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.contains(r#""name":"ada""#));
    }

    #[test]
    fn handler_panic_becomes_500_json() {
        let reply = exchange(b"GET /panic HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(reply.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(reply.contains(r#"{"error":"Internal server error"}"#));
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let config = ConnectionConfig {
            max_header_size: 128,
            ..ConnectionConfig::default()
        };
        let mut input = b"GET / HTTP/1.1\r\nHost: x\r\nX-Padding: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(256));
        input.extend_from_slice(b"\r\n\r\n");
        let reply = exchange_with(Arc::new(demo_router()), config, &input);
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let config = ConnectionConfig {
            max_content_length: 16,
            ..ConnectionConfig::default()
        };
        let reply = exchange_with(
            Arc::new(demo_router()),
            config,
            b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n",
        );
        assert!(reply.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn connection_close_is_honored() {
        let reply = exchange(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
        assert_eq!(reply.matches("HTTP/1.1 200 OK\r\n").count(), 1);
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[test]
    fn streamed_file_bodies_reach_the_client() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "0123456789").unwrap();
        let mut router = Router::new();
        let static_files = crate::router::static_files::StaticFiles::new(dir.path(), "/assets")
            .unwrap()
            .stream_threshold(4);
        router.set_static_files(static_files);

        let reply = exchange_with(
            Arc::new(router),
            ConnectionConfig::default(),
            b"GET /assets/big.txt HTTP/1.1\r\nHost: x\r\nRange: bytes=2-5\r\n\r\n",
        );
        assert!(reply.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(reply.contains("Content-Range: bytes 2-5/10\r\n"));
        assert!(reply.contains("Content-Length: 4\r\n"));
        assert!(reply.ends_with("2345"));
    }
}
