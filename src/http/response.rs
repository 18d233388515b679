//! HTTP/1.1 response construction and serialization.
//!
//! A [`Response`] carries a status, a content type, extra headers, and a
//! [`Body`] that is either in-memory bytes or a file region to stream. The
//! serializers here are the only place `Content-Type` and `Content-Length`
//! are written, so they appear exactly once no matter what handlers or
//! middleware set.

use std::path::PathBuf;

use bytes::{BufMut, Bytes, BytesMut};

use super::{HeaderMap, StatusCode};

/// `Server` header value seeded on every response.
pub const SERVER_NAME: &str = concat!("hearth/", env!("CARGO_PKG_VERSION"));

/// `X-Powered-By` header value seeded on every response.
pub const POWERED_BY: &str = "hearth";

/// A response body: either bytes held in memory or a file region streamed
/// directly from disk by the connection handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    InMemory(Bytes),
    /// `size` bytes of `path`, starting at `offset`. `size` must not exceed
    /// the file length minus `offset` at the time the file is opened.
    Stream {
        path: PathBuf,
        size: u64,
        offset: u64,
    },
}

impl Body {
    /// Returns the value serialized as `Content-Length`.
    pub fn content_length(&self) -> u64 {
        match self {
            Body::InMemory(bytes) => bytes.len() as u64,
            Body::Stream { size, .. } => *size,
        }
    }
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// `Server` and `X-Powered-By` are seeded at construction; middleware and the
/// connection handler augment the header map afterwards (`Connection`, range
/// headers, cache headers).
///
/// # Examples
///
/// ```
/// use hearth::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok, "application/json", r#"{"status":"ok"}"#);
/// let wire = response.serialize();
/// let text = std::str::from_utf8(&wire).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// assert!(text.ends_with("{\"status\":\"ok\"}"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    content_type: String,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    /// Creates a response with an in-memory body.
    pub fn new(status: StatusCode, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::with_body(status, content_type, Body::InMemory(body.into()))
    }

    /// Creates a response whose body will be streamed from a file region.
    pub fn stream(
        status: StatusCode,
        content_type: impl Into<String>,
        path: impl Into<PathBuf>,
        size: u64,
        offset: u64,
    ) -> Self {
        Self::with_body(
            status,
            content_type,
            Body::Stream {
                path: path.into(),
                size,
                offset,
            },
        )
    }

    /// Creates a JSON response with the given serialized value.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, "application/json", value.to_string())
    }

    fn with_body(status: StatusCode, content_type: impl Into<String>, body: Body) -> Self {
        let mut headers = HeaderMap::new();
        headers.append("Server", SERVER_NAME);
        headers.append("X-Powered-By", POWERED_BY);
        Self {
            status,
            content_type: content_type.into(),
            headers,
            body,
        }
    }

    /// Sets a header, replacing any existing value with the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Builder-style [`set_header`](Self::set_header).
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the content type of this response.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the response body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Serializes the full wire response.
    ///
    /// For a [`Body::Stream`] body this is identical to
    /// [`serialize_headers`](Self::serialize_headers): the file bytes are
    /// never buffered here, the connection handler copies them after sending
    /// the header block.
    pub fn serialize(&self) -> BytesMut {
        let mut buf = self.serialize_headers();
        if let Body::InMemory(bytes) = &self.body {
            buf.put(bytes.as_ref());
        }
        buf
    }

    /// Serializes the status line and header block only, CRLF-terminated.
    ///
    /// `Content-Type` comes from the field and `Content-Length` from the body
    /// variant; entries with either name in the header map are skipped so
    /// neither can be duplicated by a handler that set them itself.
    pub fn serialize_headers(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 48);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        buf.put(format!("Content-Length: {}\r\n", self.body.content_length()).as_bytes());
        for (name, value) in self.headers.iter_merged() {
            if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        buf.put(&b"\r\n"[..]);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok, "text/plain", "Hello");
        let s = to_string(r.serialize());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Type: text/plain\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn default_headers_are_seeded() {
        let r = Response::new(StatusCode::Ok, "text/plain", "");
        let s = to_string(r.serialize());
        assert!(s.contains(&format!("Server: {SERVER_NAME}\r\n")));
        assert!(s.contains(&format!("X-Powered-By: {POWERED_BY}\r\n")));
    }

    #[test]
    fn content_length_appears_exactly_once() {
        // Even when a handler sets its own Content-Length, the builder wins.
        let r = Response::new(StatusCode::Ok, "text/plain", "abc").header("Content-Length", "999");
        let s = to_string(r.serialize());
        assert_eq!(s.matches("Content-Length:").count(), 1);
        assert!(s.contains("Content-Length: 3\r\n"));
    }

    #[test]
    fn content_type_appears_exactly_once() {
        let r = Response::new(StatusCode::Ok, "application/json", "{}")
            .header("Content-Type", "text/html");
        let s = to_string(r.serialize());
        assert_eq!(s.matches("Content-Type:").count(), 1);
        assert!(s.contains("Content-Type: application/json\r\n"));
    }

    #[test]
    fn stream_body_reports_region_size() {
        let r = Response::stream(StatusCode::PartialContent, "image/png", "/tmp/x.png", 4096, 512);
        assert_eq!(r.body().content_length(), 4096);
        let s = to_string(r.serialize());
        assert!(s.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(s.contains("Content-Length: 4096\r\n"));
        // No body bytes — the connection handler streams them.
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn headers_only_matches_full_minus_body() {
        let r = Response::new(StatusCode::Ok, "text/plain", "payload");
        let full = to_string(r.serialize());
        let head = to_string(r.serialize_headers());
        assert_eq!(full, format!("{head}payload"));
    }

    #[test]
    fn set_header_replaces() {
        let mut r = Response::new(StatusCode::Ok, "text/plain", "x");
        r.set_header("Connection", "keep-alive");
        r.set_header("Connection", "close");
        let s = to_string(r.serialize());
        assert_eq!(s.matches("Connection:").count(), 1);
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn json_helper() {
        let r = Response::json(
            StatusCode::NotFound,
            &serde_json::json!({"error": "Page not found"}),
        );
        assert_eq!(r.content_type(), "application/json");
        let s = to_string(r.serialize());
        assert!(s.contains(r#"{"error":"Page not found"}"#));
    }
}
