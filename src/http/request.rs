//! HTTP/1.1 request parsing.
//!
//! [`Request::parse`] consumes a byte buffer holding exactly one request —
//! headers terminated by `\r\n\r\n`, followed by a body of exact
//! `Content-Length` — as delivered by the connection layer, which handles
//! incremental reads, pipelining, and bare-LF normalization before the parser
//! ever sees the bytes.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use super::url::{self, ParamMap};
use super::{HeaderMap, Method, Version};

/// Errors produced while parsing a request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no CRLF found — request line missing")]
    MissingRequestLine,

    #[error("no CRLFCRLF found — header terminator missing")]
    MissingHeaderTerminator,

    #[error("request line is not `<method> <target> <version>`")]
    InvalidRequestLine,

    #[error("malformed Range header: {value}")]
    InvalidRange { value: String },

    #[error("multiple Content-Length headers")]
    DuplicateContentLength,
}

/// A byte range requested via `Range: bytes=<start>-<end>`.
///
/// `end == 0` after parsing is the sentinel for "to the end of the resource"
/// (a missing end bound on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    /// Resolves this range against a resource of `size` bytes.
    ///
    /// Returns the inclusive `(start, end)` byte positions, or `None` when
    /// the range is not satisfiable (start past the end, inverted bounds, or
    /// end past the resource).
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        let end = if self.end == 0 { size - 1 } else { self.end };
        if self.start >= size || self.start > end || end >= size {
            return None;
        }
        Some((self.start, end))
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// # Examples
///
/// ```
/// use hearth::http::{Method, Request};
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let request = Request::parse(raw.as_slice().into()).unwrap();
///
/// assert_eq!(request.method(), Method::Get);
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_params()["name"], vec!["world"]);
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    version: Version,
    /// Decoded path, query stripped. Always begins with `/`.
    path: String,
    raw: Bytes,
    headers: HeaderMap,
    query_params: ParamMap,
    form_params: ParamMap,
    body: Bytes,
    range: Option<Range>,
}

impl Request {
    /// Parses a complete request from `raw`.
    ///
    /// # Errors
    ///
    /// - [`ParseError::MissingRequestLine`] / [`ParseError::MissingHeaderTerminator`]
    ///   when the framing the connection layer guarantees is absent.
    /// - [`ParseError::InvalidRequestLine`] when the request line does not
    ///   split into method, target, and version, or the target does not start
    ///   with `/`.
    /// - [`ParseError::InvalidRange`] when a `Range` header is present but
    ///   does not match `bytes=<digits>-<digits?>`.
    pub fn parse(raw: Bytes) -> Result<Self, ParseError> {
        let first_line_end =
            memchr::memmem::find(&raw, b"\r\n").ok_or(ParseError::MissingRequestLine)?;
        let headers_end =
            memchr::memmem::find(&raw, b"\r\n\r\n").ok_or(ParseError::MissingHeaderTerminator)?;

        let first_line = String::from_utf8_lossy(&raw[..first_line_end]);
        let mut tokens = first_line.split_whitespace();
        let (method_token, target, version_token) = match (tokens.next(), tokens.next(), tokens.next())
        {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return Err(ParseError::InvalidRequestLine),
        };

        let method = Method::parse(method_token);
        let version = Version::parse(version_token);

        let (path_part, query_part) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let path = url::decode(path_part);
        if !path.starts_with('/') {
            return Err(ParseError::InvalidRequestLine);
        }
        let query_params = query_part.map(url::parse_params).unwrap_or_default();

        // A request can end `\r\n\r\n` straight after the request line, in
        // which case the header block is empty and the two finds overlap.
        let headers_block = if headers_end > first_line_end + 2 {
            String::from_utf8_lossy(&raw[first_line_end + 2..headers_end])
        } else {
            "".into()
        };
        let mut headers = HeaderMap::new();
        let mut range = None;
        for line in headers_block.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                warn!(line, "malformed header line, skipping");
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("range") {
                range = Some(parse_range(value)?);
            }
            // Duplicates are fine in general (later wins on lookup); a second
            // Content-Length is rejected outright.
            if name.eq_ignore_ascii_case("content-length") && headers.contains("content-length") {
                return Err(ParseError::DuplicateContentLength);
            }
            headers.append(name, value);
        }

        let body = raw.slice(headers_end + 4..);

        let mut form_params = ParamMap::new();
        if method == Method::Post {
            let is_form = headers
                .get("content-type")
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            if is_form && !body.is_empty() {
                form_params = url::parse_params(&String::from_utf8_lossy(&body));
            }
        }

        Ok(Self {
            method,
            version,
            path,
            raw,
            headers,
            query_params,
            form_params,
            body,
            range,
        })
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the decoded request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the original request bytes.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the decoded query parameters.
    pub fn query_params(&self) -> &ParamMap {
        &self.query_params
    }

    /// Returns the decoded form parameters (POST bodies with
    /// `Content-Type: application/x-www-form-urlencoded`).
    pub fn form_params(&self) -> &ParamMap {
        &self.form_params
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the parsed `Range` header, if one was present.
    pub fn range(&self) -> Option<Range> {
        self.range
    }

    /// Returns `true` if the connection should be kept open after this request.
    ///
    /// An explicit `Connection: keep-alive` or `Connection: close` is
    /// honored; otherwise HTTP/1.1 defaults to keep-alive and everything
    /// older defaults to close.
    pub fn wants_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            _ => self.version == Version::Http11,
        }
    }

    /// Returns `true` if this request asks for a WebSocket upgrade.
    ///
    /// No handshake is performed anywhere in this crate; callers log and
    /// serve the request as plain HTTP.
    pub fn is_upgrade_request(&self) -> bool {
        let connection_upgrade = self
            .headers
            .get("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
        let upgrade_websocket = self
            .headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        connection_upgrade && upgrade_websocket
    }
}

/// Parses a `Range` header value of the strict form `bytes=<start>-<end?>`.
fn parse_range(value: &str) -> Result<Range, ParseError> {
    let malformed = || ParseError::InvalidRange {
        value: value.to_owned(),
    };
    let bounds = value.strip_prefix("bytes=").ok_or_else(malformed)?;
    let (start_str, end_str) = bounds.split_once('-').ok_or_else(malformed)?;
    if start_str.is_empty() || !start_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let start = start_str.parse().map_err(|_| malformed())?;
    let end = if end_str.is_empty() {
        0
    } else if end_str.bytes().all(|b| b.is_ascii_digit()) {
        end_str.parse().map_err(|_| malformed())?
    } else {
        return Err(malformed());
    };
    Ok(Range { start, end })
}
