//! HTTP/1.1 protocol types and parsing.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`Version`], [`StatusCode`], [`HeaderMap`], [`Request`],
//! and [`Response`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;
pub mod url;

pub use headers::HeaderMap;
pub use request::{Range, Request};
pub use response::{Body, Response};

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use hearth::http::StatusCode;
///
/// let status = StatusCode::Ok;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), "OK");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    // 2xx Success
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    PartialContent = 206,

    // 3xx Redirection
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,

    // 4xx Client Error
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    PayloadTooLarge = 413,
    RangeNotSatisfiable = 416,

    // 5xx Server Error
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    HttpVersionNotSupported = 505,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::PartialContent => "Partial Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::RangeNotSatisfiable => "Range Not Satisfiable",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
            Self::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Parsed by table lookup; anything not in the table becomes
/// [`Method::Unknown`] rather than a parse error, so a request with an exotic
/// method still routes (and falls through to `405`/`404` like any other
/// unmatched request).
///
/// # Examples
///
/// ```
/// use hearth::http::Method;
///
/// assert_eq!(Method::parse("GET"), Method::Get);
/// assert_eq!(Method::parse("BREW"), Method::Unknown);
/// assert_eq!(Method::Get.as_str(), "GET");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Unknown,
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Trace,
    Connect,
}

impl Method {
    /// Parses a method token. Unrecognized tokens map to [`Method::Unknown`].
    pub fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "TRACE" => Self::Trace,
            "CONNECT" => Self::Connect,
            _ => Self::Unknown,
        }
    }

    /// Returns the method as a string slice.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP protocol version.
///
/// Wire parsing accepts the canonical version strings; anything unrecognized
/// falls back to [`Version::Http11`], matching the lenient behavior clients
/// expect from a single-host server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http09,
    Http10,
    #[default]
    Http11,
    Http2,
    Http3,
}

impl Version {
    /// Parses a version token, falling back to HTTP/1.1 on anything unknown.
    pub fn parse(token: &str) -> Self {
        match token {
            "HTTP/0.9" => Self::Http09,
            "HTTP/1.0" => Self::Http10,
            "HTTP/1.1" => Self::Http11,
            "HTTP/2" => Self::Http2,
            "HTTP/3" => Self::Http3,
            _ => Self::Http11,
        }
    }

    /// Returns the canonical wire string for this version.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http09 => "HTTP/0.9",
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_table_lookup() {
        assert_eq!(Method::parse("GET"), Method::Get);
        assert_eq!(Method::parse("DELETE"), Method::Delete);
        assert_eq!(Method::parse("get"), Method::Unknown); // case-sensitive per RFC 9110
        assert_eq!(Method::parse("PROPFIND"), Method::Unknown);
    }

    #[test]
    fn version_fallback() {
        assert_eq!(Version::parse("HTTP/1.0"), Version::Http10);
        assert_eq!(Version::parse("HTTP/2"), Version::Http2);
        assert_eq!(Version::parse("HTTP/9.9"), Version::Http11);
        assert_eq!(Version::parse(""), Version::Http11);
    }

    #[test]
    fn status_reason_phrases() {
        assert_eq!(StatusCode::Ok.canonical_reason(), "OK");
        assert_eq!(StatusCode::PartialContent.as_u16(), 206);
        assert_eq!(
            StatusCode::RangeNotSatisfiable.canonical_reason(),
            "Range Not Satisfiable"
        );
        assert_eq!(format!("{}", StatusCode::NotFound), "404 Not Found");
    }
}
