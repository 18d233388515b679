//! Static file serving with traversal defense, byte ranges, and caching.
//!
//! Applies only to `GET` requests whose path begins with the configured URL
//! prefix. Files at or under [`DEFAULT_STREAM_THRESHOLD`] are served through
//! the LRU [`FileCache`]; larger files become [`Body::Stream`] responses the
//! connection handler copies straight from disk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tracing::{debug, error};

use crate::cache::{FileCache, DEFAULT_MAX_ENTRIES};
use crate::http::{Method, Request, Response, StatusCode};

use super::error_response;

/// Files larger than this many bytes are streamed instead of cached (1 MiB).
pub const DEFAULT_STREAM_THRESHOLD: u64 = 1024 * 1024;

/// MIME type for a file extension, from a fixed table.
fn mime_type(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "ico" => "image/x-icon",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Static file configuration: a canonical root directory, the URL prefix it
/// is mounted at, and the content cache.
pub struct StaticFiles {
    root: PathBuf,
    url_prefix: String,
    cache: FileCache,
    stream_threshold: u64,
}

impl StaticFiles {
    /// Canonicalizes `root` and mounts it at `url_prefix`.
    ///
    /// # Errors
    ///
    /// Fails when `root` does not canonicalize to a directory or when
    /// `url_prefix` does not begin with `/`.
    pub fn new(root: impl AsRef<Path>, url_prefix: &str) -> io::Result<Self> {
        if !url_prefix.starts_with('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("static url prefix must begin with '/': {url_prefix}"),
            ));
        }
        let root = fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("static root is not a directory: {}", root.display()),
            ));
        }
        let mut url_prefix = url_prefix.to_owned();
        if !url_prefix.ends_with('/') {
            url_prefix.push('/');
        }
        Ok(Self {
            root,
            url_prefix,
            cache: FileCache::new(DEFAULT_MAX_ENTRIES),
            stream_threshold: DEFAULT_STREAM_THRESHOLD,
        })
    }

    /// Overrides the stream threshold (bytes).
    #[must_use]
    pub fn stream_threshold(mut self, bytes: u64) -> Self {
        self.stream_threshold = bytes;
        self
    }

    /// Replaces the content cache (to resize it).
    #[must_use]
    pub fn cache(mut self, cache: FileCache) -> Self {
        self.cache = cache;
        self
    }

    /// Attempts to serve `request` as a static file.
    ///
    /// Returns `None` when the request is not for this mount (wrong method or
    /// prefix); any `Some` response — success or error — is final.
    pub fn handle(&self, request: &Request) -> Option<Response> {
        if request.method() != Method::Get || !request.path().starts_with(&self.url_prefix) {
            return None;
        }
        Some(self.serve(request))
    }

    fn serve(&self, request: &Request) -> Response {
        let relative = &request.path()[self.url_prefix.len()..];
        if relative.contains("..") {
            error!(path = request.path(), "path traversal attempt");
            return error_response(request, StatusCode::Forbidden, "Access denied");
        }

        let full_path = self.root.join(relative);
        let canonical = match fs::canonicalize(&full_path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %full_path.display(), "static file not found");
                return error_response(request, StatusCode::NotFound, "File not found");
            }
            Err(e) => {
                error!(path = %full_path.display(), error = %e, "failed to resolve path");
                return error_response(request, StatusCode::InternalServerError, "Failed to resolve file");
            }
        };
        if !canonical.starts_with(&self.root) {
            error!(
                path = %canonical.display(),
                root = %self.root.display(),
                "resolved path escapes static root"
            );
            return error_response(request, StatusCode::Forbidden, "Access denied");
        }

        let metadata = match fs::metadata(&canonical) {
            Ok(m) if m.is_dir() => {
                debug!(path = %canonical.display(), "refusing to serve directory");
                return error_response(request, StatusCode::NotFound, "File not found");
            }
            Ok(m) => m,
            Err(e) => {
                error!(path = %canonical.display(), error = %e, "failed to stat file");
                return error_response(request, StatusCode::InternalServerError, "Failed to read file");
            }
        };
        let file_size = metadata.len();
        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(e) => {
                error!(path = %canonical.display(), error = %e, "failed to read mtime");
                return error_response(
                    request,
                    StatusCode::InternalServerError,
                    "Failed to read file metadata",
                );
            }
        };
        let content_type = mime_type(&canonical);

        let mut response = if file_size <= self.stream_threshold {
            let content = match self.read_cached(&canonical, modified) {
                Ok(content) => content,
                Err(e) => {
                    error!(path = %canonical.display(), error = %e, "failed to read file");
                    return error_response(request, StatusCode::InternalServerError, "Failed to read file");
                }
            };
            match request.range() {
                Some(range) => match range.resolve(file_size) {
                    Some((start, end)) => {
                        let slice = content.slice(start as usize..=end as usize);
                        Response::new(StatusCode::PartialContent, content_type, slice).header(
                            "Content-Range",
                            format!("bytes {start}-{end}/{file_size}"),
                        )
                    }
                    None => return range_not_satisfiable(request, file_size),
                },
                None => Response::new(StatusCode::Ok, content_type, content),
            }
        } else {
            match request.range() {
                Some(range) => match range.resolve(file_size) {
                    Some((start, end)) => Response::stream(
                        StatusCode::PartialContent,
                        content_type,
                        &canonical,
                        end - start + 1,
                        start,
                    )
                    .header("Content-Range", format!("bytes {start}-{end}/{file_size}")),
                    None => return range_not_satisfiable(request, file_size),
                },
                None => Response::stream(StatusCode::Ok, content_type, &canonical, file_size, 0),
            }
        };

        response.set_header("Accept-Ranges", "bytes");
        response.set_header("Last-Modified", httpdate::fmt_http_date(modified));
        response.set_header("Cache-Control", "max-age=3600");
        debug!(
            path = %canonical.display(),
            content_type,
            size = file_size,
            status = response.status().as_u16(),
            "serving static file"
        );
        response
    }

    /// Reads a small file through the cache: a hit with a matching mtime
    /// serves the cached bytes; a miss reads from disk and populates.
    fn read_cached(&self, canonical: &Path, modified: SystemTime) -> io::Result<Bytes> {
        let key = canonical.to_string_lossy();
        if let Some(content) = self.cache.get(&key, modified) {
            return Ok(content);
        }
        let content = Bytes::from(fs::read(canonical)?);
        self.cache.put(&key, content.clone(), modified);
        Ok(content)
    }
}

fn range_not_satisfiable(request: &Request, file_size: u64) -> Response {
    debug!(file_size, "range not satisfiable");
    error_response(request, StatusCode::RangeNotSatisfiable, "Invalid range")
        .header("Content-Range", format!("bytes */{file_size}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Body;
    use bytes::Bytes as RawBytes;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, StaticFiles) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f.txt"), "0123456789").unwrap();
        fs::write(dir.path().join("page.html"), "<html></html>").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let static_files = StaticFiles::new(dir.path(), "/assets").unwrap();
        (dir, static_files)
    }

    fn get(target: &str) -> Request {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: x\r\n\r\n");
        Request::parse(RawBytes::from(raw)).unwrap()
    }

    fn get_with_range(target: &str, range: &str) -> Request {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: x\r\nRange: {range}\r\n\r\n");
        Request::parse(RawBytes::from(raw)).unwrap()
    }

    fn body_bytes(response: &Response) -> Vec<u8> {
        match response.body() {
            Body::InMemory(bytes) => bytes.to_vec(),
            Body::Stream { .. } => panic!("expected in-memory body"),
        }
    }

    #[test]
    fn prefix_gains_trailing_slash() {
        let (_dir, sf) = fixture();
        assert_eq!(sf.url_prefix, "/assets/");
    }

    #[test]
    fn rejects_prefix_without_leading_slash() {
        let dir = TempDir::new().unwrap();
        assert!(StaticFiles::new(dir.path(), "assets").is_err());
    }

    #[test]
    fn non_matching_requests_fall_through() {
        let (_dir, sf) = fixture();
        assert!(sf.handle(&get("/other/f.txt")).is_none());
        // POST never hits the static branch.
        let raw = "POST /assets/f.txt HTTP/1.1\r\nHost: x\r\n\r\n";
        let post = Request::parse(RawBytes::from(raw)).unwrap();
        assert!(sf.handle(&post).is_none());
    }

    #[test]
    fn serves_whole_file_with_headers() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/f.txt")).unwrap();
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.content_type(), "text/plain");
        assert_eq!(body_bytes(&res), b"0123456789");
        assert_eq!(res.headers().get("accept-ranges"), Some("bytes"));
        assert_eq!(res.headers().get("cache-control"), Some("max-age=3600"));
        assert!(res.headers().get("last-modified").unwrap().ends_with("GMT"));
    }

    #[test]
    fn mime_type_by_extension() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/page.html")).unwrap();
        assert_eq!(res.content_type(), "text/html");
        assert_eq!(mime_type(Path::new("x.unknownext")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("x.jpeg")), "image/jpeg");
    }

    #[test]
    fn range_returns_partial_content() {
        let (_dir, sf) = fixture();
        let res = sf
            .handle(&get_with_range("/assets/f.txt", "bytes=2-5"))
            .unwrap();
        assert_eq!(res.status(), StatusCode::PartialContent);
        assert_eq!(body_bytes(&res), b"2345");
        assert_eq!(res.headers().get("content-range"), Some("bytes 2-5/10"));
        assert_eq!(res.headers().get("accept-ranges"), Some("bytes"));
    }

    #[test]
    fn open_ended_range_runs_to_eof() {
        let (_dir, sf) = fixture();
        let res = sf
            .handle(&get_with_range("/assets/f.txt", "bytes=7-"))
            .unwrap();
        assert_eq!(res.status(), StatusCode::PartialContent);
        assert_eq!(body_bytes(&res), b"789");
        assert_eq!(res.headers().get("content-range"), Some("bytes 7-9/10"));
    }

    #[test]
    fn unsatisfiable_range_is_416() {
        let (_dir, sf) = fixture();
        for range in ["bytes=10-", "bytes=5-2", "bytes=0-10"] {
            let res = sf.handle(&get_with_range("/assets/f.txt", range)).unwrap();
            assert_eq!(res.status(), StatusCode::RangeNotSatisfiable, "{range}");
            assert_eq!(res.headers().get("content-range"), Some("bytes */10"));
        }
    }

    #[test]
    fn dotdot_is_forbidden_without_touching_disk() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/../etc/passwd")).unwrap();
        assert_eq!(res.status(), StatusCode::Forbidden);
        assert_eq!(res.content_type(), "application/json");
    }

    #[test]
    fn percent_encoded_dotdot_is_forbidden() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/%2e%2e/etc/passwd")).unwrap();
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[test]
    fn forbidden_body_negotiates_html() {
        let (_dir, sf) = fixture();
        let raw = "GET /assets/../x HTTP/1.1\r\nHost: x\r\nAccept: text/html\r\n\r\n";
        let req = Request::parse(RawBytes::from(raw)).unwrap();
        let res = sf.handle(&req).unwrap();
        assert_eq!(res.status(), StatusCode::Forbidden);
        assert_eq!(res.content_type(), "text/html; charset=utf-8");
    }

    #[test]
    fn missing_file_is_404() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/nope.txt")).unwrap();
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[test]
    fn directory_is_404() {
        let (_dir, sf) = fixture();
        let res = sf.handle(&get("/assets/sub")).unwrap();
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[test]
    fn small_files_populate_the_cache() {
        let (_dir, sf) = fixture();
        assert!(sf.cache.is_empty());
        sf.handle(&get("/assets/f.txt")).unwrap();
        assert_eq!(sf.cache.len(), 1);
        // Second request is served from the cache (still one entry).
        let res = sf.handle(&get("/assets/f.txt")).unwrap();
        assert_eq!(body_bytes(&res), b"0123456789");
        assert_eq!(sf.cache.len(), 1);
    }

    #[test]
    fn large_files_stream_and_bypass_the_cache() {
        let (_dir, sf) = fixture();
        let sf = sf.stream_threshold(4);
        let res = sf.handle(&get("/assets/f.txt")).unwrap();
        assert_eq!(res.status(), StatusCode::Ok);
        match res.body() {
            Body::Stream { size, offset, .. } => {
                assert_eq!(*size, 10);
                assert_eq!(*offset, 0);
            }
            Body::InMemory(_) => panic!("expected streamed body"),
        }
        assert!(sf.cache.is_empty());
    }

    #[test]
    fn ranged_stream_covers_the_requested_region() {
        let (_dir, sf) = fixture();
        let sf = sf.stream_threshold(4);
        let res = sf
            .handle(&get_with_range("/assets/f.txt", "bytes=2-5"))
            .unwrap();
        assert_eq!(res.status(), StatusCode::PartialContent);
        match res.body() {
            Body::Stream { size, offset, .. } => {
                assert_eq!(*size, 4);
                assert_eq!(*offset, 2);
            }
            Body::InMemory(_) => panic!("expected streamed body"),
        }
        assert_eq!(res.headers().get("content-range"), Some("bytes 2-5/10"));
    }
}
