//! HTTP header map with case-insensitive name lookup.
//!
//! HTTP headers are order-preserving and case-insensitive per [RFC 9110 §5].
//! The map preserves the casing a name was first inserted with for outbound
//! serialization, while lookups ignore ASCII case.

use std::fmt;

/// A case-insensitive, multi-value HTTP header map.
///
/// Preserves insertion order and the first-set casing of each name. Duplicate
/// names are allowed; [`get`](Self::get) returns the **last** value set for a
/// name, so a header appended later shadows an earlier one. On the wire,
/// [`fmt::Display`] groups duplicates under the first occurrence and
/// comma-joins their values (RFC 9110 §5.3).
///
/// # Examples
///
/// ```
/// use hearth::http::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.append("Content-Type", "text/html; charset=utf-8");
/// headers.append("X-Custom", "first");
/// headers.append("X-Custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// assert_eq!(headers.get("x-custom"), Some("second"));
/// assert_eq!(headers.to_string(), "Content-Type: text/html; charset=utf-8\r\nX-Custom: first, second\r\n");
/// ```
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    inner: Vec<(String, String)>,
}

impl HeaderMap {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Sets a header, replacing every existing entry with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.inner.push((name, value.into()));
    }

    /// Returns the value for the given header name (case-insensitive).
    ///
    /// When the name appears more than once, the value set last wins.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns an iterator over all values for the given header name (case-insensitive).
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.inner
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns an iterator over unique names (first-set casing, first-seen
    /// order) paired with their comma-joined values — the shape each header
    /// takes on the wire.
    pub fn iter_merged(&self) -> impl Iterator<Item = (&str, String)> {
        let mut seen: Vec<&str> = Vec::with_capacity(self.inner.len());
        self.inner.iter().filter_map(move |(name, _)| {
            if seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
                return None;
            }
            seen.push(name.as_str());
            let joined = self
                .get_all(name)
                .collect::<Vec<_>>()
                .join(", ");
            Some((name.as_str(), joined))
        })
    }
}

impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter_merged() {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}
