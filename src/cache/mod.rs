//! Bounded LRU cache of small static files.
//!
//! Keyed by canonical path string; an entry is only served while its stored
//! mtime matches the file on disk, so an edited file is re-read on the next
//! request instead of being served stale.

use std::num::NonZeroUsize;
use std::time::SystemTime;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, error};

/// Default maximum number of cached files.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// A cached file: its content and the mtime it was read at.
#[derive(Debug, Clone)]
struct FileCacheEntry {
    content: Bytes,
    modified: SystemTime,
}

/// A bounded, mutex-guarded LRU of file contents.
///
/// All operations take the single internal lock; promote and evict are O(1).
///
/// # Examples
///
/// ```
/// use std::time::SystemTime;
/// use hearth::cache::FileCache;
///
/// let cache = FileCache::new(10);
/// let mtime = SystemTime::now();
/// cache.put("static/index.html", "<html></html>".into(), mtime);
/// assert!(cache.get("static/index.html", mtime).is_some());
/// ```
pub struct FileCache {
    inner: Mutex<LruCache<String, FileCacheEntry>>,
}

impl FileCache {
    /// Creates a cache holding at most `max_entries` files (at least one).
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Looks up `path`, returning its content only when the cached mtime
    /// equals `modified`. A hit promotes the entry to most-recently-used; a
    /// stale entry reports a miss and stays where it is until replaced.
    pub fn get(&self, path: &str, modified: SystemTime) -> Option<Bytes> {
        let mut cache = self.inner.lock();
        match cache.peek(path) {
            Some(entry) if entry.modified == modified => {
                let content = cache.get(path).map(|e| e.content.clone());
                debug!(path, size = content.as_ref().map_or(0, Bytes::len), "cache hit");
                content
            }
            Some(_) => {
                debug!(path, "cache miss (stale)");
                None
            }
            None => {
                debug!(path, "cache miss");
                None
            }
        }
    }

    /// Inserts `path`, replacing any existing entry and evicting from the
    /// tail while over capacity. Empty content is rejected.
    pub fn put(&self, path: &str, content: Bytes, modified: SystemTime) {
        if content.is_empty() {
            error!(path, "refusing to cache empty content");
            return;
        }
        let size = content.len();
        let mut cache = self.inner.lock();
        let displaced = cache.push(path.to_owned(), FileCacheEntry { content, modified });
        if let Some((evicted_path, _)) = displaced.filter(|(k, _)| k != path) {
            debug!(path = %evicted_path, "evicted least-recently-used entry");
        }
        debug!(path, size, "cache updated");
    }

    /// Number of cached entries. Never exceeds the configured maximum.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
