//! Per-client metadata cache with wall-clock expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dfs_lib::FileMetadata;

struct CachedMetadata {
    metadata: FileMetadata,
    cached_at: Instant,
}

pub(crate) struct MetadataCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedMetadata>>,
}

impl MetadataCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached record while it is younger than the TTL; expired
    /// entries are evicted on the way out.
    pub(crate) fn get(&self, path: &str) -> Option<FileMetadata> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(path) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(entry.metadata.clone()),
            Some(_) => {
                entries.remove(path);
                None
            }
            None => None,
        }
    }

    pub(crate) fn put(&self, path: &str, metadata: FileMetadata) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            path.to_string(),
            CachedMetadata {
                metadata,
                cached_at: Instant::now(),
            },
        );
    }

    pub(crate) fn invalidate(&self, path: &str) {
        self.entries.lock().unwrap().remove(path);
    }
}
