//! Bounded in-memory cache of decrypted data blobs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::id::BlobId;

/// Default cache budget: 64 MiB.
pub const DEFAULT_CACHE_BYTES: usize = 64 << 20;

struct CacheEntry {
    data: Arc<Vec<u8>>,
    last_used: u64,
}

struct CacheInner {
    entries: HashMap<BlobId, CacheEntry>,
    used_bytes: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Byte-budget LRU cache over decoded data blobs.
///
/// The budget is advisory: a single blob larger than the budget is still
/// cached until the next insert displaces it. Eviction is least-recently-used
/// at entry granularity.
pub struct BlobCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl BlobCache {
    /// Create a cache with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                used_bytes: 0,
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a blob, refreshing its LRU position.
    pub fn get(&self, id: BlobId) -> Option<Arc<Vec<u8>>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        match inner.entries.get_mut(&id) {
            Some(entry) => {
                entry.last_used = inner.tick;
                inner.hits += 1;
                Some(entry.data.clone())
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a blob, evicting least-recently-used entries until the cache
    /// fits the budget again. Returns the shared handle to the bytes.
    pub fn insert(&self, id: BlobId, data: Vec<u8>) -> Arc<Vec<u8>> {
        let data = Arc::new(data);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(old) = inner.entries.insert(
            id,
            CacheEntry {
                data: data.clone(),
                last_used: tick,
            },
        ) {
            inner.used_bytes -= old.data.len();
        }
        inner.used_bytes += data.len();

        while inner.used_bytes > self.max_bytes && inner.entries.len() > 1 {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| *k);
            let Some(key) = oldest else { break };
            if let Some(evicted) = inner.entries.remove(&key) {
                inner.used_bytes -= evicted.data.len();
                trace!(id = %key.short(), bytes = evicted.data.len(), "evicted blob");
            }
        }
        data
    }

    /// Bytes currently held.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used_bytes
    }

    /// Number of cached blobs.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since construction.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.hits, inner.misses)
    }
}
