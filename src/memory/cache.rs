//! Two-tier read cache for memory records
//!
//! - L1: bounded in-memory LRU keyed by `(domain, key)`, holding decrypted
//!   content (process memory only, never spilled)
//! - L2: bounded on-disk LRU keyed by `sha256(domain|key)`, holding the
//!   at-rest record representation, so SECRET/INTERNAL payloads stay
//!   encrypted on disk
//!
//! Read order is L1 -> L2 -> backing store. Hit/miss counters feed the
//! metrics snapshot.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

/// Hit/miss counters for one tier
#[derive(Debug, Default)]
pub struct TierStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierStats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit ratio in [0, 1]; 0 when the tier was never read
    pub fn ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

// ============================================================================
// L1
// ============================================================================

/// In-memory LRU of decrypted content
pub struct L1Cache {
    entries: Mutex<LruCache<(String, String), String>>,
    pub stats: TierStats,
}

impl L1Cache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            stats: TierStats::default(),
        }
    }

    pub fn get(&self, domain: &str, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(&(domain.to_string(), key.to_string())) {
            Some(content) => {
                self.stats.hit();
                Some(content.clone())
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn put(&self, domain: &str, key: &str, content: String) {
        self.entries
            .lock()
            .put((domain.to_string(), key.to_string()), content);
    }

    pub fn remove(&self, domain: &str, key: &str) {
        self.entries
            .lock()
            .pop(&(domain.to_string(), key.to_string()));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// L2
// ============================================================================

/// On-disk LRU of at-rest record payloads under `<dir>/cache/`
///
/// Eviction order lives in memory; entries found on disk from a previous run
/// are re-admitted on first touch.
pub struct L2Cache {
    dir: PathBuf,
    order: Mutex<LruCache<String, ()>>,
    pub stats: TierStats,
}

impl L2Cache {
    pub fn open(dir: &Path, capacity: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Ok(Self {
            dir: dir.to_path_buf(),
            order: Mutex::new(LruCache::new(capacity)),
            stats: TierStats::default(),
        })
    }

    fn path_for(&self, record_id: &str) -> PathBuf {
        self.dir.join(record_id)
    }

    pub fn get(&self, record_id: &str) -> Option<String> {
        match std::fs::read_to_string(self.path_for(record_id)) {
            Ok(raw) => {
                self.stats.hit();
                self.order.lock().put(record_id.to_string(), ());
                Some(raw)
            }
            Err(_) => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn put(&self, record_id: &str, at_rest: &str) {
        if std::fs::write(self.path_for(record_id), at_rest).is_err() {
            return;
        }
        let evicted = {
            let mut order = self.order.lock();
            let evicted = if order.len() == order.cap().get() && !order.contains(record_id) {
                order.pop_lru().map(|(id, ())| id)
            } else {
                None
            };
            order.put(record_id.to_string(), ());
            evicted
        };
        if let Some(id) = evicted {
            let _ = std::fs::remove_file(self.path_for(&id));
        }
    }

    pub fn remove(&self, record_id: &str) {
        self.order.lock().pop(record_id);
        let _ = std::fs::remove_file(self.path_for(record_id));
    }
}

// ============================================================================
// TESTS
// ============================================================================
