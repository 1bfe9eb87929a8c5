//! Offsets validation cache
//!
//! Remembers which (row file, sidecar) pairs already passed a full
//! validation, keyed by both paths and stamped with each file's size and
//! modification time. A stamp mismatch invalidates the entry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;

use codeidx_common::error::Result;

/// Default number of remembered pairs
pub const DEFAULT_VALIDATION_CACHE_CAPACITY: usize = 256;

/// Size and modification time of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    pub async fn of(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// Identity of a validated pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairStamp {
    pub jsonl: FileStamp,
    pub offsets: FileStamp,
}

impl PairStamp {
    pub async fn of(jsonl: &Path, offsets: &Path) -> Result<Self> {
        let (jsonl, offsets) = tokio::try_join!(FileStamp::of(jsonl), FileStamp::of(offsets))?;
        Ok(Self { jsonl, offsets })
    }
}

struct CacheEntry {
    stamp: PairStamp,
    inserted: u64,
}

/// Bounded validation cache, oldest insertion evicted first
pub struct ValidationCache {
    entries: DashMap<(PathBuf, PathBuf), CacheEntry>,
    capacity: usize,
    sequence: AtomicU64,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ValidationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            sequence: AtomicU64::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// True when the pair was validated with exactly this stamp.
    ///
    /// A stale entry is dropped on lookup.
    pub fn is_valid(&self, jsonl: &Path, offsets: &Path, stamp: &PairStamp) -> bool {
        let key = (jsonl.to_path_buf(), offsets.to_path_buf());
        let fresh = match self.entries.get(&key) {
            Some(entry) => Some(entry.stamp == *stamp),
            None => None,
        };
        match fresh {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(false) => {
                self.entries.remove(&key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Record a successful validation
    pub fn insert(&self, jsonl: &Path, offsets: &Path, stamp: PairStamp) {
        let key = (jsonl.to_path_buf(), offsets.to_path_buf());
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.capacity {
                if !self.evict_one() {
                    break;
                }
            }
        }
        let inserted = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(key, CacheEntry { stamp, inserted });
    }

    /// Forget a pair, e.g. after its meta stopped agreeing with it
    pub fn invalidate(&self, jsonl: &Path, offsets: &Path) {
        self.entries
            .remove(&(jsonl.to_path_buf(), offsets.to_path_buf()));
    }

    /// Evict the oldest entry
    fn evict_one(&self) -> bool {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted)
            .map(|entry| entry.key().clone());

        match oldest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_CACHE_CAPACITY)
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: usize,
    pub misses: usize,
    pub hit_rate: f64,
}
