//! LRU shadow of this node's possession records.
//!
//! The ledger is the source of truth for proof schedules. Proof tasks refresh
//! the shadow on every tick; read sessions consult it during the handshake to
//! avoid a ledger round trip for files the node is actively proving.

use crate::ledger::{FileId, PdpRecord};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Default shadow capacity.
const DEFAULT_SHADOW_CAPACITY: usize = 10_000;

/// Read-mostly cache of possession records keyed by file.
#[derive(Clone)]
pub struct PossessionShadow {
    inner: Arc<Mutex<LruCache<FileId, PdpRecord>>>,
    stats: Arc<Mutex<ShadowStats>>,
}

/// Shadow statistics for monitoring.
#[derive(Debug, Default, Clone)]
pub struct ShadowStats {
    /// Number of lookups answered from the shadow.
    pub hits: u64,
    /// Number of lookups that fell through to the ledger.
    pub misses: u64,
    /// Number of records written.
    pub refreshes: u64,
}

impl ShadowStats {
    /// Calculate hit rate as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl PossessionShadow {
    /// Create a shadow with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SHADOW_CAPACITY)
    }

    /// Create a shadow holding at most `capacity` records.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            stats: Arc::new(Mutex::new(ShadowStats::default())),
        }
    }

    /// Cached record for a file.
    pub fn get(&self, file_id: &FileId) -> Option<PdpRecord> {
        let found = self.inner.lock().get(file_id).cloned();

        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }

        found
    }

    /// Store the latest ledger view of a record.
    pub fn refresh(&self, record: PdpRecord) {
        self.inner.lock().put(record.file_id.clone(), record);
        self.stats.lock().refreshes += 1;
    }

    /// Forget a file.
    pub fn remove(&self, file_id: &FileId) {
        self.inner.lock().pop(file_id);
    }

    /// Get current statistics.
    #[must_use]
    pub fn stats(&self) -> ShadowStats {
        self.stats.lock().clone()
    }

    /// Number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the shadow is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for PossessionShadow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::Address;

    fn record(id: &str, next_height: u64) -> PdpRecord {
        PdpRecord {
            file_id: FileId::new(id),
            node: Address([1u8; 20]),
            proof_count: 1,
            next_height,
            last_submitted: None,
            settled: false,
        }
    }

    #[test]
    fn test_refresh_replaces_record() {
        let shadow = PossessionShadow::new();
        assert!(shadow.get(&FileId::new("a")).is_none());

        shadow.refresh(record("a", 10));
        shadow.refresh(record("a", 20));
        assert_eq!(shadow.len(), 1);
        assert_eq!(shadow.get(&FileId::new("a")).unwrap().next_height, 20);

        let stats = shadow.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.refreshes, 2);
        assert!((stats.hit_rate() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_lru_eviction_and_remove() {
        let shadow = PossessionShadow::with_capacity(2);
        shadow.refresh(record("a", 1));
        shadow.refresh(record("b", 1));
        shadow.refresh(record("c", 1));
        assert_eq!(shadow.len(), 2);
        assert!(shadow.get(&FileId::new("a")).is_none());

        shadow.remove(&FileId::new("b"));
        assert_eq!(shadow.len(), 1);
        assert!(!shadow.is_empty());
    }
}
