//! Per-host scalable Bloom filters used to deduplicate URLs.
//!
//! Filters live in a sliding cache in front of a persistent KV namespace;
//! evicted filters are serialized and written back. Filters are created on
//! first sight with a fixed target false-positive rate so that serialized
//! filters remain meaningful when they cross the wire during a handoff.

use std::sync::Arc;

use growable_bloom_filter::GrowableBloom;
use parking_lot::Mutex;

use crate::storage::cache::SlidingCache;
use crate::storage::{Kv, KvError};

/// Target false-positive rate shared by every node in the cluster.
pub const TARGET_FPR: f64 = 0.01;
/// Estimated URL count per host before the filter grows a new slice.
const EST_INSERTIONS: usize = 4096;
/// Resident filters before writeback kicks in.
const CACHE_WINDOW: usize = 1024;

pub struct BloomStore {
    cache: Mutex<SlidingCache<GrowableBloom>>,
    kv: Arc<dyn Kv>,
}

impl BloomStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self::with_window(kv, CACHE_WINDOW)
    }

    pub fn with_window(kv: Arc<dyn Kv>, window: usize) -> Self {
        let writeback = Arc::clone(&kv);
        let cache = SlidingCache::new(window).with_on_evict(move |host, filter: &GrowableBloom| {
            match serde_json::to_vec(filter) {
                Ok(bytes) => {
                    if let Err(e) = writeback.put(host.as_bytes(), &bytes) {
                        tracing::error!(host, error = %e, "bloom writeback failed");
                    }
                }
                Err(e) => tracing::error!(host, error = %e, "bloom encode failed"),
            }
        });
        Self {
            cache: Mutex::new(cache),
            kv,
        }
    }

    /// Tests `url` against the host's filter and inserts it when absent.
    /// Returns `true` when the URL was already present.
    pub fn seen_or_insert(&self, host: &str, url: &str) -> Result<bool, KvError> {
        let mut cache = self.cache.lock();
        self.load_into(&mut cache, host)?;
        let filter = cache
            .get_mut(host)
            .ok_or_else(|| KvError::Serialization("bloom cache miss after load".into()))?;
        Ok(!filter.insert(url))
    }

    /// Serialized filter for a host, creating a fresh one if none exists.
    pub fn encoded(&self, host: &str) -> Result<Vec<u8>, KvError> {
        let mut cache = self.cache.lock();
        self.load_into(&mut cache, host)?;
        let filter = cache
            .get(host)
            .ok_or_else(|| KvError::Serialization("bloom cache miss after load".into()))?;
        serde_json::to_vec(filter).map_err(|e| KvError::Serialization(e.to_string()))
    }

    /// Installs a filter received from another node, replacing any local one.
    pub fn install(&self, host: &str, encoded: &[u8]) -> Result<(), KvError> {
        let filter: GrowableBloom =
            serde_json::from_slice(encoded).map_err(|e| KvError::Serialization(e.to_string()))?;
        self.cache.lock().put(host, filter);
        Ok(())
    }

    /// Writes every resident filter back to the KV (shutdown path).
    pub fn flush(&self) {
        self.cache.lock().flush();
    }

    fn load_into(
        &self,
        cache: &mut SlidingCache<GrowableBloom>,
        host: &str,
    ) -> Result<(), KvError> {
        if cache.get(host).is_some() {
            return Ok(());
        }
        let filter = match self.kv.get(host.as_bytes()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| KvError::Serialization(e.to_string()))?,
            Err(KvError::KeyNotFound) => GrowableBloom::new(TARGET_FPR, EST_INSERTIONS),
            Err(e) => return Err(e),
        };
        cache.put(host, filter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    #[test]
    fn test_first_sight_is_unseen() {
        let store = BloomStore::new(MemoryKv::shared());
        assert!(!store.seen_or_insert("a.com", "http://a.com/1").unwrap());
        assert!(store.seen_or_insert("a.com", "http://a.com/1").unwrap());
    }

    #[test]
    fn test_hosts_have_independent_filters() {
        let store = BloomStore::new(MemoryKv::shared());
        assert!(!store.seen_or_insert("a.com", "http://a.com/x").unwrap());
        assert!(!store.seen_or_insert("b.com", "http://a.com/x").unwrap());
    }

    #[test]
    fn test_eviction_round_trips_through_kv() {
        let kv = MemoryKv::shared();
        let store = BloomStore::with_window(Arc::clone(&kv), 1);

        assert!(!store.seen_or_insert("a.com", "http://a.com/x").unwrap());
        // Touching a second host evicts a.com's filter to the KV.
        assert!(!store.seen_or_insert("b.com", "http://b.com/y").unwrap());
        // Reloading from the KV must preserve membership.
        assert!(store.seen_or_insert("a.com", "http://a.com/x").unwrap());
    }

    #[test]
    fn test_install_preserves_membership() {
        let source = BloomStore::new(MemoryKv::shared());
        assert!(!source.seen_or_insert("h.com", "http://h.com/seen").unwrap());
        let encoded = source.encoded("h.com").unwrap();

        let target = BloomStore::new(MemoryKv::shared());
        target.install("h.com", &encoded).unwrap();
        assert!(target.seen_or_insert("h.com", "http://h.com/seen").unwrap());
        assert!(!target.seen_or_insert("h.com", "http://h.com/new").unwrap());
    }

    #[test]
    fn test_install_rejects_garbage() {
        let store = BloomStore::new(MemoryKv::shared());
        assert!(store.install("h.com", b"not a filter").is_err());
    }
}
