//! Ordered key-value abstraction backing queues, host metadata and Bloom
//! filters. Namespaces map to sled trees; tests substitute [`MemoryKv`].

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

pub mod cache;
pub mod queue;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("no such key")]
    KeyNotFound,
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Ordered byte-keyed store. Keys within a scan are returned in ascending
/// lexicographic order. Single-key writes are atomic.
pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError>;

    /// Lowest-keyed pair in the prefix range.
    fn first_in_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        Ok(self.scan_prefix(prefix)?.into_iter().next())
    }

    /// Highest key in the prefix range.
    fn last_key_in_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.scan_prefix(prefix)?.into_iter().last().map(|(k, _)| k))
    }

    /// Number of keys in the prefix range.
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, KvError> {
        Ok(self.scan_prefix(prefix)?.len())
    }
}

/// sled-backed namespace. One tree per namespace.
pub struct SledKv {
    tree: sled::Tree,
}

impl SledKv {
    pub fn new(tree: sled::Tree) -> Self {
        Self { tree }
    }

    pub fn open(db: &sled::Db, namespace: &str) -> Result<Self, KvError> {
        Ok(Self {
            tree: db.open_tree(namespace)?,
        })
    }

    pub fn flush(&self) -> Result<(), KvError> {
        self.tree.flush()?;
        Ok(())
    }
}

impl Kv for SledKv {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        match self.tree.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(KvError::KeyNotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let mut pairs = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            pairs.push((key.to_vec(), value.to_vec()));
        }
        Ok(pairs)
    }

    fn first_in_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvError> {
        match self.tree.scan_prefix(prefix).next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    fn last_key_in_prefix(&self, prefix: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        match self.tree.scan_prefix(prefix).next_back() {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(Some(key.to_vec()))
            }
            None => Ok(None),
        }
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize, KvError> {
        let mut count = 0;
        for entry in self.tree.scan_prefix(prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

/// In-memory store for tests and single-run tooling.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Kv> {
        Arc::new(Self::new())
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        self.map
            .lock()
            .get(key)
            .cloned()
            .ok_or(KvError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.map.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvError> {
        let map = self.map.lock();
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sled_kv() -> (TempDir, SledKv) {
        let dir = TempDir::new().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let kv = SledKv::open(&db, "test").unwrap();
        (dir, kv)
    }

    #[test]
    fn test_get_missing_is_key_not_found() {
        let (_dir, kv) = sled_kv();
        assert!(matches!(kv.get(b"nope"), Err(KvError::KeyNotFound)));
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, kv) = sled_kv();
        kv.put(b"a", b"1").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), b"1");
        kv.delete(b"a").unwrap();
        assert!(matches!(kv.get(b"a"), Err(KvError::KeyNotFound)));
    }

    #[test]
    fn test_scan_prefix_is_ordered() {
        let (_dir, kv) = sled_kv();
        kv.put(b"q/2", b"b").unwrap();
        kv.put(b"q/1", b"a").unwrap();
        kv.put(b"q/3", b"c").unwrap();
        kv.put(b"r/1", b"x").unwrap();

        let pairs = kv.scan_prefix(b"q/").unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"q/1"[..], &b"q/2"[..], &b"q/3"[..]]);
    }

    #[test]
    fn test_first_and_last_in_prefix() {
        let (_dir, kv) = sled_kv();
        kv.put(b"p/b", b"2").unwrap();
        kv.put(b"p/a", b"1").unwrap();

        let (first, _) = kv.first_in_prefix(b"p/").unwrap().unwrap();
        assert_eq!(first, b"p/a");
        let last = kv.last_key_in_prefix(b"p/").unwrap().unwrap();
        assert_eq!(last, b"p/b");
        assert_eq!(kv.count_prefix(b"p/").unwrap(), 2);
    }

    #[test]
    fn test_memory_kv_matches_sled_semantics() {
        let kv = MemoryKv::new();
        kv.put(b"q/2", b"b").unwrap();
        kv.put(b"q/1", b"a").unwrap();
        assert_eq!(kv.get(b"q/1").unwrap(), b"a");
        assert!(matches!(kv.get(b"q/9"), Err(KvError::KeyNotFound)));

        let pairs = kv.scan_prefix(b"q/").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, b"q/1");
    }
}
