//! Persistent FIFO queues over a key range of the ordered KV.
//!
//! Each host queue occupies the range `data/<hostKey>/<seq>` where `seq` is a
//! big-endian u64. Pushing appends under the next counter value; popping reads
//! and deletes the lowest key. The counter is re-derived from the largest
//! existing key when a queue is opened, so queues survive restarts.

use std::sync::Arc;

use super::{Kv, KvError};

const DATA_PREFIX: &str = "data/";
const METADATA_PREFIX: &str = "metadata/";

/// FIFO of opaque byte entries persisted in a shared KV namespace.
pub struct PersistentQueue {
    kv: Arc<dyn Kv>,
    prefix: Vec<u8>,
    next_seq: u64,
    len: usize,
}

impl PersistentQueue {
    /// Opens the queue for `name`, recovering counter and length from disk.
    pub fn open(kv: Arc<dyn Kv>, name: &str) -> Result<Self, KvError> {
        let prefix = format!("{}{}/", DATA_PREFIX, name).into_bytes();
        let next_seq = match kv.last_key_in_prefix(&prefix)? {
            Some(key) => parse_seq(&key, prefix.len()).map(|s| s + 1).unwrap_or(0),
            None => 0,
        };
        let len = kv.count_prefix(&prefix)?;
        Ok(Self {
            kv,
            prefix,
            next_seq,
            len,
        })
    }

    pub fn push(&mut self, value: &[u8]) -> Result<(), KvError> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&self.next_seq.to_be_bytes());
        self.kv.put(&key, value)?;
        self.next_seq += 1;
        self.len += 1;
        Ok(())
    }

    /// Removes and returns the oldest entry, or `None` when empty.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>, KvError> {
        match self.kv.first_in_prefix(&self.prefix)? {
            Some((key, value)) => {
                self.kv.delete(&key)?;
                self.len = self.len.saturating_sub(1);
                Ok(Some(value))
            }
            None => {
                self.len = 0;
                Ok(None)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn parse_seq(key: &[u8], prefix_len: usize) -> Option<u64> {
    let tail = key.get(prefix_len..)?;
    let bytes: [u8; 8] = tail.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Queue registry plus per-host metadata. Presence of a `metadata/<hostKey>`
/// key marks queue existence; its value is the last observed RTT in
/// milliseconds as a decimal string (empty until the first successful fetch).
pub struct QueueStore {
    kv: Arc<dyn Kv>,
}

impl QueueStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Opens (creating metadata if needed) the queue for a host.
    pub fn queue(&self, host: &str) -> Result<PersistentQueue, KvError> {
        let meta_key = metadata_key(host);
        match self.kv.get(&meta_key) {
            Ok(_) => {}
            Err(KvError::KeyNotFound) => self.kv.put(&meta_key, b"")?,
            Err(e) => return Err(e),
        }
        PersistentQueue::open(Arc::clone(&self.kv), host)
    }

    /// Hosts with a registered queue, in key order.
    pub fn all_hosts(&self) -> Result<Vec<String>, KvError> {
        let pairs = self.kv.scan_prefix(METADATA_PREFIX.as_bytes())?;
        Ok(pairs
            .into_iter()
            .filter_map(|(key, _)| {
                let tail = key.get(METADATA_PREFIX.len()..)?;
                String::from_utf8(tail.to_vec()).ok()
            })
            .collect())
    }

    /// Last observed RTT for a host, if one has been recorded.
    pub fn last_rtt_ms(&self, host: &str) -> Result<Option<u64>, KvError> {
        match self.kv.get(&metadata_key(host)) {
            Ok(value) => Ok(std::str::from_utf8(&value)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())),
            Err(KvError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_last_rtt_ms(&self, host: &str, rtt_ms: u64) -> Result<(), KvError> {
        self.kv
            .put(&metadata_key(host), rtt_ms.to_string().as_bytes())
    }
}

fn metadata_key(host: &str) -> Vec<u8> {
    format!("{}{}", METADATA_PREFIX, host).into_bytes()
}
