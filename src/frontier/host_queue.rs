//! Per-host FIFO with the scheduling flags the frontier drives.

use rkyv::{Archive, Deserialize, Serialize};

use crate::storage::queue::PersistentQueue;
use crate::storage::KvError;

/// One queued URL. Weight is subtracted from the host's session budget on
/// dequeue and defaults to 1.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive_attr(derive(bytecheck::CheckBytes))]
pub struct UrlEntry {
    pub url: String,
    pub weight: u32,
}

impl UrlEntry {
    pub fn new(url: String) -> Self {
        Self { url, weight: 1 }
    }

    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        rkyv::to_bytes::<_, 512>(self)
            .map(|b| b.to_vec())
            .map_err(|e| KvError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        // Queue values are written by this process; skip validation like the
        // rest of the local persistence path.
        unsafe { rkyv::from_bytes_unchecked(bytes) }
            .map_err(|e: rkyv::de::deserializers::SharedDeserializeMapError| {
                KvError::Serialization(e.to_string())
            })
    }
}

/// Persistent FIFO plus the flags that decide whether it may yield URLs:
/// a queue is dequeued from iff `active && !locked && !empty`.
pub struct HostQueue {
    queue: PersistentQueue,
    active: bool,
    locked: bool,
    session_budget: u64,
    /// Membership marker for the frontier's inactive index.
    pub(super) in_inactive_index: bool,
}

impl HostQueue {
    pub fn new(queue: PersistentQueue, active: bool, session_budget: u64) -> Self {
        Self {
            queue,
            active,
            locked: false,
            session_budget,
            in_inactive_index: false,
        }
    }

    pub fn enqueue(&mut self, entry: &UrlEntry) -> Result<(), KvError> {
        self.queue.push(&entry.encode()?)
    }

    /// Pops the next URL, charging its weight against the session budget.
    /// Returns `None` when the queue is ineligible or empty; an empty pop or
    /// an exhausted budget deactivates the queue.
    pub fn dequeue(&mut self) -> Result<Option<UrlEntry>, KvError> {
        if !self.active || self.locked {
            return Ok(None);
        }

        let entry = match self.queue.pop()? {
            Some(bytes) => UrlEntry::decode(&bytes)?,
            None => {
                self.active = false;
                return Ok(None);
            }
        };

        self.session_budget = self.session_budget.saturating_sub(entry.weight as u64);
        if self.session_budget == 0 {
            self.active = false;
        }
        Ok(Some(entry))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Reactivates the queue with a fresh session budget.
    pub fn reset(&mut self, session_budget: u64) {
        self.active = true;
        self.session_budget = session_budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::PersistentQueue;
    use crate::storage::MemoryKv;

    fn queue_for(host: &str, budget: u64) -> HostQueue {
        let kv = MemoryKv::shared();
        let queue = PersistentQueue::open(kv, host).unwrap();
        HostQueue::new(queue, true, budget)
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = UrlEntry::new("https://example.com/a".to_string());
        let bytes = entry.encode().unwrap();
        assert_eq!(UrlEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_dequeue_charges_budget_and_deactivates() {
        let mut q = queue_for("a.com", 2);
        for i in 0..3 {
            q.enqueue(&UrlEntry::new(format!("https://a.com/{}", i)))
                .unwrap();
        }

        assert!(q.dequeue().unwrap().is_some());
        assert!(q.is_active());
        assert!(q.dequeue().unwrap().is_some());
        assert!(!q.is_active(), "budget exhausted");
        assert!(q.dequeue().unwrap().is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_empty_dequeue_deactivates() {
        let mut q = queue_for("a.com", 10);
        assert!(q.dequeue().unwrap().is_none());
        assert!(!q.is_active());
    }

    #[test]
    fn test_locked_queue_yields_nothing() {
        let mut q = queue_for("a.com", 10);
        q.enqueue(&UrlEntry::new("https://a.com/x".to_string()))
            .unwrap();
        q.set_locked(true);
        assert!(q.dequeue().unwrap().is_none());
        assert!(q.is_active(), "lock does not consume the budget");

        q.set_locked(false);
        assert!(q.dequeue().unwrap().is_some());
    }

    #[test]
    fn test_reset_restores_eligibility() {
        let mut q = queue_for("a.com", 1);
        q.enqueue(&UrlEntry::new("https://a.com/1".to_string()))
            .unwrap();
        q.enqueue(&UrlEntry::new("https://a.com/2".to_string()))
            .unwrap();

        assert!(q.dequeue().unwrap().is_some());
        assert!(!q.is_active());

        q.reset(1);
        assert!(q.dequeue().unwrap().is_some());
    }
}
