//! Bounded sliding-window cache with an on-evict writeback hook.
//!
//! Eviction follows insertion order. Callers serialize access; the Bloom
//! store wraps one of these behind its own mutex.

use std::collections::{HashMap, VecDeque};

type EvictFn<V> = Box<dyn FnMut(&str, &V) + Send>;

pub struct SlidingCache<V> {
    map: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
    on_evict: EvictFn<V>,
}

impl<V> SlidingCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            on_evict: Box::new(|_, _| {}),
        }
    }

    /// Installs the writeback hook invoked with each evicted entry.
    pub fn with_on_evict(mut self, on_evict: impl FnMut(&str, &V) + Send + 'static) -> Self {
        self.on_evict = Box::new(on_evict);
        self
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn put(&mut self, key: &str, value: V) {
        if !self.map.contains_key(key) {
            while self.map.len() >= self.capacity {
                self.evict_oldest();
            }
            self.order.push_back(key.to_string());
        }
        self.map.insert(key.to_string(), value);
    }

    pub fn delete(&mut self, key: &str) -> Option<V> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Runs the writeback hook over every resident entry without evicting.
    pub fn flush(&mut self) {
        for (key, value) in self.map.iter() {
            (self.on_evict)(key, value);
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(old) = self.order.pop_front() {
            // Deleted keys leave stale order entries behind; skip them.
            if let Some(value) = self.map.remove(&old) {
                (self.on_evict)(&old, &value);
                return;
            }
        }
    }
}
