//! Bounded recency list of proxy node identities.
//!
//! Discovery streams reconnect often; the tracker lets the server log a
//! node's first connection once instead of on every reconnect. Capacity is
//! fixed so the list never grows with the number of proxies.

use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug)]
pub struct ConnectionTracker {
    capacity: usize,
    entries: Mutex<VecDeque<String>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ConnectionTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Record `id` as the most recent identity.
    ///
    /// Returns `true` when the id was not present. A known id is moved to
    /// the most recent position; an unknown id evicts the oldest entry once
    /// the tracker is full.
    pub fn is_new_identity(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().expect("connection tracker lock poisoned");

        // Most recent entries are at the back.
        if let Some(position) = entries.iter().rposition(|entry| entry == id) {
            if position + 1 != entries.len() {
                if let Some(entry) = entries.remove(position) {
                    entries.push_back(entry);
                }
            }
            return false;
        }

        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(id.to_string());
        true
    }

    /// Snapshot of the tracked ids, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("connection tracker lock poisoned").iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("connection tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
