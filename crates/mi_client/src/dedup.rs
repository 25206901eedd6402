//! Inbound message de-duplication.
//!
//! Keyed by `sender|msg_id_hex`, FIFO-capped. A duplicate delivery (relay
//! retry, device-sync echo racing the direct copy) is surfaced exactly once.

use std::collections::{HashSet, VecDeque};

pub const DEDUP_CAPACITY: usize = 4096;

pub struct DedupSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::with_capacity(DEDUP_CAPACITY)
    }
}

impl DedupSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn key(sender: &str, msg_id: &[u8; 16]) -> String {
        format!("{sender}|{}", hex::encode(msg_id))
    }

    /// Returns true the FIRST time a key is seen.
    pub fn insert(&mut self, sender: &str, msg_id: &[u8; 16]) -> bool {
        let key = Self::key(sender, msg_id);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_suppressed() {
        let mut dedup = DedupSet::default();
        assert!(dedup.insert("alice", &[1u8; 16]));
        assert!(!dedup.insert("alice", &[1u8; 16]));
        // same id from a different sender is a different message
        assert!(dedup.insert("bob", &[1u8; 16]));
    }

    #[test]
    fn fifo_eviction_reopens_old_keys() {
        let mut dedup = DedupSet::with_capacity(2);
        assert!(dedup.insert("a", &[1u8; 16]));
        assert!(dedup.insert("a", &[2u8; 16]));
        assert!(dedup.insert("a", &[3u8; 16])); // evicts id 1
        assert_eq!(dedup.len(), 2);
        assert!(dedup.insert("a", &[1u8; 16]));
    }
}
