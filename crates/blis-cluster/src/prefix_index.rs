//! Router-side prefix-cache index.
//!
//! An LRU map from block hash to the instance that last served that
//! prefix. The router maintains it purely from its own routing
//! decisions; it never inspects instance KV state. That makes it an
//! estimate of locality, not ground truth, which is exactly what an
//! online router has to work with.

use std::collections::{BTreeMap, BTreeSet};

use blis_core::InstanceId;
use blis_kv::BlockHash;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    instance: InstanceId,
    seq: u64,
}

/// Size-bounded LRU of block-hash -> instance mappings.
#[derive(Debug)]
pub struct PrefixCacheIndex {
    map: BTreeMap<BlockHash, IndexEntry>,
    /// (seq, hash), oldest first.
    lru: BTreeSet<(u64, BlockHash)>,
    capacity: usize,
    next_seq: u64,
}

impl PrefixCacheIndex {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "prefix index capacity must be positive");
        Self {
            map: BTreeMap::new(),
            lru: BTreeSet::new(),
            capacity,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Pure lookup; reads do not refresh recency.
    pub fn get(&self, hash: BlockHash) -> Option<InstanceId> {
        self.map.get(&hash).map(|e| e.instance)
    }

    /// Record that `hash` was just routed to `instance`, refreshing
    /// recency and evicting the oldest entry past capacity.
    pub fn record(&mut self, hash: BlockHash, instance: InstanceId) {
        if let Some(old) = self.map.remove(&hash) {
            self.lru.remove(&(old.seq, hash));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert(hash, IndexEntry { instance, seq });
        self.lru.insert((seq, hash));
        if self.map.len() > self.capacity {
            let &(oldest_seq, oldest_hash) = self.lru.iter().next().expect("lru non-empty");
            self.lru.remove(&(oldest_seq, oldest_hash));
            self.map.remove(&oldest_hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_back() {
        let mut idx = PrefixCacheIndex::new(4);
        idx.record(10, 1);
        idx.record(20, 2);
        assert_eq!(idx.get(10), Some(1));
        assert_eq!(idx.get(20), Some(2));
        assert_eq!(idx.get(30), None);
    }

    #[test]
    fn rerouting_overwrites_owner() {
        let mut idx = PrefixCacheIndex::new(4);
        idx.record(10, 1);
        idx.record(10, 3);
        assert_eq!(idx.get(10), Some(3));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn evicts_least_recently_recorded() {
        let mut idx = PrefixCacheIndex::new(2);
        idx.record(1, 0);
        idx.record(2, 0);
        // Refresh hash 1, making hash 2 the oldest.
        idx.record(1, 0);
        idx.record(3, 0);
        assert_eq!(idx.get(1), Some(0));
        assert_eq!(idx.get(2), None);
        assert_eq!(idx.get(3), Some(0));
    }

    #[test]
    fn reads_do_not_refresh() {
        let mut idx = PrefixCacheIndex::new(2);
        idx.record(1, 0);
        idx.record(2, 0);
        // A read of 1 must not save it from eviction.
        assert_eq!(idx.get(1), Some(0));
        idx.record(3, 0);
        assert_eq!(idx.get(1), None);
    }
}
