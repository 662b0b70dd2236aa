//! Single-tier block allocator.
//!
//! Blocks live in one of two observable states: referenced
//! (`refcount > 0`) or free (`refcount == 0`, present in the LRU free
//! set). Free blocks may still carry content: their hash mapping stays
//! in the index so a later request with the same prefix revives them as
//! cache hits instead of recomputing.
//!
//! Invariant kept throughout: a block's `hash` field is `Some(h)` if
//! and only if `index[h]` points back at that block. Eviction and
//! rollback both rely on it.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;

use blis_core::{Micros, RequestId, TokenId};

use crate::hash::{chain_hashes, BlockHash};
use crate::{AllocOutcome, AllocReceipt, BlockId, KvStats, KvStore};

#[derive(Debug, Clone)]
struct Block {
    refcount: u32,
    hash: Option<BlockHash>,
    last_access: Micros,
    /// The free-set key while the block is on the free list.
    lru_key: Option<(Micros, u64)>,
}

#[derive(Debug, Clone, Default)]
struct Held {
    blocks: Vec<BlockId>,
    covered_tokens: u32,
}

/// Typed mutation record for one allocation call. On failure the
/// journal is replayed inverse-first, restoring every observable.
#[derive(Debug)]
enum Mutation {
    NewBlock {
        id: BlockId,
        lru_key: (Micros, u64),
        prev_access: Micros,
        evicted_hash: Option<BlockHash>,
        assigned_hash: Option<BlockHash>,
        span: u32,
    },
    CachedBlock {
        id: BlockId,
        lru_key: Option<(Micros, u64)>,
        prev_access: Micros,
        span: u32,
    },
    PromotedTail {
        id: BlockId,
        hash: BlockHash,
    },
}

/// One tier of KV block memory.
#[derive(Debug)]
pub struct KvCache {
    block_size: u32,
    blocks: Vec<Block>,
    /// Content hash -> resident block.
    index: IndexMap<BlockHash, BlockId>,
    /// Free blocks ordered by (last_access, touch_seq): least recently
    /// used first, insertion order breaking ties.
    free: BTreeSet<(Micros, u64, BlockId)>,
    held: BTreeMap<RequestId, Held>,
    touch_seq: u64,
    stats: KvStats,
}

impl KvCache {
    pub fn new(total_blocks: u32, block_size: u32) -> Self {
        assert!(total_blocks > 0, "kv cache needs at least one block");
        assert!(block_size > 0, "kv block size must be positive");
        let mut free = BTreeSet::new();
        let mut blocks = Vec::with_capacity(total_blocks as usize);
        for id in 0..total_blocks {
            blocks.push(Block {
                refcount: 0,
                hash: None,
                last_access: 0,
                lru_key: Some((0, id as u64)),
            });
            free.insert((0, id as u64, id));
        }
        Self {
            block_size,
            blocks,
            index: IndexMap::new(),
            free,
            held: BTreeMap::new(),
            touch_seq: total_blocks as u64,
            stats: KvStats {
                total_blocks,
                free_blocks: total_blocks,
                ..KvStats::default()
            },
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn used_blocks(&self) -> u32 {
        self.blocks.len() as u32 - self.free.len() as u32
    }

    pub fn free_blocks(&self) -> u32 {
        self.free.len() as u32
    }

    /// Blocks whose content is resident, referenced or not.
    pub fn content_blocks(&self) -> u32 {
        self.used_blocks() + self.index.len() as u32 - self.referenced_hashed_blocks()
    }

    fn referenced_hashed_blocks(&self) -> u32 {
        // index covers both referenced and cached-free blocks; subtract
        // the referenced ones to count cached-free content separately.
        self.index
            .values()
            .filter(|&&id| self.blocks[id as usize].refcount > 0)
            .count() as u32
    }

    /// Block ids of the longest block-aligned cached prefix. Pure.
    pub fn cached_blocks(&self, tokens: &[TokenId]) -> Vec<BlockId> {
        let mut out = Vec::new();
        for h in chain_hashes(tokens, self.block_size) {
            match self.index.get(&h) {
                Some(&id) => out.push(id),
                None => break,
            }
        }
        out
    }

    /// Whether `hash` is resident in this tier. Pure.
    pub fn has_hash(&self, hash: BlockHash) -> bool {
        self.index.contains_key(&hash)
    }

    /// Pull a block out of the free set, or report exhaustion.
    fn pop_lru_free(&mut self) -> Option<(Micros, u64, BlockId)> {
        let entry = *self.free.iter().next()?;
        self.free.remove(&entry);
        let block = &mut self.blocks[entry.2 as usize];
        debug_assert_eq!(
            block.refcount, 0,
            "kv block {} on free list with refcount > 0",
            entry.2
        );
        block.lru_key = None;
        Some(entry)
    }

    fn push_free(&mut self, id: BlockId, at: Micros) {
        self.touch_seq += 1;
        let key = (at, self.touch_seq);
        let block = &mut self.blocks[id as usize];
        block.last_access = at;
        block.lru_key = Some(key);
        self.free.insert((key.0, key.1, id));
    }

    /// Seat `hash` in a free block without referencing it, for tier
    /// reloads. The block becomes cached-but-free. Returns false when
    /// no free block exists.
    pub(crate) fn install_cached_block(&mut self, hash: BlockHash, now: Micros) -> bool {
        if self.index.contains_key(&hash) {
            return true;
        }
        let Some((_, _, id)) = self.pop_lru_free() else {
            return false;
        };
        if let Some(old) = self.blocks[id as usize].hash.take() {
            self.index.shift_remove(&old);
        }
        self.blocks[id as usize].hash = Some(hash);
        self.index.insert(hash, id);
        self.push_free(id, now);
        true
    }

    /// Drop `hash`'s content from this tier if it is cached-free.
    /// Returns the block id it occupied. Used by the offload path.
    pub(crate) fn evict_hash(&mut self, hash: BlockHash) -> Option<BlockId> {
        let &id = self.index.get(&hash)?;
        let block = &self.blocks[id as usize];
        if block.refcount > 0 {
            return None;
        }
        self.index.shift_remove(&hash);
        self.blocks[id as usize].hash = None;
        Some(id)
    }

    /// Least-recently-used cached-free hash, if any. Pure.
    pub(crate) fn lru_cached_free_hash(&self) -> Option<BlockHash> {
        self.free
            .iter()
            .find_map(|&(_, _, id)| self.blocks[id as usize].hash)
    }

    fn rollback(&mut self, journal: Vec<Mutation>) {
        for m in journal.into_iter().rev() {
            match m {
                Mutation::NewBlock {
                    id,
                    lru_key,
                    prev_access,
                    evicted_hash,
                    assigned_hash,
                    span,
                } => {
                    if let Some(h) = assigned_hash {
                        self.index.shift_remove(&h);
                    }
                    let block = &mut self.blocks[id as usize];
                    block.hash = evicted_hash;
                    block.refcount = 0;
                    block.last_access = prev_access;
                    block.lru_key = Some(lru_key);
                    if let Some(h) = evicted_hash {
                        self.index.insert(h, id);
                    }
                    self.free.insert((lru_key.0, lru_key.1, id));
                    self.stats.miss_blocks -= 1;
                    self.stats.miss_tokens -= span as u64;
                }
                Mutation::CachedBlock {
                    id,
                    lru_key,
                    prev_access,
                    span,
                } => {
                    let block = &mut self.blocks[id as usize];
                    block.refcount -= 1;
                    block.last_access = prev_access;
                    if block.refcount == 0 {
                        if let Some(key) = lru_key {
                            block.lru_key = Some(key);
                            self.free.insert((key.0, key.1, id));
                        }
                    }
                    self.stats.hit_blocks -= 1;
                    self.stats.hit_tokens -= span as u64;
                }
                Mutation::PromotedTail { id, hash } => {
                    self.index.shift_remove(&hash);
                    self.blocks[id as usize].hash = None;
                }
            }
        }
    }
}

impl KvStore for KvCache {
    fn allocate(
        &mut self,
        req: RequestId,
        tokens: &[TokenId],
        cover_tokens: u32,
        now: Micros,
    ) -> AllocOutcome {
        let bs = self.block_size;
        let cover = cover_tokens.min(tokens.len() as u32);
        let prev = self.held.get(&req).cloned().unwrap_or_default();
        assert!(
            cover >= prev.covered_tokens,
            "kv allocate: coverage for request {req} shrank ({} -> {cover})",
            prev.covered_tokens
        );
        if cover == prev.covered_tokens {
            return AllocOutcome::Ok(AllocReceipt::default());
        }

        let needed = cover.div_ceil(bs) as usize;
        let hashes = chain_hashes(&tokens[..cover as usize], bs);
        let mut journal: Vec<Mutation> = Vec::new();
        let mut receipt = AllocReceipt::default();
        let mut gained: Vec<BlockId> = Vec::new();

        // The previous call may have left the last held block partial.
        // If coverage now crosses its boundary the block gains a stable
        // identity and enters the index (unless the hash is taken).
        let had_partial_tail = prev.covered_tokens % bs != 0;
        if had_partial_tail {
            let tail_idx = prev.blocks.len() - 1;
            let tail_end = (tail_idx as u32 + 1) * bs;
            if cover >= tail_end {
                let id = prev.blocks[tail_idx];
                let h = hashes[tail_idx];
                if !self.index.contains_key(&h) {
                    self.index.insert(h, id);
                    self.blocks[id as usize].hash = Some(h);
                    journal.push(Mutation::PromotedTail { id, hash: h });
                }
            }
        }

        for idx in prev.blocks.len()..needed {
            let start = idx as u32 * bs;
            let end = (start + bs).min(cover);
            let span = end - start;
            let full = end == start + bs;

            let cached = if full {
                self.index.get(&hashes[idx]).copied()
            } else {
                None
            };

            if let Some(id) = cached {
                let block = &mut self.blocks[id as usize];
                let lru_key = block.lru_key.take();
                if let Some((t, s)) = lru_key {
                    self.free.remove(&(t, s, id));
                }
                let prev_access = block.last_access;
                block.refcount += 1;
                block.last_access = now;
                journal.push(Mutation::CachedBlock {
                    id,
                    lru_key,
                    prev_access,
                    span,
                });
                receipt.cached_blocks += 1;
                receipt.hit_tokens += span;
                self.stats.hit_blocks += 1;
                self.stats.hit_tokens += span as u64;
                gained.push(id);
            } else {
                let Some((t, s, id)) = self.pop_lru_free() else {
                    self.rollback(journal);
                    return AllocOutcome::Exhausted;
                };
                let evicted_hash = self.blocks[id as usize].hash.take();
                if let Some(old) = evicted_hash {
                    self.index.shift_remove(&old);
                }
                let assigned_hash = full.then(|| hashes[idx]);
                {
                    let block = &mut self.blocks[id as usize];
                    block.hash = assigned_hash;
                    block.refcount = 1;
                    let prev_access = block.last_access;
                    block.last_access = now;
                    journal.push(Mutation::NewBlock {
                        id,
                        lru_key: (t, s),
                        prev_access,
                        evicted_hash,
                        assigned_hash,
                        span,
                    });
                }
                if let Some(h) = assigned_hash {
                    self.index.insert(h, id);
                }
                receipt.new_blocks += 1;
                receipt.miss_tokens += span;
                self.stats.miss_blocks += 1;
                self.stats.miss_tokens += span as u64;
                gained.push(id);
            }
        }

        // Extension inside the previously partial tail block: no new
        // block, but those tokens still need their KV computed.
        if had_partial_tail {
            let tail_end = (prev.blocks.len() as u32) * bs;
            let ext = tail_end.min(cover) - prev.covered_tokens;
            receipt.miss_tokens += ext;
            self.stats.miss_tokens += ext as u64;
        }

        let entry = self.held.entry(req).or_default();
        entry.blocks.extend(gained);
        entry.covered_tokens = cover;
        AllocOutcome::Ok(receipt)
    }

    fn cached_prefix_tokens(&self, tokens: &[TokenId]) -> u32 {
        self.cached_blocks(tokens).len() as u32 * self.block_size
    }

    fn release(&mut self, req: RequestId, now: Micros) {
        let Some(held) = self.held.remove(&req) else {
            return;
        };
        for id in held.blocks {
            let refcount = {
                let block = &mut self.blocks[id as usize];
                assert!(
                    block.refcount > 0,
                    "kv release: block {id} already unreferenced"
                );
                block.refcount -= 1;
                block.refcount
            };
            if refcount == 0 {
                self.push_free(id, now);
            }
        }
    }

    fn utilization(&self) -> f64 {
        self.used_blocks() as f64 / self.total_blocks() as f64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn pending_transfer_latency(&self) -> Micros {
        0
    }

    fn consume_pending_transfer_latency(&mut self) -> Micros {
        0
    }

    fn stats(&self) -> KvStats {
        KvStats {
            used_blocks: self.used_blocks(),
            free_blocks: self.free_blocks(),
            ..self.stats
        }
    }

    fn assert_conservation(&self) {
        let used = self
            .blocks
            .iter()
            .filter(|b| b.refcount > 0)
            .count() as u32;
        let free = self.free.len() as u32;
        assert_eq!(
            used + free,
            self.total_blocks(),
            "kv conservation violated: used {used} + free {free} != total {}",
            self.total_blocks()
        );
        for &(_, _, id) in &self.free {
            assert_eq!(
                self.blocks[id as usize].refcount,
                0,
                "kv block {id} on free list with refcount > 0"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: u32) -> Vec<u32> {
        (0..n).collect()
    }

    #[test]
    fn fresh_allocation_then_prefix_hit() {
        let mut kv = KvCache::new(16, 4);
        let toks = tokens(8);
        match kv.allocate(1, &toks, 8, 10) {
            AllocOutcome::Ok(r) => {
                assert_eq!(r.new_blocks, 2);
                assert_eq!(r.miss_tokens, 8);
            }
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        // Second request, same prefix: both blocks hit.
        match kv.allocate(2, &toks, 8, 20) {
            AllocOutcome::Ok(r) => {
                assert_eq!(r.cached_blocks, 2);
                assert_eq!(r.hit_tokens, 8);
                assert_eq!(r.miss_tokens, 0);
            }
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        assert_eq!(kv.used_blocks(), 2);
        assert_eq!(kv.stats().hit_rate(), 0.5);
        kv.assert_conservation();
    }

    #[test]
    fn release_keeps_content_for_later_hits() {
        let mut kv = KvCache::new(8, 4);
        let toks = tokens(8);
        kv.allocate(1, &toks, 8, 10);
        kv.release(1, 20);
        assert_eq!(kv.used_blocks(), 0);
        match kv.allocate(2, &toks, 8, 30) {
            AllocOutcome::Ok(r) => assert_eq!(r.cached_blocks, 2),
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        kv.assert_conservation();
    }

    #[test]
    fn cached_blocks_query_is_pure() {
        let mut kv = KvCache::new(8, 4);
        let toks = tokens(8);
        kv.allocate(1, &toks, 8, 10);
        let before = kv.stats();
        let a = kv.cached_blocks(&toks);
        let b = kv.cached_blocks(&toks);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        let after = kv.stats();
        assert_eq!(before.hit_blocks, after.hit_blocks);
        assert_eq!(before.miss_blocks, after.miss_blocks);
    }

    #[test]
    fn exhaustion_rolls_back_everything() {
        let mut kv = KvCache::new(3, 4);
        kv.allocate(1, &tokens(8), 8, 10); // 2 blocks held
        let free_before = kv.free_blocks();
        let stats_before = kv.stats();
        let index_before = kv.index.len();

        // Needs 2 blocks, only 1 free.
        let other: Vec<u32> = (100..108).collect();
        assert_eq!(kv.allocate(2, &other, 8, 20), AllocOutcome::Exhausted);

        assert_eq!(kv.free_blocks(), free_before);
        assert_eq!(kv.index.len(), index_before);
        let stats_after = kv.stats();
        assert_eq!(stats_before.hit_blocks, stats_after.hit_blocks);
        assert_eq!(stats_before.miss_blocks, stats_after.miss_blocks);
        assert_eq!(stats_before.miss_tokens, stats_after.miss_tokens);
        assert!(kv.held.get(&2).is_none());
        kv.assert_conservation();
    }

    #[test]
    fn rollback_restores_revived_free_blocks() {
        let mut kv = KvCache::new(2, 4);
        kv.allocate(1, &tokens(4), 4, 10);
        kv.release(1, 20);
        // Request needing the cached block plus two fresh ones: the hit
        // revives block 0, then exhaustion must put it back on the free
        // list exactly as it was.
        let toks = tokens(12);
        assert_eq!(kv.allocate(2, &toks, 12, 30), AllocOutcome::Exhausted);
        assert_eq!(kv.free_blocks(), 2);
        match kv.allocate(3, &tokens(4), 4, 40) {
            AllocOutcome::Ok(r) => assert_eq!(r.cached_blocks, 1),
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        kv.assert_conservation();
    }

    #[test]
    fn lru_evicts_least_recently_released_first() {
        let mut kv = KvCache::new(2, 4);
        kv.allocate(1, &tokens(4), 4, 10);
        let second: Vec<u32> = (50..54).collect();
        kv.allocate(2, &second, 4, 11);
        kv.release(1, 20); // block for tokens(4) freed first
        kv.release(2, 30);
        // A new allocation takes the least recently used slot, evicting
        // tokens(4)'s content and keeping second's.
        let third: Vec<u32> = (90..94).collect();
        kv.allocate(3, &third, 4, 40);
        assert!(kv.cached_blocks(&tokens(4)).is_empty());
        assert_eq!(kv.cached_blocks(&second).len(), 1);
    }

    #[test]
    fn partial_tail_promoted_on_extension() {
        let mut kv = KvCache::new(8, 4);
        let toks = tokens(8);
        match kv.allocate(1, &toks, 6, 10) {
            AllocOutcome::Ok(r) => {
                assert_eq!(r.new_blocks, 2);
                assert_eq!(r.miss_tokens, 6);
            }
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        // Tail not shareable yet.
        assert_eq!(kv.cached_blocks(&toks).len(), 1);
        match kv.allocate(1, &toks, 8, 20) {
            AllocOutcome::Ok(r) => {
                assert_eq!(r.new_blocks, 0);
                assert_eq!(r.miss_tokens, 2);
            }
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        // Promotion makes both blocks shareable.
        assert_eq!(kv.cached_blocks(&toks).len(), 2);
        match kv.allocate(2, &toks, 8, 30) {
            AllocOutcome::Ok(r) => assert_eq!(r.cached_blocks, 2),
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
    }

    #[test]
    fn shared_block_stays_allocated_until_last_release() {
        let mut kv = KvCache::new(8, 4);
        let toks = tokens(4);
        kv.allocate(1, &toks, 4, 10);
        kv.allocate(2, &toks, 4, 11);
        assert_eq!(kv.used_blocks(), 1);
        kv.release(1, 20);
        assert_eq!(kv.used_blocks(), 1);
        kv.release(2, 30);
        assert_eq!(kv.used_blocks(), 0);
        kv.assert_conservation();
    }
}
