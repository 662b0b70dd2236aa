//! Two-tier KV composition: fast tier (GPU) backed by a slow tier (CPU).
//!
//! All allocation happens in the fast tier. When the fast tier's
//! content fullness crosses the offload threshold, the least recently
//! used cached-but-unreferenced blocks move to the slow tier, leaving
//! blank fast slots behind. A later request for offloaded content
//! reloads it: the block is seated back in the fast tier and the
//! transfer cost accumulates as pending latency, paid by the next step
//! on the instance.

use indexmap::IndexMap;

use blis_core::{Micros, RequestId, TokenId};

use crate::hash::{chain_hashes, BlockHash};
use crate::single::KvCache;
use crate::{AllocOutcome, BlockId, KvStats, KvStore};

/// Slow-tier parameters, validated at construction.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TieredKvConfig {
    /// Capacity of the slow tier in blocks.
    pub slow_blocks: u32,
    /// Fast-tier content fullness above which offload kicks in, in [0, 1].
    pub offload_threshold: f64,
    /// Transfer bandwidth in blocks per microsecond.
    pub transfer_bandwidth_blocks_per_micro: f64,
    /// Fixed latency per reload batch.
    pub transfer_base_latency_micros: Micros,
}

#[derive(Debug, thiserror::Error)]
pub enum TieredKvConfigError {
    #[error("slow tier needs at least one block")]
    NoSlowBlocks,
    #[error("offload threshold {0} outside [0, 1]")]
    ThresholdOutOfRange(f64),
    #[error("transfer bandwidth must be positive and finite, got {0}")]
    BadBandwidth(f64),
}

#[derive(Debug, Clone)]
struct OffloadedBlock {
    /// Fast-tier slot the content vacated. Kept for the record only.
    block: BlockId,
    refcount: u32,
    offloaded_at: Micros,
}

/// Fast tier composed with a slow tier.
#[derive(Debug)]
pub struct TieredKvCache {
    fast: KvCache,
    cfg: TieredKvConfig,
    /// Offloaded content by hash, in offload order (oldest first).
    slow: IndexMap<BlockHash, OffloadedBlock>,
    pending_transfer: Micros,
    offloaded: u64,
    reloaded: u64,
    transfer_micros: u64,
}

impl TieredKvCache {
    pub fn new(
        total_blocks: u32,
        block_size: u32,
        cfg: TieredKvConfig,
    ) -> Result<Self, TieredKvConfigError> {
        if cfg.slow_blocks == 0 {
            return Err(TieredKvConfigError::NoSlowBlocks);
        }
        if !(0.0..=1.0).contains(&cfg.offload_threshold) || cfg.offload_threshold.is_nan() {
            return Err(TieredKvConfigError::ThresholdOutOfRange(
                cfg.offload_threshold,
            ));
        }
        if !(cfg.transfer_bandwidth_blocks_per_micro > 0.0)
            || !cfg.transfer_bandwidth_blocks_per_micro.is_finite()
        {
            return Err(TieredKvConfigError::BadBandwidth(
                cfg.transfer_bandwidth_blocks_per_micro,
            ));
        }
        Ok(Self {
            fast: KvCache::new(total_blocks, block_size),
            cfg,
            slow: IndexMap::new(),
            pending_transfer: 0,
            offloaded: 0,
            reloaded: 0,
            transfer_micros: 0,
        })
    }

    pub fn slow_used(&self) -> u32 {
        self.slow.len() as u32
    }

    fn fast_fullness(&self) -> f64 {
        self.fast.content_blocks() as f64 / self.fast.total_blocks() as f64
    }

    /// Move cold cached content down until fullness is at the threshold
    /// or no eviction candidate remains.
    fn maybe_offload(&mut self, now: Micros) {
        while self.fast_fullness() > self.cfg.offload_threshold {
            let Some(hash) = self.fast.lru_cached_free_hash() else {
                break;
            };
            let Some(block) = self.fast.evict_hash(hash) else {
                break;
            };
            if self.slow.len() as u32 >= self.cfg.slow_blocks {
                // Slow tier full: the oldest offloaded content is lost.
                if let Some((lost, record)) = self.slow.shift_remove_index(0) {
                    debug_assert_eq!(record.refcount, 0);
                    tracing::trace!(
                        hash = lost,
                        block = record.block,
                        age = now - record.offloaded_at,
                        "slow tier evicted oldest content"
                    );
                }
            }
            self.slow.insert(
                hash,
                OffloadedBlock {
                    block,
                    refcount: 0,
                    offloaded_at: now,
                },
            );
            self.offloaded += 1;
            tracing::trace!(hash, block, "kv offload to slow tier");
        }
    }

    /// Bring every slow-resident hash needed for this coverage back to
    /// the fast tier, accumulating transfer latency for the batch that
    /// triggered it.
    fn reload_for(&mut self, tokens: &[TokenId], cover: u32, now: Micros) {
        let hashes = chain_hashes(&tokens[..cover.min(tokens.len() as u32) as usize], self.fast.block_size());
        let mut moved = 0u64;
        for h in hashes {
            if self.fast.has_hash(h) || !self.slow.contains_key(&h) {
                continue;
            }
            if !self.fast.install_cached_block(h, now) {
                break; // no free fast slot; the allocate call will report
            }
            let entry = self.slow.shift_remove(&h);
            debug_assert!(entry.is_some());
            moved += 1;
        }
        if moved > 0 {
            let transfer = self.cfg.transfer_base_latency_micros
                + (moved as f64 / self.cfg.transfer_bandwidth_blocks_per_micro).ceil() as Micros;
            self.pending_transfer += transfer;
            self.transfer_micros += transfer;
            self.reloaded += moved;
            tracing::debug!(blocks = moved, transfer, "kv reload from slow tier");
        }
    }
}

impl KvStore for TieredKvCache {
    fn allocate(
        &mut self,
        req: RequestId,
        tokens: &[TokenId],
        cover_tokens: u32,
        now: Micros,
    ) -> AllocOutcome {
        self.reload_for(tokens, cover_tokens, now);
        let outcome = self.fast.allocate(req, tokens, cover_tokens, now);
        if matches!(outcome, AllocOutcome::Ok(_)) {
            self.maybe_offload(now);
        }
        outcome
    }

    fn cached_prefix_tokens(&self, tokens: &[TokenId]) -> u32 {
        let mut blocks = 0u32;
        for h in chain_hashes(tokens, self.fast.block_size()) {
            if self.fast.has_hash(h) || self.slow.contains_key(&h) {
                blocks += 1;
            } else {
                break;
            }
        }
        blocks * self.fast.block_size()
    }

    fn release(&mut self, req: RequestId, now: Micros) {
        self.fast.release(req, now);
        self.maybe_offload(now);
    }

    fn utilization(&self) -> f64 {
        self.fast.utilization()
    }

    fn block_size(&self) -> u32 {
        self.fast.block_size()
    }

    fn pending_transfer_latency(&self) -> Micros {
        self.pending_transfer
    }

    fn consume_pending_transfer_latency(&mut self) -> Micros {
        std::mem::take(&mut self.pending_transfer)
    }

    fn stats(&self) -> KvStats {
        KvStats {
            slow_total_blocks: self.cfg.slow_blocks,
            slow_used_blocks: self.slow_used(),
            offloaded_blocks: self.offloaded,
            reloaded_blocks: self.reloaded,
            transfer_micros: self.transfer_micros,
            ..self.fast.stats()
        }
    }

    fn assert_conservation(&self) {
        self.fast.assert_conservation();
        let slow_used = self.slow.len() as u32;
        assert!(
            slow_used <= self.cfg.slow_blocks,
            "slow tier over capacity: {slow_used} > {}",
            self.cfg.slow_blocks
        );
        // Cross-tier accounting: every slot is used or free in its tier.
        let fast_total = self.fast.total_blocks();
        let total = self.fast.used_blocks()
            + self.fast.free_blocks()
            + slow_used
            + (self.cfg.slow_blocks - slow_used);
        assert_eq!(total, fast_total + self.cfg.slow_blocks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TieredKvConfig {
        TieredKvConfig {
            slow_blocks: 16,
            offload_threshold: 0.5,
            transfer_bandwidth_blocks_per_micro: 1.0,
            transfer_base_latency_micros: 10,
        }
    }

    fn seq(start: u32, n: u32) -> Vec<u32> {
        (start..start + n).collect()
    }

    #[test]
    fn rejects_bad_config() {
        let mut c = cfg();
        c.offload_threshold = 1.5;
        assert!(TieredKvCache::new(8, 4, c).is_err());
        let mut c = cfg();
        c.transfer_bandwidth_blocks_per_micro = 0.0;
        assert!(TieredKvCache::new(8, 4, c).is_err());
        let mut c = cfg();
        c.slow_blocks = 0;
        assert!(TieredKvCache::new(8, 4, c).is_err());
    }

    #[test]
    fn offloads_cold_content_above_threshold() {
        let mut kv = TieredKvCache::new(4, 4, cfg()).unwrap();
        // Fill all four blocks with cached content, then release.
        kv.allocate(1, &seq(0, 8), 8, 10);
        kv.allocate(2, &seq(100, 8), 8, 11);
        kv.release(1, 20);
        kv.release(2, 21);
        // Fullness 1.0 > 0.5: cold blocks move down to 50%.
        assert!(kv.slow_used() > 0);
        assert!(kv.fast_fullness() <= 0.5);
        kv.assert_conservation();
    }

    #[test]
    fn reload_accumulates_and_consumes_transfer_latency() {
        let mut kv = TieredKvCache::new(4, 4, cfg()).unwrap();
        kv.allocate(1, &seq(0, 8), 8, 10);
        kv.allocate(2, &seq(100, 8), 8, 11);
        kv.release(1, 20);
        kv.release(2, 21);
        let offloaded_before = kv.slow_used();
        assert!(offloaded_before > 0);

        // Request the oldest content again: it must come back up.
        match kv.allocate(3, &seq(0, 8), 8, 30) {
            AllocOutcome::Ok(r) => assert!(r.cached_blocks > 0),
            AllocOutcome::Exhausted => panic!("unexpected exhaustion"),
        }
        let pending = kv.pending_transfer_latency();
        assert!(pending >= 10, "base latency must be included");
        // Pure reads do not consume.
        assert_eq!(kv.pending_transfer_latency(), pending);
        assert_eq!(kv.pending_transfer_latency(), pending);
        // One destructive read drains it.
        assert_eq!(kv.consume_pending_transfer_latency(), pending);
        assert_eq!(kv.pending_transfer_latency(), 0);
        kv.assert_conservation();
    }

    #[test]
    fn slow_tier_evicts_oldest_when_full() {
        let mut c = cfg();
        c.slow_blocks = 1;
        c.offload_threshold = 0.0;
        let mut kv = TieredKvCache::new(2, 4, c).unwrap();
        kv.allocate(1, &seq(0, 4), 4, 10);
        kv.release(1, 11); // offloads hash A
        assert_eq!(kv.slow_used(), 1);
        kv.allocate(2, &seq(100, 4), 4, 20);
        kv.release(2, 21); // offloads hash B, evicting A
        assert_eq!(kv.slow_used(), 1);
        // A is gone from both tiers.
        assert_eq!(kv.cached_prefix_tokens(&seq(0, 4)), 0);
        assert_eq!(kv.cached_prefix_tokens(&seq(100, 4)), 4);
    }

    #[test]
    fn cached_prefix_sees_both_tiers() {
        let mut c = cfg();
        c.offload_threshold = 0.0;
        let mut kv = TieredKvCache::new(2, 4, c).unwrap();
        kv.allocate(1, &seq(0, 8), 8, 10);
        kv.release(1, 11);
        // Everything offloaded, nothing referenced.
        assert!(kv.slow_used() > 0);
        assert_eq!(kv.cached_prefix_tokens(&seq(0, 8)), 8);
    }
}
