//! KV-cache simulation for BLIS.
//!
//! Models the block-granular KV memory of one serving instance:
//!
//! - [`KvCache`]: a single tier of `total_blocks` blocks with a
//!   prefix-hash index, reference counting, an LRU free list, and
//!   transactional allocation (all-or-nothing per call).
//! - [`TieredKvCache`]: a fast tier composed with a slow tier. Cold
//!   cached blocks are offloaded once the fast tier fills past a
//!   threshold; reloading them back costs transfer latency that the
//!   next step on the instance pays.
//!
//! Nothing here knows about requests other than their ids; the batch
//! former decides what to cover and when to release.

mod hash;
mod single;
mod tiered;

pub use hash::{chain_hashes, BlockHash};
pub use single::KvCache;
pub use tiered::{TieredKvCache, TieredKvConfig};

use blis_core::{Micros, RequestId, TokenId};
use serde::Serialize;

/// Block identifier within one tier.
pub type BlockId = u32;

/// Result of one transactional allocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// Every needed block was pinned; the receipt says what was new.
    Ok(AllocReceipt),
    /// The free list ran out mid-call. Every mutation of the call was
    /// rolled back; the caller may preempt and retry.
    Exhausted,
}

/// What one successful allocation call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocReceipt {
    /// Blocks newly taken from the free list (content must be computed).
    pub new_blocks: u32,
    /// Blocks satisfied by the prefix-hash index (content reused).
    pub cached_blocks: u32,
    /// Tokens covered by cached blocks in this call.
    pub hit_tokens: u32,
    /// Tokens whose KV content must be computed this step.
    pub miss_tokens: u32,
}

/// Counters and occupancy, exported into snapshots and the final report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct KvStats {
    pub total_blocks: u32,
    pub used_blocks: u32,
    pub free_blocks: u32,
    pub hit_blocks: u64,
    pub miss_blocks: u64,
    pub hit_tokens: u64,
    pub miss_tokens: u64,
    pub slow_total_blocks: u32,
    pub slow_used_blocks: u32,
    pub offloaded_blocks: u64,
    pub reloaded_blocks: u64,
    pub transfer_micros: u64,
}

impl KvStats {
    /// Block-level cache hit rate over the whole run.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_blocks + self.miss_blocks;
        if total == 0 {
            0.0
        } else {
            self.hit_blocks as f64 / total as f64
        }
    }
}

/// Narrow capability the batch former and snapshots use. Implemented by
/// both the single tier and the tiered composition.
pub trait KvStore {
    /// Transactionally pin blocks so that the first `cover_tokens`
    /// tokens of `tokens` are resident for `req`. Idempotent for
    /// already-covered spans.
    fn allocate(
        &mut self,
        req: RequestId,
        tokens: &[TokenId],
        cover_tokens: u32,
        now: Micros,
    ) -> AllocOutcome;

    /// Pure query: tokens of the longest block-aligned prefix whose
    /// content is already cached (any tier). Mutates nothing, counts
    /// nothing.
    fn cached_prefix_tokens(&self, tokens: &[TokenId]) -> u32;

    /// Drop `req`'s references. Blocks reaching refcount zero become
    /// eviction candidates but keep their content mapping.
    fn release(&mut self, req: RequestId, now: Micros);

    /// Fraction of blocks actively referenced (refcount > 0).
    fn utilization(&self) -> f64;

    fn block_size(&self) -> u32;

    /// Pure read of the accumulated reload latency.
    fn pending_transfer_latency(&self) -> Micros;

    /// Destructive read: returns the accumulated reload latency and
    /// resets it. Only the batch-formation path may call this.
    fn consume_pending_transfer_latency(&mut self) -> Micros;

    fn stats(&self) -> KvStats;

    /// Panics if block conservation is violated. Called at step
    /// boundaries in debug builds and by the invariant tests.
    fn assert_conservation(&self);
}
