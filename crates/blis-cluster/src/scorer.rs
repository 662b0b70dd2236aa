//! Individual routing scorers.
//!
//! A scorer maps `(request, snapshots)` to one score in [0, 1] per
//! instance. Most are stateless projections of the snapshot; the
//! prefix-affinity scorer additionally owns the router-side prefix
//! index and is told, through `observe`, which instance won each
//! decision so the next sibling request sees the locality.
//!
//! Dispatch is a closed sum type rather than trait objects: adding a
//! scorer means one new variant and one factory arm.

use blis_core::{InstanceId, Request};
use blis_kv::chain_hashes;

use crate::prefix_index::PrefixCacheIndex;
use crate::snapshot::InstanceSnapshot;

/// One named scorer in a weighted pipeline.
#[derive(Debug)]
pub enum Scorer {
    /// Min-max normalized effective load: least loaded scores 1.0;
    /// uniform 0.5 when every instance is equally loaded.
    QueueDepth,
    /// `1 - kv_utilization`.
    KvUtilization,
    /// `1 / (1 + effective_load)`.
    LoadBalance,
    /// Estimated fraction of the request's blocks resident on each
    /// instance, per the router-side index.
    PrefixAffinity(PrefixAffinityScorer),
}

impl Scorer {
    pub fn score(&self, req: &Request, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        match self {
            Scorer::QueueDepth => {
                let loads: Vec<f64> = snapshots.iter().map(|s| s.effective_load()).collect();
                let min = loads.iter().copied().fold(f64::INFINITY, f64::min);
                let max = loads.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if max == min {
                    vec![0.5; snapshots.len()]
                } else {
                    loads.iter().map(|l| (max - l) / (max - min)).collect()
                }
            }
            Scorer::KvUtilization => snapshots
                .iter()
                .map(|s| (1.0 - s.kv_utilization).clamp(0.0, 1.0))
                .collect(),
            Scorer::LoadBalance => snapshots
                .iter()
                .map(|s| 1.0 / (1.0 + s.effective_load()))
                .collect(),
            Scorer::PrefixAffinity(p) => p.score(req, snapshots),
        }
    }

    /// Invoked exactly once per routing decision, after argmax and
    /// before the decision is returned.
    pub fn observe(&mut self, req: &Request, chosen: InstanceId) {
        if let Scorer::PrefixAffinity(p) = self {
            p.observe(req, chosen);
        }
    }
}

/// The stateful prefix-affinity scorer plus its observer state.
#[derive(Debug)]
pub struct PrefixAffinityScorer {
    index: PrefixCacheIndex,
    block_size: u32,
}

impl PrefixAffinityScorer {
    pub fn new(index_capacity: usize, block_size: u32) -> Self {
        Self {
            index: PrefixCacheIndex::new(index_capacity),
            block_size,
        }
    }

    fn score(&self, req: &Request, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        let hashes = chain_hashes(req.input_tokens(), self.block_size);
        let mut matched = vec![0u32; snapshots.len()];
        for h in &hashes {
            if let Some(instance) = self.index.get(*h) {
                if let Some(slot) = matched.get_mut(instance as usize) {
                    *slot += 1;
                }
            }
        }
        if hashes.is_empty() {
            return vec![0.0; snapshots.len()];
        }
        matched
            .iter()
            .map(|&m| m as f64 / hashes.len() as f64)
            .collect()
    }

    fn observe(&mut self, req: &Request, chosen: InstanceId) {
        for h in chain_hashes(req.input_tokens(), self.block_size) {
            self.index.record(h, chosen);
        }
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_core::SloClass;

    fn snap(instance: u32, queue: u32, batch: u32, pending: u32, kv: f64) -> InstanceSnapshot {
        InstanceSnapshot {
            instance,
            queue_depth: queue,
            batch_size: batch,
            pending_requests: pending,
            kv_utilization: kv,
            pending_transfer_micros: 0,
        }
    }

    fn req(tokens: Vec<u32>) -> Request {
        Request::new(1, 0, tokens, 4, SloClass::Standard, "t", None)
    }

    #[test]
    fn queue_depth_normalizes_min_max() {
        let snaps = [snap(0, 4, 0, 0, 0.0), snap(1, 0, 0, 0, 0.0), snap(2, 2, 0, 0, 0.0)];
        let scores = Scorer::QueueDepth.score(&req(vec![1]), &snaps);
        assert_eq!(scores[1], 1.0);
        assert_eq!(scores[0], 0.0);
        assert_eq!(scores[2], 0.5);
    }

    #[test]
    fn queue_depth_uniform_when_equal() {
        let snaps = [snap(0, 3, 1, 0, 0.0), snap(1, 2, 2, 0, 0.0)];
        let scores = Scorer::QueueDepth.score(&req(vec![1]), &snaps);
        assert_eq!(scores, vec![0.5, 0.5]);
    }

    #[test]
    fn kv_utilization_inverts() {
        let snaps = [snap(0, 0, 0, 0, 0.25), snap(1, 0, 0, 0, 1.0)];
        let scores = Scorer::KvUtilization.score(&req(vec![1]), &snaps);
        assert_eq!(scores, vec![0.75, 0.0]);
    }

    #[test]
    fn load_balance_decays_with_load() {
        let snaps = [snap(0, 0, 0, 0, 0.0), snap(1, 3, 0, 1, 0.0)];
        let scores = Scorer::LoadBalance.score(&req(vec![1]), &snaps);
        assert_eq!(scores, vec![1.0, 0.2]);
    }

    #[test]
    fn prefix_affinity_sees_observed_routes() {
        let mut scorer = Scorer::PrefixAffinity(PrefixAffinityScorer::new(64, 4));
        let snaps = [snap(0, 0, 0, 0, 0.0), snap(1, 0, 0, 0, 0.0)];
        let shared = req((0..8).collect());

        let cold = scorer.score(&shared, &snaps);
        assert_eq!(cold, vec![0.0, 0.0]);

        scorer.observe(&shared, 1);
        if let Scorer::PrefixAffinity(p) = &scorer {
            assert_eq!(p.index_len(), 2);
        }
        let warm = scorer.score(&shared, &snaps);
        assert_eq!(warm, vec![0.0, 1.0]);

        // Half-overlapping request: first block shared, second not.
        let sibling = req(vec![0, 1, 2, 3, 99, 98, 97, 96]);
        let partial = scorer.score(&sibling, &snaps);
        assert_eq!(partial, vec![0.0, 0.5]);
    }

    #[test]
    fn short_inputs_score_zero_affinity() {
        let scorer = Scorer::PrefixAffinity(PrefixAffinityScorer::new(64, 16));
        let snaps = [snap(0, 0, 0, 0, 0.0)];
        // Below one full block: no stable identity to match on.
        let scores = scorer.score(&req(vec![1, 2, 3]), &snaps);
        assert_eq!(scores, vec![0.0]);
    }
}
