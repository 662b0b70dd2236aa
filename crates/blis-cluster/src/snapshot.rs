//! Read-only instance observations with per-field freshness.
//!
//! Queue depth, batch size, and pending routed commitments are always
//! read live: they are the signals routing herds on when stale. KV
//! utilization is allowed to lag by up to the configured refresh
//! interval, modelling a metric that is expensive to collect.
//! Snapshots are copies; they never alias live instance state.

use blis_core::{InstanceId, Micros};
use blis_engine::InstanceSim;
use serde::Serialize;

/// One instance's observable state at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance: InstanceId,
    pub queue_depth: u32,
    pub batch_size: u32,
    /// Requests routed here but not yet delivered to the wait queue.
    pub pending_requests: u32,
    pub kv_utilization: f64,
    pub pending_transfer_micros: Micros,
}

impl InstanceSnapshot {
    /// The canonical single-scalar load metric.
    pub fn effective_load(&self) -> f64 {
        (self.queue_depth + self.batch_size + self.pending_requests) as f64
    }
}

/// Read-only bridge handed to admission and routing policies for the
/// duration of one call.
#[derive(Debug)]
pub struct RouterState<'a> {
    pub now: Micros,
    pub snapshots: &'a [InstanceSnapshot],
}

/// Snapshot source enforcing the per-field freshness contract.
#[derive(Debug)]
pub struct CachedSnapshotProvider {
    refresh_interval: Micros,
    /// Last refresh time and value of KV utilization, per instance.
    kv_cache: Vec<Option<(Micros, f64)>>,
}

impl CachedSnapshotProvider {
    pub fn new(num_instances: usize, refresh_interval: Micros) -> Self {
        Self {
            refresh_interval,
            kv_cache: vec![None; num_instances],
        }
    }

    /// Produce snapshots of every instance, indexed by instance id.
    pub fn snapshots(
        &mut self,
        instances: &[InstanceSim],
        pending_routed: &[u32],
        now: Micros,
    ) -> Vec<InstanceSnapshot> {
        instances
            .iter()
            .enumerate()
            .map(|(i, inst)| {
                let kv_utilization = self.kv_utilization_for(i, inst, now);
                InstanceSnapshot {
                    instance: inst.id(),
                    queue_depth: inst.queue_depth(),
                    batch_size: inst.batch_size(),
                    pending_requests: pending_routed[i],
                    kv_utilization,
                    pending_transfer_micros: inst.pending_transfer_latency(),
                }
            })
            .collect()
    }

    fn kv_utilization_for(&mut self, i: usize, inst: &InstanceSim, now: Micros) -> f64 {
        let due = match self.kv_cache[i] {
            None => true,
            Some((at, _)) => self.refresh_interval == 0 || now >= at + self.refresh_interval,
        };
        if due {
            let fresh = inst.kv_utilization();
            self.kv_cache[i] = Some((now, fresh));
            fresh
        } else {
            self.kv_cache[i].expect("cache entry present when not due").1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blis_core::{Request, SloClass};
    use blis_engine::{build_priority_policy, build_scheduler_policy, InstanceConfig};
    use blis_kv::KvCache;
    use blis_latency::{BlackboxCoefficients, BlackboxModel};
    use std::sync::Arc;

    fn instance() -> InstanceSim {
        let cfg = InstanceConfig {
            total_kv_blocks: 16,
            block_size_tokens: 4,
            max_running_requests: 8,
            max_scheduled_tokens: 8192,
            max_model_len: 2048,
            long_prefill_token_threshold: 0,
            preemption_ceiling: 8,
        };
        InstanceSim::new(
            0,
            cfg.clone(),
            Box::new(KvCache::new(cfg.total_kv_blocks, cfg.block_size_tokens)),
            Arc::new(
                BlackboxModel::new(BlackboxCoefficients {
                    alpha: [0.0; 3],
                    beta: [100.0, 1.0, 1.0],
                })
                .unwrap(),
            ),
            build_scheduler_policy("fcfs").unwrap(),
            build_priority_policy("constant", None).unwrap(),
        )
        .unwrap()
    }

    fn queued(id: u64, at: Micros) -> blis_core::EventPayload {
        blis_core::EventPayload::Queued {
            request: Request::new(id, at, (0..8).collect(), 4, SloClass::Standard, "t", None),
        }
    }

    #[test]
    fn queue_depth_is_always_live() {
        let mut inst = instance();
        let mut provider = CachedSnapshotProvider::new(1, 1_000_000);
        let before = provider.snapshots(std::slice::from_ref(&inst), &[0], 0);
        assert_eq!(before[0].queue_depth, 0);

        inst.handle(queued(1, 10), 10);
        let after = provider.snapshots(std::slice::from_ref(&inst), &[0], 10);
        // Same refresh window, yet the depth moved: it is synchronous.
        assert_eq!(after[0].queue_depth, 1);
    }

    #[test]
    fn kv_utilization_lags_within_refresh_interval() {
        let mut inst = instance();
        let mut provider = CachedSnapshotProvider::new(1, 1_000);

        let s0 = provider.snapshots(std::slice::from_ref(&inst), &[0], 0);
        assert_eq!(s0[0].kv_utilization, 0.0);

        // Run a step so KV fills up.
        inst.handle(queued(1, 10), 10);
        let emitted = inst.handle(blis_core::EventPayload::Step, 10);
        assert!(!emitted.is_empty());

        // Inside the window: still the stale zero.
        let stale = provider.snapshots(std::slice::from_ref(&inst), &[0], 500);
        assert_eq!(stale[0].kv_utilization, 0.0);

        // Past the window: refreshed.
        let fresh = provider.snapshots(std::slice::from_ref(&inst), &[0], 1_000);
        assert!(fresh[0].kv_utilization > 0.0);
    }

    #[test]
    fn zero_interval_means_always_fresh() {
        let mut inst = instance();
        let mut provider = CachedSnapshotProvider::new(1, 0);
        provider.snapshots(std::slice::from_ref(&inst), &[0], 0);
        inst.handle(queued(1, 5), 5);
        inst.handle(blis_core::EventPayload::Step, 5);
        let s = provider.snapshots(std::slice::from_ref(&inst), &[0], 6);
        assert!(s[0].kv_utilization > 0.0);
    }

    #[test]
    fn effective_load_sums_three_signals() {
        let snap = InstanceSnapshot {
            instance: 0,
            queue_depth: 2,
            batch_size: 3,
            pending_requests: 1,
            kv_utilization: 0.5,
            pending_transfer_micros: 0,
        };
        assert_eq!(snap.effective_load(), 6.0);
    }
}
