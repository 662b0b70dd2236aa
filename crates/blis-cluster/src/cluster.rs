//! The shared event loop across all instances.
//!
//! One heap, one clock. Arrivals are pre-computed and injected before
//! the loop starts; everything after that is event-driven. Instance
//! handlers return the events they want scheduled and the loop merges
//! them back into the heap, so total ordering and clock monotonicity
//! hold across the whole cluster.

use serde::Deserialize;
use thiserror::Error;

use blis_core::{EventPayload, EventQueue, EventTarget, Micros, Request};
use blis_engine::InstanceSim;
use blis_metrics::{DecisionTrace, ReportInputs, RequestMetrics, SimReport};

use crate::admission::AdmissionPolicy;
use crate::routing::RoutingPolicy;
use crate::snapshot::{CachedSnapshotProvider, RouterState};

/// Cluster-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub num_instances: u32,
    pub root_seed: u64,
    /// Stop processing events past this time; `None` runs to quiescence.
    #[serde(default)]
    pub simulation_horizon_micros: Option<Micros>,
    #[serde(default)]
    pub snapshot_refresh_interval_micros: Micros,
    #[serde(default)]
    pub admission_latency_micros: Micros,
    #[serde(default)]
    pub routing_latency_micros: Micros,
}

#[derive(Debug, Error)]
pub enum ClusterConfigError {
    #[error("cluster needs at least one instance")]
    NoInstances,
    #[error("cluster was given {given} instances but is configured for {expected}")]
    InstanceCountMismatch { given: usize, expected: u32 },
    #[error("simulation horizon must be positive when set")]
    ZeroHorizon,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ClusterConfigError> {
        if self.num_instances == 0 {
            return Err(ClusterConfigError::NoInstances);
        }
        if self.simulation_horizon_micros == Some(0) {
            return Err(ClusterConfigError::ZeroHorizon);
        }
        Ok(())
    }
}

/// Everything a finished run hands to the caller.
#[derive(Debug)]
pub struct RunOutput {
    pub report: SimReport,
    /// Completed requests in id order, for golden comparisons.
    pub completed: Vec<RequestMetrics>,
}

/// The control plane plus the instances it drives.
pub struct ClusterSim {
    cfg: ClusterConfig,
    queue: EventQueue,
    instances: Vec<InstanceSim>,
    admission: Box<dyn AdmissionPolicy>,
    routing: Box<dyn RoutingPolicy>,
    snapshots: CachedSnapshotProvider,
    trace: DecisionTrace,
    /// Routed-but-not-yet-enqueued counts, indexed by instance.
    pending_routed: Vec<u32>,
    num_requests: u64,
    injected: u64,
    rejected: u64,
    end_time: Micros,
}

impl ClusterSim {
    pub fn new(
        cfg: ClusterConfig,
        instances: Vec<InstanceSim>,
        admission: Box<dyn AdmissionPolicy>,
        routing: Box<dyn RoutingPolicy>,
        trace: DecisionTrace,
    ) -> Result<Self, ClusterConfigError> {
        cfg.validate()?;
        if instances.len() != cfg.num_instances as usize {
            return Err(ClusterConfigError::InstanceCountMismatch {
                given: instances.len(),
                expected: cfg.num_instances,
            });
        }
        let n = instances.len();
        Ok(Self {
            snapshots: CachedSnapshotProvider::new(n, cfg.snapshot_refresh_interval_micros),
            pending_routed: vec![0; n],
            cfg,
            queue: EventQueue::new(),
            instances,
            admission,
            routing,
            trace,
            num_requests: 0,
            injected: 0,
            rejected: 0,
            end_time: 0,
        })
    }

    /// Load the pre-computed workload. Arrivals must already be sorted
    /// or not; the heap orders them either way.
    pub fn inject(&mut self, requests: Vec<Request>) {
        self.num_requests += requests.len() as u64;
        for request in requests {
            let at = request.arrival();
            self.queue
                .push(at, EventTarget::Cluster, EventPayload::ClusterArrival { request });
        }
    }

    /// Drive the simulation until the queue drains or the horizon is
    /// reached, then assemble the report.
    pub fn run(mut self, include_per_request: bool) -> RunOutput {
        while let Some(event) = self.queue.pop() {
            if let Some(horizon) = self.cfg.simulation_horizon_micros {
                if event.time > horizon {
                    // Put the event back so end-of-run accounting sees
                    // any request it carries.
                    self.queue.push(event.time, event.target, event.payload);
                    tracing::info!(horizon, "simulation horizon reached");
                    break;
                }
            }
            self.end_time = event.time;
            match event.target {
                EventTarget::Cluster => self.handle_cluster_event(event.payload, event.time),
                EventTarget::Instance(i) => {
                    if matches!(event.payload, EventPayload::Queued { .. }) {
                        // The routing commitment materialized.
                        self.pending_routed[i as usize] =
                            self.pending_routed[i as usize].saturating_sub(1);
                    }
                    let emitted = self.instances[i as usize].handle(event.payload, event.time);
                    for (time, payload) in emitted {
                        self.queue.push(time, EventTarget::Instance(i), payload);
                    }
                }
            }
        }
        self.finish(include_per_request)
    }

    fn handle_cluster_event(&mut self, payload: EventPayload, now: Micros) {
        match payload {
            EventPayload::ClusterArrival { request } => {
                let snaps = self
                    .snapshots
                    .snapshots(&self.instances, &self.pending_routed, now);
                let state = RouterState {
                    now,
                    snapshots: &snaps,
                };
                let decision = self.admission.admit(&request, &state);
                self.trace
                    .record_admission(now, request.id(), decision.admit, &decision.reason);
                if decision.admit {
                    self.injected += 1;
                    self.queue.push(
                        now + self.cfg.admission_latency_micros,
                        EventTarget::Cluster,
                        EventPayload::AdmissionDecision { request },
                    );
                } else {
                    self.rejected += 1;
                    tracing::debug!(
                        request = request.id(),
                        reason = %decision.reason,
                        "admission rejected"
                    );
                }
            }
            EventPayload::AdmissionDecision { mut request } => {
                let snaps = self
                    .snapshots
                    .snapshots(&self.instances, &self.pending_routed, now);
                let state = RouterState {
                    now,
                    snapshots: &snaps,
                };
                let outcome = self.routing.route(&request, &state);
                self.trace
                    .record_routing(now, request.id(), outcome.instance, &outcome.scores);
                request.assign_instance(outcome.instance);
                self.pending_routed[outcome.instance as usize] += 1;
                self.queue.push(
                    now,
                    EventTarget::Cluster,
                    EventPayload::RoutingDecision {
                        request,
                        priority_hint: outcome.priority_hint,
                    },
                );
            }
            EventPayload::RoutingDecision {
                mut request,
                priority_hint,
            } => {
                if let Some(hint) = priority_hint {
                    request.priority = hint;
                }
                let instance = request
                    .assigned_instance()
                    .expect("routed request carries its instance");
                self.queue.push(
                    now + self.cfg.routing_latency_micros,
                    EventTarget::Instance(instance),
                    EventPayload::Queued { request },
                );
            }
            other => panic!(
                "cluster loop: instance event {:?} arrived without a target",
                other.class()
            ),
        }
    }

    fn finish(mut self, include_per_request: bool) -> RunOutput {
        let mut completed_reqs = Vec::new();
        let mut still_queued = 0u64;
        let mut still_running = 0u64;
        let mut dropped = 0u64;
        let mut preemptions = 0u64;
        let mut hit_blocks = 0u64;
        let mut miss_blocks = 0u64;
        let mut offloaded = 0u64;
        let mut reloaded = 0u64;
        let mut transfer_micros = 0u64;
        for inst in self.instances.iter_mut() {
            completed_reqs.extend(inst.take_completed());
            still_queued += inst.still_queued() as u64;
            still_running += inst.still_running() as u64;
            let counters = *inst.counters();
            dropped += counters.dropped_unservable;
            preemptions += counters.preemptions;
            let kv = inst.kv_stats();
            hit_blocks += kv.hit_blocks;
            miss_blocks += kv.miss_blocks;
            offloaded += kv.offloaded_blocks;
            reloaded += kv.reloaded_blocks;
            transfer_micros += kv.transfer_micros;
        }
        // Requests admitted but still inside the admission/routing
        // pipeline when the horizon cut the run count as queued.
        still_queued += self.drain_in_flight();

        completed_reqs.sort_by_key(|r| r.id());
        let completed: Vec<RequestMetrics> = completed_reqs
            .iter()
            .map(RequestMetrics::from_request)
            .collect();

        assert_eq!(
            self.num_requests,
            self.injected + self.rejected,
            "pipeline conservation violated: {} requests != {} injected + {} rejected",
            self.num_requests,
            self.injected,
            self.rejected
        );

        let kv_hit_rate = if hit_blocks + miss_blocks == 0 {
            0.0
        } else {
            hit_blocks as f64 / (hit_blocks + miss_blocks) as f64
        };
        let duration = match self.cfg.simulation_horizon_micros {
            Some(h) => self.end_time.min(h),
            None => self.end_time,
        };
        let (trace_summary, trace_decisions) = if self.trace.enabled() {
            (Some(self.trace.summary()), Some(self.trace.entries_json()))
        } else {
            (None, None)
        };

        let report = SimReport::build(ReportInputs {
            completed: &completed,
            injected: self.injected,
            rejected: self.rejected,
            dropped_unservable: dropped,
            still_queued,
            still_running,
            preemptions,
            kv_hit_rate,
            kv_offloaded_blocks: offloaded,
            kv_reloaded_blocks: reloaded,
            kv_transfer_micros: transfer_micros,
            duration,
            trace_summary,
            trace_decisions,
            include_per_request,
        });
        report.assert_conservation();
        RunOutput { report, completed }
    }

    /// Count admitted requests stranded in the event queue (pipeline
    /// stages or undelivered Queued events) when the run stopped early.
    fn drain_in_flight(&mut self) -> u64 {
        let mut stranded = 0u64;
        while let Some(event) = self.queue.pop() {
            match event.payload {
                EventPayload::AdmissionDecision { .. }
                | EventPayload::RoutingDecision { .. }
                | EventPayload::Queued { .. } => stranded += 1,
                EventPayload::ClusterArrival { .. } => {
                    // Never admitted: drop from the request population.
                    self.num_requests -= 1;
                }
                _ => {}
            }
        }
        stranded
    }
}
