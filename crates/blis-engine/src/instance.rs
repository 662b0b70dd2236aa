//! One serving instance: wait queue, KV store, running batch, steps.
//!
//! The instance consumes five event kinds:
//!
//! - `Queued`: a routed request lands in the wait queue.
//! - `Step`: form the next batch and execute it.
//! - `RequestLeft`: a request finished the step that completed it.
//! - `Scheduled`: accounting record of a request's first batch
//!   admission, emitted by the step that stamped its first-schedule
//!   timestamp.
//! - `Preemption`: accounting record for a preemption performed during
//!   batch formation (the state change itself is synchronous, because
//!   allocation retry needs the freed blocks immediately).
//!
//! Batch formation carries every running sequence forward, then admits
//! queued requests greedily under the token and count budgets, in the
//! order the scheduler policy chose. Allocation failures preempt the
//! least recently scheduled batch member and retry; a request is
//! dropped as unservable only when no candidate remains or it has been
//! preempted past the configured ceiling.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use blis_core::{EventPayload, InstanceId, Micros, Request, RequestId};
use blis_kv::{AllocOutcome, KvStats, KvStore};
use blis_latency::{BatchProfile, LatencyModel};

use crate::policy::{PriorityPolicy, SchedulerPolicy};

/// An event the instance wants scheduled on the shared heap, targeted
/// back at this same instance.
pub type Emitted = (Micros, EventPayload);

/// Static per-instance limits, validated before the instance is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    pub total_kv_blocks: u32,
    pub block_size_tokens: u32,
    pub max_running_requests: u32,
    pub max_scheduled_tokens: u32,
    pub max_model_len: u32,
    /// Chunked-prefill threshold; 0 disables chunking.
    #[serde(default)]
    pub long_prefill_token_threshold: u32,
    /// Preemptions after which a request is dropped as unservable.
    #[serde(default = "default_preemption_ceiling")]
    pub preemption_ceiling: u32,
}

fn default_preemption_ceiling() -> u32 {
    8
}

#[derive(Debug, Error)]
pub enum InstanceConfigError {
    #[error("instance config: {name} must be positive")]
    Zero { name: &'static str },
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<(), InstanceConfigError> {
        let positives = [
            ("total_kv_blocks", self.total_kv_blocks),
            ("block_size_tokens", self.block_size_tokens),
            ("max_running_requests", self.max_running_requests),
            ("max_scheduled_tokens", self.max_scheduled_tokens),
            ("max_model_len", self.max_model_len),
            ("preemption_ceiling", self.preemption_ceiling),
        ];
        for (name, value) in positives {
            if value == 0 {
                return Err(InstanceConfigError::Zero { name });
            }
        }
        Ok(())
    }
}

/// Progress counters exported into the final report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InstanceCounters {
    pub completed: u64,
    pub steps: u64,
    pub empty_steps: u64,
    pub preemptions: u64,
    /// Preemption events observed back through the event stream.
    pub preemptions_recorded: u64,
    /// First-schedule events observed back through the event stream.
    pub schedules_recorded: u64,
    pub alloc_failures: u64,
    pub dropped_unservable: u64,
    pub dropped_over_model_len: u64,
    pub dropped_livelock: u64,
    pub dropped_no_capacity: u64,
}

#[derive(Debug)]
struct RunningSeq {
    req: Request,
    last_scheduled: Micros,
    admitted_seq: u64,
}

/// What one batch member does in the step being formed.
#[derive(Debug, Clone, Copy, Default)]
struct StepPlan {
    /// Absolute token coverage the allocator must reach.
    new_cover: u32,
    /// Prefill tokens the cursor advances this step (hits included).
    advance: u32,
    /// Tokens charged against the step budget.
    budget: u32,
    /// Cache-miss tokens actually computed (from the receipt).
    miss_tokens: u32,
    decode: bool,
}

/// A single simulated serving instance.
pub struct InstanceSim {
    id: InstanceId,
    cfg: InstanceConfig,
    kv: Box<dyn KvStore>,
    latency: Arc<dyn LatencyModel>,
    scheduler: Box<dyn SchedulerPolicy>,
    priority: Box<dyn PriorityPolicy>,
    /// Unordered; the scheduler policy orders it at each formation.
    wait: Vec<Request>,
    /// Queueing-delay gate for requests that have not yet been
    /// scheduled for the first time.
    ready_at: BTreeMap<RequestId, Micros>,
    running: Vec<RunningSeq>,
    /// Completed during an executing step, awaiting their RequestLeft.
    leaving: BTreeMap<RequestId, Request>,
    completed: Vec<Request>,
    dropped: Vec<Request>,
    /// Times at which a Step event is already on the heap.
    scheduled_steps: BTreeSet<Micros>,
    /// End of the currently executing step.
    busy_until: Micros,
    admit_seq: u64,
    counters: InstanceCounters,
    last_event_time: Micros,
}

impl InstanceSim {
    pub fn new(
        id: InstanceId,
        cfg: InstanceConfig,
        kv: Box<dyn KvStore>,
        latency: Arc<dyn LatencyModel>,
        scheduler: Box<dyn SchedulerPolicy>,
        priority: Box<dyn PriorityPolicy>,
    ) -> Result<Self, InstanceConfigError> {
        cfg.validate()?;
        Ok(Self {
            id,
            cfg,
            kv,
            latency,
            scheduler,
            priority,
            wait: Vec::new(),
            ready_at: BTreeMap::new(),
            running: Vec::new(),
            leaving: BTreeMap::new(),
            completed: Vec::new(),
            dropped: Vec::new(),
            scheduled_steps: BTreeSet::new(),
            busy_until: 0,
            admit_seq: 0,
            counters: InstanceCounters::default(),
            last_event_time: 0,
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    // Pure observations, used by the snapshot provider.

    pub fn queue_depth(&self) -> u32 {
        self.wait.len() as u32
    }

    pub fn batch_size(&self) -> u32 {
        self.running.len() as u32
    }

    pub fn current_clock(&self) -> Micros {
        self.last_event_time
    }

    pub fn kv_utilization(&self) -> f64 {
        self.kv.utilization()
    }

    pub fn pending_transfer_latency(&self) -> Micros {
        self.kv.pending_transfer_latency()
    }

    pub fn counters(&self) -> &InstanceCounters {
        &self.counters
    }

    pub fn kv_stats(&self) -> KvStats {
        self.kv.stats()
    }

    pub fn still_queued(&self) -> u32 {
        self.wait.len() as u32
    }

    pub fn still_running(&self) -> u32 {
        (self.running.len() + self.leaving.len()) as u32
    }

    pub fn take_completed(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.completed)
    }

    pub fn take_dropped(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.dropped)
    }

    /// Dispatch one instance-targeted event.
    pub fn handle(&mut self, payload: EventPayload, now: Micros) -> Vec<Emitted> {
        self.last_event_time = now;
        match payload {
            EventPayload::Queued { request } => self.handle_queued(request, now),
            EventPayload::Step => self.handle_step(now),
            EventPayload::RequestLeft { request_id } => self.handle_request_left(request_id, now),
            EventPayload::Scheduled { .. } => {
                self.counters.schedules_recorded += 1;
                Vec::new()
            }
            EventPayload::Preemption { .. } => {
                self.counters.preemptions_recorded += 1;
                Vec::new()
            }
            other => panic!(
                "instance {}: cluster-stage event {:?} delivered to an instance",
                self.id,
                other.class()
            ),
        }
    }

    fn handle_queued(&mut self, mut req: Request, now: Micros) -> Vec<Emitted> {
        req.record_enqueue(now);
        if req.input_len() > self.cfg.max_model_len {
            tracing::warn!(
                instance = self.id,
                request = req.id(),
                input = req.input_len(),
                max = self.cfg.max_model_len,
                "dropping request over model length"
            );
            self.counters.dropped_unservable += 1;
            self.counters.dropped_over_model_len += 1;
            self.dropped.push(req);
            return Vec::new();
        }
        let ready = now + self.latency.queueing_time(req.input_len(), req.expected_output());
        self.ready_at.insert(req.id(), ready);
        self.wait.push(req);
        self.ensure_step(ready).into_iter().collect()
    }

    fn handle_request_left(&mut self, request_id: RequestId, now: Micros) -> Vec<Emitted> {
        let mut req = self
            .leaving
            .remove(&request_id)
            .unwrap_or_else(|| panic!("request {request_id} left instance {} twice", self.id));
        req.mark_completed(now);
        self.kv.release(request_id, now);
        self.counters.completed += 1;
        tracing::debug!(instance = self.id, request = request_id, "request completed");
        self.completed.push(req);
        if !self.wait.is_empty() {
            self.ensure_step(now).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    /// Guarantee a Step event at or before `at` (clamped to the end of
    /// any executing step). Returns the event to schedule, if one is
    /// not already pending early enough.
    fn ensure_step(&mut self, at: Micros) -> Option<Emitted> {
        let t = at.max(self.busy_until);
        if let Some(&first) = self.scheduled_steps.iter().next() {
            if first <= t {
                return None;
            }
        }
        if self.scheduled_steps.insert(t) {
            Some((t, EventPayload::Step))
        } else {
            None
        }
    }

    /// Plan what `req` would do in the step being formed. `None` means
    /// the request cannot be admitted right now (budget exhausted);
    /// carried sequences always get a plan.
    fn plan_step(&self, req: &Request, budget: &mut u32, carried: bool) -> Option<StepPlan> {
        if req.prefill_done() {
            if !carried && *budget == 0 {
                return None;
            }
            let charge = 1u32.min(*budget);
            *budget -= charge;
            Some(StepPlan {
                new_cover: req.input_len(),
                advance: 0,
                budget: charge,
                miss_tokens: 0,
                decode: true,
            })
        } else {
            let cached = self.kv.cached_prefix_tokens(req.input_tokens());
            let cursor = req.prefill_progress();
            // Fast-forward over block-aligned cached content; only the
            // remainder needs compute and counts against the budget.
            let skip_to = cached.max(cursor).min(req.input_len());
            let remaining = req.input_len() - skip_to;
            let threshold = if self.cfg.long_prefill_token_threshold > 0 {
                self.cfg.long_prefill_token_threshold
            } else {
                u32::MAX
            };
            let chunk = remaining.min(threshold).min(*budget);
            if remaining > 0 && chunk == 0 && !carried {
                return None;
            }
            *budget -= chunk;
            let new_cover = skip_to + chunk;
            Some(StepPlan {
                new_cover,
                advance: new_cover - cursor,
                budget: chunk,
                miss_tokens: 0,
                decode: false,
            })
        }
    }

    /// Preempt one sequence out of the forming batch: release its
    /// blocks, requeue it (or drop it past the ceiling), and emit the
    /// accounting record.
    fn preempt_seq(
        &mut self,
        mut req: Request,
        requeued: &mut Vec<Request>,
        preempted_now: &mut u32,
        out: &mut Vec<Emitted>,
        now: Micros,
    ) {
        self.kv.release(req.id(), now);
        req.mark_preempted();
        self.counters.preemptions += 1;
        *preempted_now += 1;
        out.push((now, EventPayload::Preemption { request_id: req.id() }));
        if req.preemptions() > self.cfg.preemption_ceiling {
            tracing::warn!(
                instance = self.id,
                request = req.id(),
                preemptions = req.preemptions(),
                "dropping request after repeated preemption"
            );
            self.counters.dropped_unservable += 1;
            self.counters.dropped_livelock += 1;
            self.dropped.push(req);
        } else {
            tracing::debug!(instance = self.id, request = req.id(), "preempted");
            requeued.push(req);
        }
    }

    /// Allocate for `req` under `plan`, preempting batch members (least
    /// recently scheduled first) until it fits. `Err` means the free
    /// list cannot satisfy the plan even with an empty batch.
    #[allow(clippy::too_many_arguments)]
    fn allocate_with_preemption(
        &mut self,
        req: &Request,
        mut plan: StepPlan,
        batch: &mut Vec<(RunningSeq, StepPlan)>,
        requeued: &mut Vec<Request>,
        budget: &mut u32,
        preempted_now: &mut u32,
        out: &mut Vec<Emitted>,
        now: Micros,
    ) -> Result<StepPlan, ()> {
        loop {
            match self
                .kv
                .allocate(req.id(), req.input_tokens(), plan.new_cover, now)
            {
                AllocOutcome::Ok(receipt) => {
                    plan.miss_tokens = receipt.miss_tokens;
                    return Ok(plan);
                }
                AllocOutcome::Exhausted => {
                    self.counters.alloc_failures += 1;
                    let victim = batch
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, (s, _))| (s.last_scheduled, s.admitted_seq))
                        .map(|(i, _)| i);
                    let Some(i) = victim else {
                        return Err(());
                    };
                    let (seq, victim_plan) = batch.remove(i);
                    *budget += victim_plan.budget;
                    self.preempt_seq(seq.req, requeued, preempted_now, out, now);
                }
            }
        }
    }

    fn handle_step(&mut self, now: Micros) -> Vec<Emitted> {
        self.scheduled_steps.remove(&now);
        if now < self.busy_until {
            // Stale wake-up scheduled before the current step started.
            return Vec::new();
        }
        let mut out: Vec<Emitted> = Vec::new();

        for r in self.wait.iter_mut() {
            r.priority = self.priority.compute(r, now);
        }
        self.scheduler.order(&mut self.wait, now);

        let mut budget = self.cfg.max_scheduled_tokens;
        let mut batch: Vec<(RunningSeq, StepPlan)> = Vec::new();
        let mut requeued: Vec<Request> = Vec::new();
        let mut preempted_now: u32 = 0;

        // Carry every running sequence forward.
        let carried = std::mem::take(&mut self.running);
        for seq in carried {
            let plan = self
                .plan_step(&seq.req, &mut budget, true)
                .expect("carried sequences always plan");
            match self.allocate_with_preemption(
                &seq.req,
                plan,
                &mut batch,
                &mut requeued,
                &mut budget,
                &mut preempted_now,
                &mut out,
                now,
            ) {
                Ok(plan) => batch.push((seq, plan)),
                Err(()) => {
                    // No other member can yield enough: this sequence
                    // itself goes back to the queue.
                    budget += plan.budget;
                    self.preempt_seq(seq.req, &mut requeued, &mut preempted_now, &mut out, now);
                }
            }
        }

        // Greedy admission in scheduler order under both budgets.
        let mut still_waiting: Vec<Request> = Vec::new();
        let mut next_ready: Option<Micros> = None;
        let waiting = std::mem::take(&mut self.wait);
        for mut req in waiting {
            if batch.len() >= self.cfg.max_running_requests as usize {
                still_waiting.push(req);
                continue;
            }
            if let Some(&ready) = self.ready_at.get(&req.id()) {
                if ready > now {
                    next_ready = Some(next_ready.map_or(ready, |r: Micros| r.min(ready)));
                    still_waiting.push(req);
                    continue;
                }
            }
            let Some(plan) = self.plan_step(&req, &mut budget, false) else {
                still_waiting.push(req);
                continue;
            };
            match self.allocate_with_preemption(
                &req,
                plan,
                &mut batch,
                &mut requeued,
                &mut budget,
                &mut preempted_now,
                &mut out,
                now,
            ) {
                Ok(plan) => {
                    req.mark_running();
                    if req.timestamps().first_schedule().is_none() {
                        req.record_first_schedule(now);
                        out.push((
                            now,
                            EventPayload::Scheduled {
                                request_id: req.id(),
                            },
                        ));
                    }
                    self.ready_at.remove(&req.id());
                    self.admit_seq += 1;
                    batch.push((
                        RunningSeq {
                            req,
                            last_scheduled: now,
                            admitted_seq: self.admit_seq,
                        },
                        plan,
                    ));
                }
                Err(()) => {
                    budget += plan.budget;
                    tracing::warn!(
                        instance = self.id,
                        request = req.id(),
                        "dropping request: kv store cannot hold it even with an empty batch"
                    );
                    self.ready_at.remove(&req.id());
                    self.counters.dropped_unservable += 1;
                    self.counters.dropped_no_capacity += 1;
                    self.dropped.push(req);
                }
            }
        }
        self.wait = still_waiting;
        self.wait.extend(requeued);

        if batch.is_empty() {
            self.counters.empty_steps += 1;
            if let Some(ready) = next_ready {
                out.extend(self.ensure_step(ready));
            }
            return out;
        }

        // Execute the step.
        self.counters.steps += 1;
        let mut profile = BatchProfile::default();
        let mut emitted_tokens = 0u32;
        for (seq, plan) in &batch {
            profile.miss_tokens += plan.miss_tokens as u64;
            if plan.decode {
                profile.decode_seqs += 1;
                profile.context_tokens += (seq.req.input_len() + seq.req.progress()) as u64;
                emitted_tokens += 1;
            } else {
                profile.prefill_seqs += 1;
                if seq.req.prefill_progress() + plan.advance == seq.req.input_len() {
                    emitted_tokens += 1;
                }
            }
        }
        let step_cost = self.latency.step_time(&profile)
            + self.latency.scheduling_time()
            + self.latency.preemption_time() * preempted_now as Micros
            + self.latency.output_token_time() * emitted_tokens as Micros
            + self.kv.consume_pending_transfer_latency();
        let step_end = now + step_cost;
        tracing::trace!(
            instance = self.id,
            batch = batch.len(),
            miss_tokens = profile.miss_tokens,
            decode = profile.decode_seqs,
            cost = step_cost,
            "step"
        );

        for (mut seq, plan) in batch {
            if plan.advance > 0 {
                seq.req.advance_prefill(plan.advance);
            }
            let emits = plan.decode || seq.req.prefill_done();
            if emits {
                seq.req.emit_token(step_end);
            }
            seq.last_scheduled = now;
            if seq.req.is_done() {
                out.push((
                    step_end,
                    EventPayload::RequestLeft {
                        request_id: seq.req.id(),
                    },
                ));
                self.leaving.insert(seq.req.id(), seq.req);
            } else {
                self.running.push(seq);
            }
        }
        self.busy_until = step_end;

        // Work conservation: anything left to do gets a successor step.
        if !self.running.is_empty() {
            out.extend(self.ensure_step(step_end));
        } else if !self.wait.is_empty() {
            let earliest_ready = self
                .wait
                .iter()
                .map(|r| self.ready_at.get(&r.id()).copied().unwrap_or(0))
                .min()
                .unwrap_or(0);
            out.extend(self.ensure_step(step_end.max(earliest_ready)));
        }

        #[cfg(debug_assertions)]
        self.kv.assert_conservation();

        out
    }
}
