//! Request identity, lifecycle state machine, and metric timestamps.
//!
//! A request is created by the workload layer, owned by the cluster
//! pipeline until routing, then owned by exactly one instance. Token
//! vectors are immutable after construction. Lifecycle transitions are
//! checked: an illegal transition is a bug and panics with context.

use serde::{Deserialize, Serialize};

use crate::time::Micros;
use crate::{InstanceId, RequestId, SessionId, TokenId};

/// Service-level class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SloClass {
    Critical,
    Standard,
    Sheddable,
    Batch,
}

impl SloClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SloClass::Critical => "critical",
            SloClass::Standard => "standard",
            SloClass::Sheddable => "sheddable",
            SloClass::Batch => "batch",
        }
    }
}

/// Lifecycle state. Transitions are monotonic except for preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
}

/// Per-request metric timestamps, each recorded exactly once at its
/// defining transition. A second write to the same timestamp panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timestamps {
    pub arrival: Micros,
    enqueue: Option<Micros>,
    first_schedule: Option<Micros>,
    first_token: Option<Micros>,
    completion: Option<Micros>,
}

impl Timestamps {
    fn new(arrival: Micros) -> Self {
        Self {
            arrival,
            enqueue: None,
            first_schedule: None,
            first_token: None,
            completion: None,
        }
    }

    fn record(slot: &mut Option<Micros>, name: &str, floor: Micros, t: Micros) {
        assert!(
            slot.is_none(),
            "metric timestamp {name} recorded twice (had {:?}, new {t})",
            slot
        );
        assert!(
            t >= floor,
            "metric timestamp {name} at {t}us violates causality (floor {floor}us)"
        );
        *slot = Some(t);
    }

    pub fn enqueue(&self) -> Option<Micros> {
        self.enqueue
    }

    pub fn first_schedule(&self) -> Option<Micros> {
        self.first_schedule
    }

    pub fn first_token(&self) -> Option<Micros> {
        self.first_token
    }

    pub fn completion(&self) -> Option<Micros> {
        self.completion
    }
}

/// A single inference request moving through the simulated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    id: RequestId,
    input_tokens: Vec<TokenId>,
    expected_output: u32,
    slo: SloClass,
    tenant: String,
    session: Option<SessionId>,
    /// Recomputable scheduling priority; higher runs earlier.
    pub priority: f64,
    state: RequestState,
    assigned_instance: Option<InstanceId>,
    /// Output tokens emitted so far.
    progress: u32,
    /// Input tokens prefetched into KV so far (chunked prefill cursor).
    prefill_progress: u32,
    /// Times this request was preempted back to the wait queue.
    preemptions: u32,
    timestamps: Timestamps,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RequestId,
        arrival: Micros,
        input_tokens: Vec<TokenId>,
        expected_output: u32,
        slo: SloClass,
        tenant: impl Into<String>,
        session: Option<SessionId>,
    ) -> Self {
        assert!(
            !input_tokens.is_empty(),
            "request {id}: input token vector must be non-empty"
        );
        assert!(
            expected_output > 0,
            "request {id}: expected output must be positive"
        );
        Self {
            id,
            input_tokens,
            expected_output,
            slo,
            tenant: tenant.into(),
            session,
            priority: 0.0,
            state: RequestState::Queued,
            assigned_instance: None,
            progress: 0,
            prefill_progress: 0,
            preemptions: 0,
            timestamps: Timestamps::new(arrival),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn input_tokens(&self) -> &[TokenId] {
        &self.input_tokens
    }

    pub fn input_len(&self) -> u32 {
        self.input_tokens.len() as u32
    }

    pub fn expected_output(&self) -> u32 {
        self.expected_output
    }

    pub fn slo(&self) -> SloClass {
        self.slo
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn assigned_instance(&self) -> Option<InstanceId> {
        self.assigned_instance
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn prefill_progress(&self) -> u32 {
        self.prefill_progress
    }

    pub fn prefill_done(&self) -> bool {
        self.prefill_progress == self.input_len()
    }

    pub fn preemptions(&self) -> u32 {
        self.preemptions
    }

    pub fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }

    pub fn arrival(&self) -> Micros {
        self.timestamps.arrival
    }

    /// Set at routing time, before the request is handed to the instance.
    pub fn assign_instance(&mut self, instance: InstanceId) {
        assert!(
            self.assigned_instance.is_none(),
            "request {}: routed twice (already on instance {:?})",
            self.id,
            self.assigned_instance
        );
        self.assigned_instance = Some(instance);
    }

    pub fn record_enqueue(&mut self, t: Micros) {
        Timestamps::record(
            &mut self.timestamps.enqueue,
            "enqueue",
            self.timestamps.arrival,
            t,
        );
    }

    pub fn record_first_schedule(&mut self, t: Micros) {
        let floor = self.timestamps.enqueue.unwrap_or(self.timestamps.arrival);
        Timestamps::record(&mut self.timestamps.first_schedule, "first_schedule", floor, t);
    }

    pub fn record_first_token(&mut self, t: Micros) {
        let floor = self
            .timestamps
            .first_schedule
            .unwrap_or(self.timestamps.arrival);
        Timestamps::record(&mut self.timestamps.first_token, "first_token", floor, t);
    }

    fn record_completion(&mut self, t: Micros) {
        let floor = self
            .timestamps
            .first_token
            .unwrap_or(self.timestamps.arrival);
        Timestamps::record(&mut self.timestamps.completion, "completion", floor, t);
    }

    /// Queued -> Running. Panics on any other source state.
    pub fn mark_running(&mut self) {
        match self.state {
            RequestState::Queued => self.state = RequestState::Running,
            other => panic!(
                "request {}: illegal transition {:?} -> Running",
                self.id, other
            ),
        }
    }

    /// Running -> Completed, recording the completion timestamp.
    pub fn mark_completed(&mut self, t: Micros) {
        match self.state {
            RequestState::Running => {
                assert!(
                    self.progress == self.expected_output,
                    "request {}: completed with {}/{} output tokens",
                    self.id,
                    self.progress,
                    self.expected_output
                );
                self.state = RequestState::Completed;
                self.record_completion(t);
            }
            other => panic!(
                "request {}: illegal transition {:?} -> Completed",
                self.id, other
            ),
        }
    }

    /// Running -> Queued. The only legal back-transition; progress and
    /// prefill cursor are preserved so the request can resume.
    pub fn mark_preempted(&mut self) {
        match self.state {
            RequestState::Running => {
                self.state = RequestState::Queued;
                self.preemptions += 1;
            }
            other => panic!(
                "request {}: illegal transition {:?} -> Queued (preemption)",
                self.id, other
            ),
        }
    }

    /// Advance the chunked-prefill cursor by `tokens`.
    pub fn advance_prefill(&mut self, tokens: u32) {
        let new = self.prefill_progress + tokens;
        assert!(
            new <= self.input_len(),
            "request {}: prefill cursor {new} past input length {}",
            self.id,
            self.input_len()
        );
        self.prefill_progress = new;
    }

    /// Emit one output token during the step ending at `step_end`.
    pub fn emit_token(&mut self, step_end: Micros) {
        assert!(
            self.progress < self.expected_output,
            "request {}: emitted past expected output {}",
            self.id,
            self.expected_output
        );
        self.progress += 1;
        if self.progress == 1 {
            self.record_first_token(step_end);
        }
    }

    pub fn is_done(&self) -> bool {
        self.progress == self.expected_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> Request {
        Request::new(1, 100, vec![1, 2, 3, 4], 2, SloClass::Standard, "acme", None)
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut r = req();
        assert_eq!(r.state(), RequestState::Queued);
        r.record_enqueue(110);
        r.record_first_schedule(120);
        r.mark_running();
        r.advance_prefill(4);
        assert!(r.prefill_done());
        r.emit_token(150);
        assert_eq!(r.timestamps().first_token(), Some(150));
        r.emit_token(180);
        r.mark_completed(180);
        assert_eq!(r.state(), RequestState::Completed);
        assert_eq!(r.timestamps().completion(), Some(180));
    }

    #[test]
    fn preemption_preserves_progress() {
        let mut r = req();
        r.mark_running();
        r.advance_prefill(4);
        r.emit_token(150);
        r.mark_preempted();
        assert_eq!(r.state(), RequestState::Queued);
        assert_eq!(r.progress(), 1);
        assert_eq!(r.prefill_progress(), 4);
        assert_eq!(r.preemptions(), 1);
        // Resumes cleanly.
        r.mark_running();
        r.emit_token(200);
        r.mark_completed(200);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn cannot_complete_from_queued() {
        let mut r = req();
        r.mark_completed(200);
    }

    #[test]
    #[should_panic(expected = "illegal transition")]
    fn cannot_preempt_from_queued() {
        let mut r = req();
        r.mark_preempted();
    }

    #[test]
    #[should_panic(expected = "recorded twice")]
    fn timestamps_are_one_shot() {
        let mut r = req();
        r.record_enqueue(110);
        r.record_enqueue(111);
    }

    #[test]
    #[should_panic(expected = "violates causality")]
    fn timestamps_respect_causality() {
        let mut r = req();
        r.record_enqueue(50); // before arrival at 100
    }

    #[test]
    #[should_panic(expected = "routed twice")]
    fn single_routing_assignment() {
        let mut r = req();
        r.assign_instance(0);
        r.assign_instance(1);
    }
}
