//! Observational decision trace.
//!
//! Recording is strictly passive: the trace never influences a
//! decision, it only remembers what happened so a run can be replayed
//! and audited. Retention is bounded so long runs keep flat memory;
//! the aggregate counters keep counting after the entry cap.

use blis_core::{InstanceId, Micros, RequestId};
use serde::Serialize;

/// Hard cap on retained trace entries.
const MAX_ENTRIES: usize = 10_000;

/// How much to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    None,
    Decisions,
}

impl std::str::FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(TraceLevel::None),
            "decisions" => Ok(TraceLevel::Decisions),
            other => Err(format!("unknown trace level: {other}")),
        }
    }
}

/// One scored alternative of a routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingCandidate {
    pub instance: InstanceId,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum TraceEntry {
    Admission {
        time_us: Micros,
        request: RequestId,
        admitted: bool,
        reason: String,
    },
    Routing {
        time_us: Micros,
        request: RequestId,
        chosen: InstanceId,
        /// Top-k alternatives, best first, chosen included.
        candidates: Vec<RoutingCandidate>,
    },
}

/// Decision recorder with bounded retention.
#[derive(Debug)]
pub struct DecisionTrace {
    level: TraceLevel,
    counterfactual_k: usize,
    entries: Vec<TraceEntry>,
    truncated: u64,
    admissions: u64,
    admitted: u64,
    routings: u64,
    /// Routing decisions per instance, indexed by instance id.
    per_instance: Vec<u64>,
}

impl DecisionTrace {
    pub fn new(level: TraceLevel, counterfactual_k: usize, num_instances: usize) -> Self {
        Self {
            level,
            counterfactual_k,
            entries: Vec::new(),
            truncated: 0,
            admissions: 0,
            admitted: 0,
            routings: 0,
            per_instance: vec![0; num_instances],
        }
    }

    pub fn enabled(&self) -> bool {
        self.level != TraceLevel::None
    }

    fn push(&mut self, entry: TraceEntry) {
        if self.entries.len() < MAX_ENTRIES {
            self.entries.push(entry);
        } else {
            if self.truncated == 0 {
                tracing::debug!(cap = MAX_ENTRIES, "trace entry cap reached, counting only");
            }
            self.truncated += 1;
        }
    }

    pub fn record_admission(
        &mut self,
        time: Micros,
        request: RequestId,
        admitted: bool,
        reason: &str,
    ) {
        self.admissions += 1;
        if admitted {
            self.admitted += 1;
        }
        if self.enabled() {
            self.push(TraceEntry::Admission {
                time_us: time,
                request,
                admitted,
                reason: reason.to_string(),
            });
        }
    }

    /// Record a routing decision. `scores` holds every candidate's
    /// score indexed by instance; only the top-k survive in the entry.
    pub fn record_routing(
        &mut self,
        time: Micros,
        request: RequestId,
        chosen: InstanceId,
        scores: &[f64],
    ) {
        self.routings += 1;
        if let Some(slot) = self.per_instance.get_mut(chosen as usize) {
            *slot += 1;
        }
        if !self.enabled() {
            return;
        }
        let mut candidates: Vec<RoutingCandidate> = scores
            .iter()
            .enumerate()
            .map(|(instance, &score)| RoutingCandidate {
                instance: instance as InstanceId,
                score,
            })
            .collect();
        // Best first; ties broken by instance index so entries are
        // stable across runs.
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.instance.cmp(&b.instance))
        });
        candidates.truncate(self.counterfactual_k.max(1));
        self.push(TraceEntry::Routing {
            time_us: time,
            request,
            chosen,
            candidates,
        });
    }

    /// Summarize for the report. Entries are included only when
    /// tracing was enabled.
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            admission_decisions: self.admissions,
            admitted: self.admitted,
            acceptance_ratio: if self.admissions == 0 {
                1.0
            } else {
                self.admitted as f64 / self.admissions as f64
            },
            routing_decisions: self.routings,
            routing_share_per_instance: self.per_instance.clone(),
            retained_entries: self.entries.len() as u64,
            truncated_entries: self.truncated,
        }
    }

    /// Serialize retained entries for the report's trace block.
    pub fn entries_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.entries).expect("trace entries serialize")
    }
}

/// Aggregate view of the trace, always computable.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub admission_decisions: u64,
    pub admitted: u64,
    pub acceptance_ratio: f64,
    pub routing_decisions: u64,
    pub routing_share_per_instance: Vec<u64>,
    pub retained_entries: u64,
    pub truncated_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_trace_still_counts() {
        let mut trace = DecisionTrace::new(TraceLevel::None, 3, 2);
        trace.record_admission(10, 1, true, "always");
        trace.record_admission(11, 2, false, "bucket empty");
        trace.record_routing(12, 1, 1, &[0.2, 0.8]);
        let s = trace.summary();
        assert_eq!(s.admission_decisions, 2);
        assert_eq!(s.admitted, 1);
        assert_eq!(s.routing_decisions, 1);
        assert_eq!(s.routing_share_per_instance, vec![0, 1]);
        assert_eq!(s.retained_entries, 0);
    }

    #[test]
    fn routing_candidates_are_top_k_best_first() {
        let mut trace = DecisionTrace::new(TraceLevel::Decisions, 2, 4);
        trace.record_routing(5, 9, 2, &[0.1, 0.4, 0.9, 0.4]);
        let json = trace.entries_json();
        let candidates = json[0]["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0]["instance"], 2);
        // Tie between instances 1 and 3 resolves to the lower index.
        assert_eq!(candidates[1]["instance"], 1);
    }

    #[test]
    fn retention_is_bounded() {
        let mut trace = DecisionTrace::new(TraceLevel::Decisions, 1, 1);
        for i in 0..(MAX_ENTRIES as u64 + 50) {
            trace.record_admission(i, i, true, "always");
        }
        let s = trace.summary();
        assert_eq!(s.retained_entries, MAX_ENTRIES as u64);
        assert_eq!(s.truncated_entries, 50);
        assert_eq!(s.admission_decisions, MAX_ENTRIES as u64 + 50);
    }

    #[test]
    fn acceptance_ratio_of_empty_trace_is_one() {
        let trace = DecisionTrace::new(TraceLevel::None, 1, 1);
        assert_eq!(trace.summary().acceptance_ratio, 1.0);
    }
}
