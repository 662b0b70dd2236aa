//! The final report: the one JSON object a run prints on stdout.
//!
//! The shape is a fixed struct, never a free-form map, so field order
//! and therefore output bytes are identical across reruns of the same
//! seed and config. Optional blocks (per-SLO, per-request, trace) are
//! omitted entirely rather than emitted empty.

use std::collections::BTreeMap;

use blis_core::{micros_to_secs, Micros};
use serde::Serialize;

use crate::metrics::{jain_fairness, DistStats, RequestMetrics};
use crate::trace::TraceSummary;

/// Per-request record in the optional `requests` array.
pub type PerRequestRecord = RequestMetrics;

/// Metric names usable as fitness-weight keys.
pub const METRIC_KEYS: &[&str] = &[
    "ttft_mean",
    "ttft_p90",
    "ttft_p95",
    "ttft_p99",
    "itl_mean",
    "itl_p90",
    "itl_p95",
    "itl_p99",
    "e2e_mean",
    "e2e_p90",
    "e2e_p95",
    "e2e_p99",
    "scheduling_delay_mean",
    "scheduling_delay_p99",
    "tokens_per_sec",
    "responses_per_sec",
    "kv_cache_hit_rate",
];

/// Per-SLO-class latency aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct SloStats {
    pub count: u64,
    pub ttft_mean_ms: f64,
    pub ttft_p99_ms: f64,
    pub e2e_mean_ms: f64,
    pub e2e_p99_ms: f64,
}

/// Everything the report needs, gathered by the cluster at end of run.
#[derive(Debug)]
pub struct ReportInputs<'a> {
    pub completed: &'a [RequestMetrics],
    pub injected: u64,
    pub rejected: u64,
    pub dropped_unservable: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub preemptions: u64,
    pub kv_hit_rate: f64,
    pub kv_offloaded_blocks: u64,
    pub kv_reloaded_blocks: u64,
    pub kv_transfer_micros: u64,
    /// Logical time the simulation ended at.
    pub duration: Micros,
    pub trace_summary: Option<TraceSummary>,
    pub trace_decisions: Option<serde_json::Value>,
    pub include_per_request: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceBlock {
    pub summary: TraceSummary,
    pub decisions: serde_json::Value,
}

/// The stdout JSON object.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub completed_requests: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub injected_requests: u64,
    pub rejected_requests: u64,
    pub dropped_unservable: u64,
    pub preemptions: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub kv_cache_hit_rate: f64,
    pub kv_offloaded_blocks: u64,
    pub kv_reloaded_blocks: u64,
    pub kv_transfer_micros: u64,
    pub vllm_estimated_duration_s: f64,
    pub tokens_per_sec: f64,
    pub responses_per_sec: f64,

    pub ttft_mean: f64,
    pub ttft_p90: f64,
    pub ttft_p95: f64,
    pub ttft_p99: f64,
    pub itl_mean: f64,
    pub itl_p90: f64,
    pub itl_p95: f64,
    pub itl_p99: f64,
    pub e2e_mean: f64,
    pub e2e_p90: f64,
    pub e2e_p95: f64,
    pub e2e_p99: f64,
    pub scheduling_delay_mean: f64,
    pub scheduling_delay_p90: f64,
    pub scheduling_delay_p95: f64,
    pub scheduling_delay_p99: f64,

    /// Weighted scalar over report metrics, when fitness weights were
    /// configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slo_classes: Option<BTreeMap<String, SloStats>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_fairness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<Vec<PerRequestRecord>>,
}

impl SimReport {
    pub fn build(inputs: ReportInputs<'_>) -> Self {
        let completed = inputs.completed;
        let collect = |f: fn(&RequestMetrics) -> f64| -> Vec<f64> {
            completed.iter().map(f).collect()
        };
        let ttft = DistStats::from_samples(&collect(|m| m.ttft_ms));
        // Single-token outputs have no inter-token gaps and are
        // excluded rather than recorded as zero.
        let itl_samples: Vec<f64> = completed
            .iter()
            .filter(|m| m.decode_tokens > 1)
            .map(|m| m.itl_ms)
            .collect();
        let itl = DistStats::from_samples(&itl_samples);
        let e2e = DistStats::from_samples(&collect(|m| m.e2e_ms));
        let sched = DistStats::from_samples(&collect(|m| m.scheduling_delay_ms));

        let total_input_tokens: u64 = completed.iter().map(|m| m.prefill_tokens as u64).sum();
        let total_output_tokens: u64 = completed.iter().map(|m| m.decode_tokens as u64).sum();
        let duration_s = micros_to_secs(inputs.duration);
        let (tokens_per_sec, responses_per_sec) = if duration_s > 0.0 {
            (
                total_output_tokens as f64 / duration_s,
                completed.len() as f64 / duration_s,
            )
        } else {
            (0.0, 0.0)
        };

        Self {
            completed_requests: completed.len() as u64,
            still_queued: inputs.still_queued,
            still_running: inputs.still_running,
            injected_requests: inputs.injected,
            rejected_requests: inputs.rejected,
            dropped_unservable: inputs.dropped_unservable,
            preemptions: inputs.preemptions,
            total_input_tokens,
            total_output_tokens,
            kv_cache_hit_rate: inputs.kv_hit_rate,
            kv_offloaded_blocks: inputs.kv_offloaded_blocks,
            kv_reloaded_blocks: inputs.kv_reloaded_blocks,
            kv_transfer_micros: inputs.kv_transfer_micros,
            vllm_estimated_duration_s: duration_s,
            tokens_per_sec,
            responses_per_sec,
            ttft_mean: ttft.mean,
            ttft_p90: ttft.p90,
            ttft_p95: ttft.p95,
            ttft_p99: ttft.p99,
            itl_mean: itl.mean,
            itl_p90: itl.p90,
            itl_p95: itl.p95,
            itl_p99: itl.p99,
            e2e_mean: e2e.mean,
            e2e_p90: e2e.p90,
            e2e_p95: e2e.p95,
            e2e_p99: e2e.p99,
            scheduling_delay_mean: sched.mean,
            scheduling_delay_p90: sched.p90,
            scheduling_delay_p95: sched.p95,
            scheduling_delay_p99: sched.p99,
            fitness: None,
            slo_classes: slo_breakdown(completed),
            tenant_fairness: tenant_fairness(completed),
            trace: match (inputs.trace_summary, inputs.trace_decisions) {
                (Some(summary), Some(decisions)) => Some(TraceBlock { summary, decisions }),
                _ => None,
            },
            requests: inputs.include_per_request.then(|| completed.to_vec()),
        }
    }

    /// Check request conservation before printing; a violation here is
    /// a simulator bug, not a user error.
    pub fn assert_conservation(&self) {
        assert_eq!(
            self.injected_requests,
            self.completed_requests
                + self.still_queued
                + self.still_running
                + self.dropped_unservable,
            "request conservation violated: injected {} != completed {} + queued {} + running {} + dropped {}",
            self.injected_requests,
            self.completed_requests,
            self.still_queued,
            self.still_running,
            self.dropped_unservable
        );
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("report serializes")
    }

    /// Look up a metric by the names accepted in fitness weights.
    /// Accepted keys are listed in [`METRIC_KEYS`].
    pub fn metric(&self, key: &str) -> Option<f64> {
        Some(match key {
            "ttft_mean" => self.ttft_mean,
            "ttft_p90" => self.ttft_p90,
            "ttft_p95" => self.ttft_p95,
            "ttft_p99" => self.ttft_p99,
            "itl_mean" => self.itl_mean,
            "itl_p90" => self.itl_p90,
            "itl_p95" => self.itl_p95,
            "itl_p99" => self.itl_p99,
            "e2e_mean" => self.e2e_mean,
            "e2e_p90" => self.e2e_p90,
            "e2e_p95" => self.e2e_p95,
            "e2e_p99" => self.e2e_p99,
            "scheduling_delay_mean" => self.scheduling_delay_mean,
            "scheduling_delay_p99" => self.scheduling_delay_p99,
            "tokens_per_sec" => self.tokens_per_sec,
            "responses_per_sec" => self.responses_per_sec,
            "kv_cache_hit_rate" => self.kv_cache_hit_rate,
            _ => return None,
        })
    }
}

/// Per-class stats, present only when at least two classes completed.
fn slo_breakdown(completed: &[RequestMetrics]) -> Option<BTreeMap<String, SloStats>> {
    let mut by_class: BTreeMap<String, Vec<&RequestMetrics>> = BTreeMap::new();
    for m in completed {
        by_class.entry(m.slo.clone()).or_default().push(m);
    }
    if by_class.len() < 2 {
        return None;
    }
    let stats = by_class
        .into_iter()
        .map(|(class, ms)| {
            let ttft: Vec<f64> = ms.iter().map(|m| m.ttft_ms).collect();
            let e2e: Vec<f64> = ms.iter().map(|m| m.e2e_ms).collect();
            let t = DistStats::from_samples(&ttft);
            let e = DistStats::from_samples(&e2e);
            (
                class,
                SloStats {
                    count: ms.len() as u64,
                    ttft_mean_ms: t.mean,
                    ttft_p99_ms: t.p99,
                    e2e_mean_ms: e.mean,
                    e2e_p99_ms: e.p99,
                },
            )
        })
        .collect();
    Some(stats)
}

/// Jain fairness over per-tenant output tokens, when multi-tenant.
fn tenant_fairness(completed: &[RequestMetrics]) -> Option<f64> {
    let mut by_tenant: BTreeMap<&str, f64> = BTreeMap::new();
    for m in completed {
        *by_tenant.entry(m.tenant.as_str()).or_default() += m.decode_tokens as f64;
    }
    if by_tenant.len() < 2 {
        return None;
    }
    // BTreeMap iteration is key-sorted, keeping the accumulation
    // order deterministic.
    let values: Vec<f64> = by_tenant.into_values().collect();
    Some(jain_fairness(&values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(id: u64, slo: &str, tenant: &str, ttft: f64, outputs: u32) -> RequestMetrics {
        RequestMetrics {
            id,
            arrival_ms: 0.0,
            prefill_tokens: 8,
            decode_tokens: outputs,
            ttft_ms: ttft,
            itl_ms: 0.1,
            e2e_ms: ttft + 1.0,
            scheduling_delay_ms: 0.05,
            instance: 0,
            slo: slo.to_string(),
            tenant: tenant.to_string(),
        }
    }

    fn inputs(completed: &[RequestMetrics]) -> ReportInputs<'_> {
        ReportInputs {
            completed,
            injected: completed.len() as u64,
            rejected: 0,
            dropped_unservable: 0,
            still_queued: 0,
            still_running: 0,
            preemptions: 0,
            kv_hit_rate: 0.0,
            kv_offloaded_blocks: 0,
            kv_reloaded_blocks: 0,
            kv_transfer_micros: 0,
            duration: 1_000_000,
            trace_summary: None,
            trace_decisions: None,
            include_per_request: false,
        }
    }

    #[test]
    fn throughput_arithmetic() {
        let completed = vec![
            metric(1, "standard", "a", 1.0, 10),
            metric(2, "standard", "a", 2.0, 10),
        ];
        let report = SimReport::build(inputs(&completed));
        assert_eq!(report.total_output_tokens, 20);
        assert_eq!(report.tokens_per_sec, 20.0);
        assert_eq!(report.responses_per_sec, 2.0);
        report.assert_conservation();
    }

    #[test]
    fn single_class_omits_slo_block() {
        let completed = vec![metric(1, "standard", "a", 1.0, 4)];
        let report = SimReport::build(inputs(&completed));
        assert!(report.slo_classes.is_none());
        assert!(report.tenant_fairness.is_none());
    }

    #[test]
    fn two_classes_emit_slo_block() {
        let completed = vec![
            metric(1, "critical", "a", 1.0, 4),
            metric(2, "batch", "b", 8.0, 4),
        ];
        let report = SimReport::build(inputs(&completed));
        let slo = report.slo_classes.unwrap();
        assert_eq!(slo.len(), 2);
        assert_eq!(slo["critical"].count, 1);
        assert_eq!(slo["critical"].ttft_mean_ms, 1.0);
        // Equal share across two tenants: perfectly fair.
        assert_eq!(report.tenant_fairness, Some(1.0));
    }

    #[test]
    fn single_token_outputs_excluded_from_itl() {
        let mut one_token = metric(1, "standard", "a", 1.0, 1);
        one_token.itl_ms = 0.0;
        let normal = metric(2, "standard", "a", 1.0, 4);
        let report = SimReport::build(inputs(&[one_token, normal]));
        assert_eq!(report.itl_mean, 0.1);
    }

    #[test]
    fn json_field_order_is_stable() {
        let completed = vec![metric(1, "standard", "a", 1.0, 4)];
        let a = SimReport::build(inputs(&completed)).to_json();
        let b = SimReport::build(inputs(&completed)).to_json();
        assert_eq!(a, b);
        assert!(a.find("completed_requests").unwrap() < a.find("ttft_mean").unwrap());
    }

    #[test]
    #[should_panic(expected = "request conservation violated")]
    fn conservation_check_fires() {
        let completed = vec![metric(1, "standard", "a", 1.0, 4)];
        let mut bad = inputs(&completed);
        bad.injected = 5;
        SimReport::build(bad).assert_conservation();
    }
}
