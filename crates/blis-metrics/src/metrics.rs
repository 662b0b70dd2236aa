//! Per-request metrics and distribution statistics.

use blis_core::{micros_to_ms, Request};
use serde::Serialize;

/// Latency metrics for one completed request, in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetrics {
    pub id: u64,
    pub arrival_ms: f64,
    pub prefill_tokens: u32,
    pub decode_tokens: u32,
    pub ttft_ms: f64,
    /// Mean inter-token latency; 0 for single-token outputs.
    pub itl_ms: f64,
    pub e2e_ms: f64,
    pub scheduling_delay_ms: f64,
    pub instance: u32,
    pub slo: String,
    pub tenant: String,
}

impl RequestMetrics {
    /// Extract metrics from a completed request. Panics if called on a
    /// request without completion timestamps; the caller guarantees
    /// completion.
    pub fn from_request(req: &Request) -> Self {
        let ts = req.timestamps();
        let arrival = ts.arrival;
        let first_token = ts
            .first_token()
            .unwrap_or_else(|| panic!("request {} completed without first token", req.id()));
        let completion = ts
            .completion()
            .unwrap_or_else(|| panic!("request {} completed without completion time", req.id()));
        let first_schedule = ts
            .first_schedule()
            .unwrap_or_else(|| panic!("request {} completed without being scheduled", req.id()));
        let outputs = req.expected_output();
        // Mean gap between consecutive tokens. Single-token outputs
        // have no gaps and report zero.
        let itl = if outputs > 1 {
            (completion - first_token) as f64 / (outputs - 1) as f64
        } else {
            0.0
        };
        Self {
            id: req.id(),
            arrival_ms: micros_to_ms(arrival),
            prefill_tokens: req.input_len(),
            decode_tokens: outputs,
            ttft_ms: micros_to_ms(first_token - arrival),
            itl_ms: itl / 1_000.0,
            e2e_ms: micros_to_ms(completion - arrival),
            scheduling_delay_ms: micros_to_ms(first_schedule - arrival),
            instance: req.assigned_instance().unwrap_or(0),
            slo: req.slo().as_str().to_string(),
            tenant: req.tenant().to_string(),
        }
    }

}

/// Summary statistics over one latency distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DistStats {
    pub mean: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DistStats {
    /// Compute stats from unsorted samples. Empty input yields zeros.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        Self {
            mean,
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Nearest-rank percentile over pre-sorted samples.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Jain fairness index over per-group throughput: 1.0 is perfectly
/// fair, 1/n is maximally unfair. Groups must arrive pre-sorted by key
/// so the float accumulation order is deterministic.
pub fn jain_fairness(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let sum: f64 = values.iter().sum();
    let squares: f64 = values.iter().map(|v| v * v).sum();
    if squares == 0.0 {
        return 1.0;
    }
    (sum * sum) / (values.len() as f64 * squares)
}
