//! Metrics, decision trace, and the final report.
//!
//! Everything in this crate is assembly and arithmetic over values the
//! simulation already produced. Output determinism rules apply
//! throughout: aggregation iterates sorted keys, distribution
//! statistics sort their samples, and the report is a fixed-shape
//! struct so the JSON field order never varies between runs.

mod metrics;
mod report;
mod trace;

pub use metrics::{jain_fairness, DistStats, RequestMetrics};
pub use report::{PerRequestRecord, ReportInputs, SimReport, SloStats, METRIC_KEYS};
pub use trace::{DecisionTrace, RoutingCandidate, TraceLevel, TraceSummary};
