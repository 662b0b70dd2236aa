//! Step-latency estimation.
//!
//! The simulator never executes a model; it asks a [`LatencyModel`] how
//! long a batch step would take. Two interchangeable variants:
//!
//! - [`BlackboxModel`]: linear regression fitted against measured
//!   serving traces.
//! - [`RooflineModel`]: analytical compute/bandwidth bound derived from
//!   model shape and hardware peaks.
//!
//! Both are selected by [`build_latency_model`] from a validated
//! config. Construction is the only place that can fail; estimation
//! itself is total.

mod blackbox;
mod roofline;

pub use blackbox::{
    BlackboxCoefficients, BlackboxModel, CoefficientEntry, CoefficientKey, CoefficientTable,
};
pub use roofline::{HardwareSpec, MfuPoint, MfuTable, ModelSpec, RooflineModel};

use std::sync::Arc;

use blis_core::Micros;
use serde::Deserialize;
use thiserror::Error;

/// Shape of one batch step, as seen by the latency model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProfile {
    /// Cache-miss prefill tokens whose KV must be computed this step.
    pub miss_tokens: u64,
    /// Sequences in decode phase (one new token each).
    pub decode_seqs: u32,
    /// Sequences doing prefill work this step.
    pub prefill_seqs: u32,
    /// Total context tokens behind the decoding sequences (KV read volume).
    pub context_tokens: u64,
}

impl BatchProfile {
    pub fn is_empty(&self) -> bool {
        self.miss_tokens == 0 && self.decode_seqs == 0
    }

    pub fn is_mixed(&self) -> bool {
        self.prefill_seqs > 0 && self.decode_seqs > 0
    }
}

/// Latency oracle for one instance's steps.
pub trait LatencyModel: Send + Sync {
    /// Wall time of executing one batch step.
    fn step_time(&self, batch: &BatchProfile) -> Micros;

    /// Estimated queueing/dispatch delay for a request of this shape.
    fn queueing_time(&self, input_len: u32, expected_output: u32) -> Micros;

    /// Per-output-token postprocessing overhead.
    fn output_token_time(&self) -> Micros;

    /// Fixed scheduler bookkeeping cost per batch formation.
    fn scheduling_time(&self) -> Micros;

    /// Cost of preempting one running request.
    fn preemption_time(&self) -> Micros;
}

/// Latency model selection, deserialized from the run config as
/// `latency: { blackbox: ... }` or `latency: { roofline: ... }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyConfig {
    Blackbox(blackbox::BlackboxConfig),
    Roofline(roofline::RooflineConfig),
}

#[derive(Debug, Error)]
pub enum LatencyError {
    #[error("latency coefficient {name} is not finite: {value}")]
    NonFiniteCoefficient { name: &'static str, value: f64 },
    #[error("blackbox config needs either inline alpha/beta or table+key")]
    IncompleteBlackbox,
    #[error("no trained coefficients for model={model} hardware={hardware} tp={tensor_parallel}")]
    NoCoefficients {
        model: String,
        hardware: String,
        tensor_parallel: u32,
    },
    #[error("roofline {name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("tensor parallel degree must be at least 1")]
    BadTensorParallel,
    #[error("tp efficiency exponent {0} outside (0, 1]")]
    BadTpExponent(f64),
    #[error("mfu value {0} outside (0, 1]")]
    BadMfu(f64),
}

/// Construct the configured latency model.
pub fn build_latency_model(cfg: &LatencyConfig) -> Result<Arc<dyn LatencyModel>, LatencyError> {
    match cfg {
        LatencyConfig::Blackbox(bb) => Ok(Arc::new(BlackboxModel::from_config(bb)?)),
        LatencyConfig::Roofline(rl) => Ok(Arc::new(RooflineModel::from_config(rl)?)),
    }
}

pub(crate) fn require_finite(name: &'static str, value: f64) -> Result<f64, LatencyError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(LatencyError::NonFiniteCoefficient { name, value })
    }
}

pub(crate) fn require_positive(name: &'static str, value: f64) -> Result<f64, LatencyError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(LatencyError::NonPositive { name, value })
    }
}

/// Round a non-negative estimate to integer microseconds.
pub(crate) fn to_micros(value: f64) -> Micros {
    value.max(0.0).round() as Micros
}
