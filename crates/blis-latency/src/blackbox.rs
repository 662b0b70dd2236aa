//! Regression-fitted latency model.
//!
//! Step time and queueing delay are linear in the batch shape:
//!
//! ```text
//! step     = beta0 + beta1 * miss_tokens + beta2 * decode_seqs
//! queueing = alpha0 + alpha1 * input_len + alpha2 * expected_output
//! ```
//!
//! Coefficients come either inline or from a trained table keyed by
//! (model, hardware, tensor parallelism). Per-event overheads are
//! already absorbed into the fitted terms, so the three overhead
//! methods report zero.

use blis_core::Micros;
use serde::Deserialize;

use crate::{require_finite, to_micros, BatchProfile, LatencyError, LatencyModel};

/// One fitted coefficient pair.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlackboxCoefficients {
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
}

/// Lookup key into a trained coefficient table.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoefficientKey {
    pub model: String,
    pub hardware: String,
    pub tensor_parallel: u32,
}

/// Trained coefficients for several (model, hardware, tp) combinations.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoefficientTable {
    pub entries: Vec<CoefficientEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoefficientEntry {
    pub model: String,
    pub hardware: String,
    pub tensor_parallel: u32,
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
}

impl CoefficientTable {
    pub fn find(&self, key: &CoefficientKey) -> Option<BlackboxCoefficients> {
        self.entries
            .iter()
            .find(|e| {
                e.model == key.model
                    && e.hardware == key.hardware
                    && e.tensor_parallel == key.tensor_parallel
            })
            .map(|e| BlackboxCoefficients {
                alpha: e.alpha,
                beta: e.beta,
            })
    }
}

/// Blackbox section of the run config. Either the inline coefficients
/// or a table plus key must be present.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlackboxConfig {
    #[serde(default)]
    pub alpha: Option<[f64; 3]>,
    #[serde(default)]
    pub beta: Option<[f64; 3]>,
    #[serde(default)]
    pub table: Option<CoefficientTable>,
    #[serde(default)]
    pub key: Option<CoefficientKey>,
}

#[derive(Debug, Clone)]
pub struct BlackboxModel {
    alpha: [f64; 3],
    beta: [f64; 3],
}

impl BlackboxModel {
    pub fn new(coefficients: BlackboxCoefficients) -> Result<Self, LatencyError> {
        let names = ["alpha0", "alpha1", "alpha2"];
        for (name, value) in names.into_iter().zip(coefficients.alpha) {
            require_finite(name, value)?;
        }
        let names = ["beta0", "beta1", "beta2"];
        for (name, value) in names.into_iter().zip(coefficients.beta) {
            require_finite(name, value)?;
        }
        Ok(Self {
            alpha: coefficients.alpha,
            beta: coefficients.beta,
        })
    }

    pub fn from_config(cfg: &BlackboxConfig) -> Result<Self, LatencyError> {
        let coefficients = match (&cfg.alpha, &cfg.beta, &cfg.table, &cfg.key) {
            (Some(alpha), Some(beta), None, None) => BlackboxCoefficients {
                alpha: *alpha,
                beta: *beta,
            },
            (None, None, Some(table), Some(key)) => {
                table
                    .find(key)
                    .ok_or_else(|| LatencyError::NoCoefficients {
                        model: key.model.clone(),
                        hardware: key.hardware.clone(),
                        tensor_parallel: key.tensor_parallel,
                    })?
            }
            _ => return Err(LatencyError::IncompleteBlackbox),
        };
        Self::new(coefficients)
    }
}

impl LatencyModel for BlackboxModel {
    fn step_time(&self, batch: &BatchProfile) -> Micros {
        let [b0, b1, b2] = self.beta;
        to_micros(b0 + b1 * batch.miss_tokens as f64 + b2 * batch.decode_seqs as f64)
    }

    fn queueing_time(&self, input_len: u32, expected_output: u32) -> Micros {
        let [a0, a1, a2] = self.alpha;
        to_micros(a0 + a1 * input_len as f64 + a2 * expected_output as f64)
    }

    fn output_token_time(&self) -> Micros {
        0
    }

    fn scheduling_time(&self) -> Micros {
        0
    }

    fn preemption_time(&self) -> Micros {
        0
    }
}
