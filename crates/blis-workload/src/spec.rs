//! Declarative workload description, deserialized from the run config.
//!
//! Strict parsing: unknown fields fail, and `validate` rejects every
//! zero/negative/NaN parameter before generation starts.

use blis_core::SloClass;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload needs at least one request")]
    NoRequests,
    #[error("workload needs at least one client")]
    NoClients,
    #[error("workload rate must be positive and finite, got {0}")]
    BadRate(f64),
    #[error("client {client}: rate fraction must be positive and finite, got {value}")]
    BadFraction { client: String, value: f64 },
    #[error("client {client}: {what} must be positive and finite, got {value}")]
    BadParameter {
        client: String,
        what: &'static str,
        value: f64,
    },
    #[error("client {client}: multi-turn sessions need at least one turn")]
    NoTurns { client: String },
    #[error("prefix group {group}: shared prefix needs at least one token")]
    EmptyPrefix { group: String },
    #[error("unknown workload preset: {0} (expected one of {1})")]
    UnknownPreset(String, String),
}

/// Inter-arrival process for one client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "process", rename_all = "lowercase", deny_unknown_fields)]
pub enum ArrivalSpec {
    /// Exponential gaps.
    Poisson,
    /// Gamma-distributed gaps; `shape < 1` is burstier than Poisson.
    Gamma { shape: f64 },
    /// Weibull-distributed gaps; `shape < 1` gives heavy tails.
    Weibull { shape: f64 },
}

impl ArrivalSpec {
    fn validate(&self, client: &str) -> Result<(), WorkloadError> {
        let shape = match self {
            ArrivalSpec::Poisson => return Ok(()),
            ArrivalSpec::Gamma { shape } | ArrivalSpec::Weibull { shape } => *shape,
        };
        if !shape.is_finite() || shape <= 0.0 {
            return Err(WorkloadError::BadParameter {
                client: client.to_string(),
                what: "arrival shape",
                value: shape,
            });
        }
        Ok(())
    }
}

/// Token-length distribution.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "dist", rename_all = "kebab-case", deny_unknown_fields)]
pub enum LengthSpec {
    /// Gaussian, clamped to at least one token.
    Gaussian { mean: f64, std: f64 },
    /// Log-normal body with a Pareto tail, for heavy-tailed outputs.
    ParetoLognormal {
        mu: f64,
        sigma: f64,
        alpha: f64,
        /// Probability a sample comes from the Pareto tail.
        tail_weight: f64,
    },
}

impl LengthSpec {
    fn validate(&self, client: &str) -> Result<(), WorkloadError> {
        let bad = |what: &'static str, value: f64| WorkloadError::BadParameter {
            client: client.to_string(),
            what,
            value,
        };
        match self {
            LengthSpec::Gaussian { mean, std } => {
                if !mean.is_finite() || *mean < 1.0 {
                    return Err(bad("gaussian mean", *mean));
                }
                if !std.is_finite() || *std < 0.0 {
                    return Err(bad("gaussian std", *std));
                }
            }
            LengthSpec::ParetoLognormal {
                mu,
                sigma,
                alpha,
                tail_weight,
            } => {
                if !mu.is_finite() {
                    return Err(bad("lognormal mu", *mu));
                }
                if !sigma.is_finite() || *sigma <= 0.0 {
                    return Err(bad("lognormal sigma", *sigma));
                }
                if !alpha.is_finite() || *alpha <= 0.0 {
                    return Err(bad("pareto alpha", *alpha));
                }
                if !tail_weight.is_finite() || !(0.0..=1.0).contains(tail_weight) {
                    return Err(bad("tail weight", *tail_weight));
                }
            }
        }
        Ok(())
    }
}

/// Shared token prefix across every request of a group.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefixGroupSpec {
    pub id: String,
    pub tokens: u32,
}

/// Multi-turn conversation structure with context accumulation: each
/// turn's input is the whole previous conversation plus new user
/// tokens, so later turns share growing prefixes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiTurnSpec {
    pub turns: u32,
    /// Mean think time between turns, sampled exponentially.
    pub think_time_micros: u64,
}

/// One traffic source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSpec {
    pub name: String,
    /// Relative share of the workload's total rate.
    pub rate_fraction: f64,
    pub arrival: ArrivalSpec,
    pub input_tokens: LengthSpec,
    pub output_tokens: LengthSpec,
    #[serde(default = "default_slo")]
    pub slo: SloClass,
    /// Defaults to the client name.
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub prefix_group: Option<PrefixGroupSpec>,
    #[serde(default)]
    pub multi_turn: Option<MultiTurnSpec>,
}

fn default_slo() -> SloClass {
    SloClass::Standard
}

/// The whole workload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadSpec {
    pub num_requests: u64,
    /// Total arrival rate across all clients, requests per second.
    pub rate_per_sec: f64,
    pub clients: Vec<ClientSpec>,
}

impl WorkloadSpec {
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.num_requests == 0 {
            return Err(WorkloadError::NoRequests);
        }
        if self.clients.is_empty() {
            return Err(WorkloadError::NoClients);
        }
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(WorkloadError::BadRate(self.rate_per_sec));
        }
        for client in &self.clients {
            if !client.rate_fraction.is_finite() || client.rate_fraction <= 0.0 {
                return Err(WorkloadError::BadFraction {
                    client: client.name.clone(),
                    value: client.rate_fraction,
                });
            }
            client.arrival.validate(&client.name)?;
            client.input_tokens.validate(&client.name)?;
            client.output_tokens.validate(&client.name)?;
            if let Some(mt) = &client.multi_turn {
                if mt.turns == 0 {
                    return Err(WorkloadError::NoTurns {
                        client: client.name.clone(),
                    });
                }
            }
            if let Some(group) = &client.prefix_group {
                if group.tokens == 0 {
                    return Err(WorkloadError::EmptyPrefix {
                        group: group.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
