//! Admission policies: the first gate a request meets.
//!
//! Rejection is a counted outcome with a reason string, never an
//! error. The registry is closed; factories refuse unknown names at
//! construction.

use blis_core::{Micros, Request};
use thiserror::Error;

use crate::snapshot::RouterState;

pub const ADMISSION_POLICY_NAMES: &[&str] = &["always-admit", "token-bucket", "reject-all"];

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub admit: bool,
    pub reason: String,
}

impl AdmissionDecision {
    fn admit(reason: &str) -> Self {
        Self {
            admit: true,
            reason: reason.to_string(),
        }
    }

    fn reject(reason: &str) -> Self {
        Self {
            admit: false,
            reason: reason.to_string(),
        }
    }
}

/// Cluster-level gate consulted once per arrival.
pub trait AdmissionPolicy: std::fmt::Debug + Send {
    fn admit(&mut self, req: &Request, state: &RouterState<'_>) -> AdmissionDecision;
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("unknown admission policy: {0} (expected one of {})", ADMISSION_POLICY_NAMES.join(", "))]
    UnknownPolicy(String),
    #[error("token bucket capacity must be positive and finite, got {0}")]
    BadCapacity(f64),
    #[error("token bucket refill rate must be non-negative and finite, got {0}")]
    BadRefill(f64),
}

#[derive(Debug)]
struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _req: &Request, _state: &RouterState<'_>) -> AdmissionDecision {
        AdmissionDecision::admit("always-admit")
    }
}

/// Pathological all-reject policy, kept for anomaly tests.
#[derive(Debug)]
struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn admit(&mut self, _req: &Request, _state: &RouterState<'_>) -> AdmissionDecision {
        AdmissionDecision::reject("reject-all")
    }
}

/// Classic token bucket: one token per request, refilled continuously
/// on the logical clock.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Micros,
}

impl TokenBucket {
    fn refill(&mut self, now: Micros) {
        let elapsed_s = now.saturating_sub(self.last_refill) as f64 / 1_000_000.0;
        self.tokens = (self.tokens + elapsed_s * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, _req: &Request, state: &RouterState<'_>) -> AdmissionDecision {
        self.refill(state.now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            AdmissionDecision::admit("token-bucket")
        } else {
            AdmissionDecision::reject("token bucket empty")
        }
    }
}

/// Build an admission policy by name. Token-bucket parameters are
/// required only when that policy is selected.
pub fn build_admission_policy(
    name: &str,
    bucket_capacity: Option<f64>,
    bucket_refill_per_sec: Option<f64>,
) -> Result<Box<dyn AdmissionPolicy>, AdmissionError> {
    match name {
        "always-admit" => Ok(Box::new(AlwaysAdmit)),
        "reject-all" => Ok(Box::new(RejectAll)),
        "token-bucket" => {
            let capacity = bucket_capacity.unwrap_or(100.0);
            let refill = bucket_refill_per_sec.unwrap_or(100.0);
            if !capacity.is_finite() || capacity <= 0.0 {
                return Err(AdmissionError::BadCapacity(capacity));
            }
            if !refill.is_finite() || refill < 0.0 {
                return Err(AdmissionError::BadRefill(refill));
            }
            Ok(Box::new(TokenBucket {
                capacity,
                refill_per_sec: refill,
                tokens: capacity,
                last_refill: 0,
            }))
        }
        other => Err(AdmissionError::UnknownPolicy(other.to_string())),
    }
}
