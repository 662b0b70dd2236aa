//! Routing policies and their factory.
//!
//! A routing policy picks the serving instance for an admitted
//! request, given the read-only `RouterState`. Policies may keep their
//! own state (round-robin cursor, prefix index) but never mutate
//! anything shared. Ties always break toward the lowest instance
//! index so reruns pick identical winners.

use blis_core::{InstanceId, Request};
use serde::Deserialize;
use thiserror::Error;

use crate::scorer::{PrefixAffinityScorer, Scorer};
use crate::snapshot::{InstanceSnapshot, RouterState};

pub const ROUTING_POLICY_NAMES: &[&str] =
    &["round-robin", "least-loaded", "prefix-affinity", "weighted"];
pub const SCORER_NAMES: &[&str] = &[
    "queue-depth",
    "kv-utilization",
    "load-balance",
    "prefix-affinity",
];

/// Default bound on the router-side prefix index.
const DEFAULT_PREFIX_INDEX_CAPACITY: usize = 65_536;

/// What a routing policy hands back to the control plane.
#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub instance: InstanceId,
    /// Final per-instance scores, indexed by instance, for the trace.
    pub scores: Vec<f64>,
    pub priority_hint: Option<f64>,
}

pub trait RoutingPolicy: std::fmt::Debug + Send {
    fn route(&mut self, req: &Request, state: &RouterState<'_>) -> RoutingOutcome;
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown routing policy: {0} (expected one of {})", ROUTING_POLICY_NAMES.join(", "))]
    UnknownPolicy(String),
    #[error("unknown scorer: {0} (expected one of {})", SCORER_NAMES.join(", "))]
    UnknownScorer(String),
    #[error("weighted routing needs at least one scorer")]
    EmptyPipeline,
    #[error("scorer weight for {name} must be finite and non-negative, got {weight}")]
    BadWeight { name: String, weight: f64 },
    #[error("scorer pipeline entry {0:?} is not of the form name:weight")]
    MalformedSpec(String),
}

/// One `name:weight` element of a weighted pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScorerSpec {
    pub name: String,
    pub weight: f64,
}

impl std::str::FromStr for ScorerSpec {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, weight) = s
            .split_once(':')
            .ok_or_else(|| RoutingError::MalformedSpec(s.to_string()))?;
        let weight: f64 = weight
            .parse()
            .map_err(|_| RoutingError::MalformedSpec(s.to_string()))?;
        Ok(Self {
            name: name.trim().to_string(),
            weight,
        })
    }
}

/// Lowest-index argmax over per-instance scores.
fn argmax(scores: &[f64]) -> InstanceId {
    let mut best = 0usize;
    for (i, &s) in scores.iter().enumerate().skip(1) {
        if s > scores[best] {
            best = i;
        }
    }
    best as InstanceId
}

fn least_loaded_scores(snapshots: &[InstanceSnapshot]) -> Vec<f64> {
    snapshots
        .iter()
        .map(|s| 1.0 / (1.0 + s.effective_load()))
        .collect()
}

/// Cycles through instances by index, ignoring load entirely.
#[derive(Debug, Default)]
struct RoundRobin {
    next: u64,
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, _req: &Request, state: &RouterState<'_>) -> RoutingOutcome {
        let n = state.snapshots.len() as u64;
        let instance = (self.next % n) as InstanceId;
        self.next += 1;
        let mut scores = vec![0.0; n as usize];
        scores[instance as usize] = 1.0;
        RoutingOutcome {
            instance,
            scores,
            priority_hint: None,
        }
    }
}

/// Argmin of effective load.
#[derive(Debug)]
struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, _req: &Request, state: &RouterState<'_>) -> RoutingOutcome {
        let scores = least_loaded_scores(state.snapshots);
        RoutingOutcome {
            instance: argmax(&scores),
            scores,
            priority_hint: None,
        }
    }
}

/// Exact-sequence affinity: remembers which instance served each exact
/// token sequence; unseen sequences fall back to least-loaded.
#[derive(Debug)]
struct ExactPrefixAffinity {
    seen: crate::prefix_index::PrefixCacheIndex,
}

impl ExactPrefixAffinity {
    fn sequence_hash(req: &Request) -> u64 {
        let mut hasher = blake3::Hasher::new();
        for t in req.input_tokens() {
            hasher.update(&t.to_le_bytes());
        }
        u64::from_le_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
    }
}

impl RoutingPolicy for ExactPrefixAffinity {
    fn route(&mut self, req: &Request, state: &RouterState<'_>) -> RoutingOutcome {
        let key = Self::sequence_hash(req);
        let (instance, scores) = match self.seen.get(key) {
            Some(instance) if (instance as usize) < state.snapshots.len() => {
                let mut scores = vec![0.0; state.snapshots.len()];
                scores[instance as usize] = 1.0;
                (instance, scores)
            }
            _ => {
                let scores = least_loaded_scores(state.snapshots);
                (argmax(&scores), scores)
            }
        };
        self.seen.record(key, instance);
        RoutingOutcome {
            instance,
            scores,
            priority_hint: None,
        }
    }
}

/// Weighted composition of named scorers. Weights are relative; only
/// their ratios matter.
#[derive(Debug)]
struct WeightedScoring {
    scorers: Vec<(String, f64, Scorer)>,
}

impl RoutingPolicy for WeightedScoring {
    fn route(&mut self, req: &Request, state: &RouterState<'_>) -> RoutingOutcome {
        let n = state.snapshots.len();
        let mut total = vec![0.0; n];
        for (name, weight, scorer) in &self.scorers {
            let scores = scorer.score(req, state.snapshots);
            debug_assert_eq!(scores.len(), n, "scorer {name} returned wrong arity");
            for (t, s) in total.iter_mut().zip(scores) {
                *t += weight * s;
            }
        }
        let instance = argmax(&total);
        // Stateful scorers learn the decision after argmax, before the
        // outcome is returned.
        for (_, _, scorer) in self.scorers.iter_mut() {
            scorer.observe(req, instance);
        }
        RoutingOutcome {
            instance,
            scores: total,
            priority_hint: None,
        }
    }
}

fn build_scorer(
    spec: &ScorerSpec,
    block_size: u32,
    prefix_index_capacity: usize,
) -> Result<Scorer, RoutingError> {
    if !spec.weight.is_finite() || spec.weight < 0.0 {
        return Err(RoutingError::BadWeight {
            name: spec.name.clone(),
            weight: spec.weight,
        });
    }
    match spec.name.as_str() {
        "queue-depth" => Ok(Scorer::QueueDepth),
        "kv-utilization" => Ok(Scorer::KvUtilization),
        "load-balance" => Ok(Scorer::LoadBalance),
        "prefix-affinity" => Ok(Scorer::PrefixAffinity(PrefixAffinityScorer::new(
            prefix_index_capacity,
            block_size,
        ))),
        other => Err(RoutingError::UnknownScorer(other.to_string())),
    }
}

/// Build a routing policy by name. `scorers` is consulted only by the
/// `weighted` policy; `block_size` must match the instances' KV block
/// size so router-side hashes line up with cache content.
pub fn build_routing_policy(
    name: &str,
    scorers: Option<&[ScorerSpec]>,
    block_size: u32,
    prefix_index_capacity: Option<usize>,
) -> Result<Box<dyn RoutingPolicy>, RoutingError> {
    let capacity = prefix_index_capacity.unwrap_or(DEFAULT_PREFIX_INDEX_CAPACITY);
    match name {
        "round-robin" => Ok(Box::new(RoundRobin::default())),
        "least-loaded" => Ok(Box::new(LeastLoaded)),
        "prefix-affinity" => Ok(Box::new(ExactPrefixAffinity {
            seen: crate::prefix_index::PrefixCacheIndex::new(capacity),
        })),
        "weighted" => {
            let specs = scorers.unwrap_or_default();
            if specs.is_empty() {
                return Err(RoutingError::EmptyPipeline);
            }
            let mut built = Vec::with_capacity(specs.len());
            for spec in specs {
                let scorer = build_scorer(spec, block_size, capacity)?;
                built.push((spec.name.clone(), spec.weight, scorer));
            }
            Ok(Box::new(WeightedScoring { scorers: built }))
        }
        other => Err(RoutingError::UnknownPolicy(other.to_string())),
    }
}
