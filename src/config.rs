//! Run configuration: YAML bundle plus CLI overrides.
//!
//! Parsing is strict (unknown fields are errors) and every numeric
//! knob is validated before any simulation object exists. Optional
//! fields stay `Option` so "unset" and "set to zero" remain different
//! statements.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use blis_cluster::{ClusterConfig, ScorerSpec};
use blis_engine::InstanceConfig;
use blis_kv::TieredKvConfig;
use blis_latency::LatencyConfig;
use blis_metrics::TraceLevel;
use blis_workload::WorkloadSpec;

/// Policy bundle: one policy per surface, all by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoliciesConfig {
    pub admission: String,
    pub routing: String,
    pub priority: String,
    pub scheduler: String,
    /// Scorer pipeline for `routing: weighted`.
    pub scorers: Option<Vec<ScorerSpec>>,
    pub token_bucket_capacity: Option<f64>,
    pub token_bucket_refill_per_sec: Option<f64>,
    pub priority_age_weight: Option<f64>,
    pub prefix_index_capacity: Option<usize>,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            admission: "always-admit".into(),
            routing: "round-robin".into(),
            priority: "constant".into(),
            scheduler: "fcfs".into(),
            scorers: None,
            token_bucket_capacity: None,
            token_bucket_refill_per_sec: None,
            priority_age_weight: None,
            prefix_index_capacity: None,
        }
    }
}

/// Preset form of the workload section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresetConfig {
    pub name: String,
    pub rate_per_sec: f64,
    pub num_requests: u64,
    #[serde(default = "default_mean_input")]
    pub mean_input_tokens: f64,
    #[serde(default = "default_mean_output")]
    pub mean_output_tokens: f64,
}

fn default_mean_input() -> f64 {
    256.0
}

fn default_mean_output() -> f64 {
    64.0
}

/// Workload section: a named preset or a full multi-client spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadConfig {
    Preset(PresetConfig),
    Spec(WorkloadSpec),
}

/// Observability knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObservabilityConfig {
    pub trace_level: TraceLevel,
    pub counterfactual_k: usize,
    /// `metric -> weight` terms of the scalar fitness; keys must name
    /// report metrics, values must be finite.
    pub fitness_weights: BTreeMap<String, f64>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            trace_level: TraceLevel::None,
            counterfactual_k: 3,
            fitness_weights: BTreeMap::new(),
        }
    }
}

/// The full run configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    pub cluster: ClusterConfig,
    pub instance: InstanceConfig,
    pub tiered_kv: Option<TieredKvConfig>,
    pub policies: PoliciesConfig,
    pub workload: WorkloadConfig,
    pub latency: LatencyConfig,
    pub observability: ObservabilityConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig {
                num_instances: 1,
                root_seed: 0,
                simulation_horizon_micros: None,
                snapshot_refresh_interval_micros: 0,
                admission_latency_micros: 0,
                routing_latency_micros: 0,
            },
            instance: InstanceConfig {
                total_kv_blocks: 4096,
                block_size_tokens: 16,
                max_running_requests: 256,
                max_scheduled_tokens: 8192,
                max_model_len: 8192,
                long_prefill_token_threshold: 0,
                preemption_ceiling: 8,
            },
            tiered_kv: None,
            policies: PoliciesConfig::default(),
            workload: WorkloadConfig::Preset(PresetConfig {
                name: "steady".into(),
                rate_per_sec: 10.0,
                num_requests: 100,
                mean_input_tokens: default_mean_input(),
                mean_output_tokens: default_mean_output(),
            }),
            latency: default_latency(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_latency() -> LatencyConfig {
    serde_yaml::from_str("blackbox:\n  alpha: [0.0, 0.0, 0.0]\n  beta: [500.0, 1.0, 10.0]\n")
        .expect("default latency config parses")
}

impl RunConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: RunConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// Cross-field validation beyond what the component constructors
    /// already enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.cluster.validate()?;
        self.instance.validate()?;
        for (key, weight) in &self.observability.fitness_weights {
            if !weight.is_finite() {
                bail!("fitness weight for {key} must be finite, got {weight}");
            }
            if !blis_metrics::METRIC_KEYS.contains(&key.as_str()) {
                bail!(
                    "unknown fitness metric: {key} (expected one of {})",
                    blis_metrics::METRIC_KEYS.join(", ")
                );
            }
        }
        if let WorkloadConfig::Spec(spec) = &self.workload {
            spec.validate()?;
        }
        Ok(())
    }
}
