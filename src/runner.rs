//! Builds a cluster out of a validated config and runs it to the end.

use anyhow::Context;

use blis_cluster::{
    build_admission_policy, build_routing_policy, ClusterSim, RunOutput,
};
use blis_core::RngPartition;
use blis_engine::{build_priority_policy, build_scheduler_policy, InstanceSim};
use blis_kv::{KvCache, KvStore, TieredKvCache};
use blis_latency::build_latency_model;
use blis_metrics::DecisionTrace;
use blis_workload::{build_preset, generate};

use crate::config::{RunConfig, WorkloadConfig};

/// Run one simulation from config to finished report.
pub fn run(cfg: &RunConfig, include_per_request: bool) -> anyhow::Result<RunOutput> {
    cfg.validate()?;
    let latency = build_latency_model(&cfg.latency).context("building latency model")?;
    let rng = RngPartition::new(cfg.cluster.root_seed);

    let workload_spec = match &cfg.workload {
        WorkloadConfig::Preset(p) => build_preset(
            &p.name,
            p.rate_per_sec,
            p.num_requests,
            p.mean_input_tokens,
            p.mean_output_tokens,
        )
        .context("expanding workload preset")?,
        WorkloadConfig::Spec(spec) => spec.clone(),
    };
    let requests = generate(&workload_spec, &rng).context("generating workload")?;
    tracing::info!(
        requests = requests.len(),
        instances = cfg.cluster.num_instances,
        seed = cfg.cluster.root_seed,
        "starting simulation"
    );
    // Pathological policies are legal configuration (they exist for
    // anomaly experiments); flag them rather than special-casing any
    // combination of them.
    for name in [
        &cfg.policies.admission,
        &cfg.policies.priority,
        &cfg.policies.scheduler,
    ] {
        if matches!(name.as_str(), "reject-all" | "inverted-slo" | "reverse-priority") {
            tracing::warn!(policy = %name, "pathological policy configured");
        }
    }

    let mut instances = Vec::with_capacity(cfg.cluster.num_instances as usize);
    for i in 0..cfg.cluster.num_instances {
        let kv: Box<dyn KvStore> = match &cfg.tiered_kv {
            Some(tiered) => Box::new(
                TieredKvCache::new(
                    cfg.instance.total_kv_blocks,
                    cfg.instance.block_size_tokens,
                    tiered.clone(),
                )
                .context("building tiered kv cache")?,
            ),
            None => Box::new(KvCache::new(
                cfg.instance.total_kv_blocks,
                cfg.instance.block_size_tokens,
            )),
        };
        let scheduler = build_scheduler_policy(&cfg.policies.scheduler)?;
        let priority =
            build_priority_policy(&cfg.policies.priority, cfg.policies.priority_age_weight)?;
        instances.push(InstanceSim::new(
            i,
            cfg.instance.clone(),
            kv,
            latency.clone(),
            scheduler,
            priority,
        )?);
    }

    let admission = build_admission_policy(
        &cfg.policies.admission,
        cfg.policies.token_bucket_capacity,
        cfg.policies.token_bucket_refill_per_sec,
    )?;
    let routing = build_routing_policy(
        &cfg.policies.routing,
        cfg.policies.scorers.as_deref(),
        cfg.instance.block_size_tokens,
        cfg.policies.prefix_index_capacity,
    )?;
    let trace = DecisionTrace::new(
        cfg.observability.trace_level,
        cfg.observability.counterfactual_k,
        cfg.cluster.num_instances as usize,
    );

    let mut sim = ClusterSim::new(cfg.cluster.clone(), instances, admission, routing, trace)?;
    sim.inject(requests);
    let mut output = sim.run(include_per_request);

    if !cfg.observability.fitness_weights.is_empty() {
        output.report.fitness = Some(fitness(cfg, &output.report));
    }
    Ok(output)
}

/// Weighted scalar over report metrics. Keys were validated at the
/// config boundary; iteration follows the BTreeMap's sorted order so
/// the float accumulation is deterministic.
fn fitness(cfg: &RunConfig, report: &blis_metrics::SimReport) -> f64 {
    let mut total = 0.0;
    for (key, weight) in &cfg.observability.fitness_weights {
        let value = report
            .metric(key)
            .unwrap_or_else(|| panic!("fitness metric {key} passed validation but is unknown"));
        total += weight * value;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_runs_to_completion() {
        let cfg = RunConfig::default();
        let out = run(&cfg, false).unwrap();
        assert_eq!(out.report.completed_requests, 100);
        assert_eq!(out.report.injected_requests, 100);
    }
}
