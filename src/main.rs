//! The `blis` command-line frontend.
//!
//! stdout carries exactly one JSON report on success; every diagnostic
//! goes to stderr. Configuration rejection exits 2 with a single error
//! line, output failures exit 1, and invariant violations abort.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use blis::config::{PresetConfig, RunConfig, WorkloadConfig};
use blis_cluster::ScorerSpec;
use blis_metrics::TraceLevel;

#[derive(Debug, Parser)]
#[command(
    name = "blis",
    version,
    about = "Discrete-event simulator for LLM inference serving clusters"
)]
struct Cli {
    /// YAML configuration bundle; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root seed for all random streams.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    num_instances: Option<u32>,

    /// Simulation horizon in logical microseconds.
    #[arg(long)]
    horizon_us: Option<u64>,

    /// Workload preset name (steady, bursty, heavy-tail, chat).
    #[arg(long)]
    workload: Option<String>,

    /// Total arrival rate, requests per second.
    #[arg(long)]
    rate: Option<f64>,

    #[arg(long)]
    num_requests: Option<u64>,

    #[arg(long)]
    mean_input_tokens: Option<f64>,

    #[arg(long)]
    mean_output_tokens: Option<f64>,

    #[arg(long)]
    admission: Option<String>,

    #[arg(long)]
    routing: Option<String>,

    #[arg(long)]
    priority: Option<String>,

    #[arg(long)]
    scheduler: Option<String>,

    /// Weighted scorer pipeline, e.g. "prefix-affinity:3,queue-depth:2".
    #[arg(long)]
    scorers: Option<String>,

    /// Trace level: none or decisions.
    #[arg(long)]
    trace: Option<String>,

    #[arg(long)]
    counterfactual_k: Option<usize>,

    /// Include the per-request array in the report.
    #[arg(long)]
    per_request: bool,

    /// Also write the stdout JSON to this file.
    #[arg(long)]
    results_file: Option<PathBuf>,

    /// Fitness terms, e.g. "ttft_p99:-1.0,tokens_per_sec:0.5".
    #[arg(long)]
    fitness_weights: Option<String>,

    /// Increase stderr log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_scorers(s: &str) -> anyhow::Result<Vec<ScorerSpec>> {
    s.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| part.trim().parse::<ScorerSpec>().map_err(Into::into))
        .collect()
}

fn parse_fitness_weights(s: &str) -> anyhow::Result<BTreeMap<String, f64>> {
    let mut weights = BTreeMap::new();
    for part in s.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .trim()
            .split_once(':')
            .with_context(|| format!("fitness weight {part:?} is not of the form key:value"))?;
        let value: f64 = value
            .parse()
            .with_context(|| format!("fitness weight {part:?} has a non-numeric value"))?;
        weights.insert(key.to_string(), value);
    }
    Ok(weights)
}

fn apply_overrides(cfg: &mut RunConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(seed) = cli.seed {
        cfg.cluster.root_seed = seed;
    }
    if let Some(n) = cli.num_instances {
        cfg.cluster.num_instances = n;
    }
    if let Some(h) = cli.horizon_us {
        cfg.cluster.simulation_horizon_micros = Some(h);
    }
    if let Some(name) = &cli.workload {
        cfg.workload = WorkloadConfig::Preset(PresetConfig {
            name: name.clone(),
            rate_per_sec: cli.rate.unwrap_or(10.0),
            num_requests: cli.num_requests.unwrap_or(100),
            mean_input_tokens: cli.mean_input_tokens.unwrap_or(256.0),
            mean_output_tokens: cli.mean_output_tokens.unwrap_or(64.0),
        });
    } else if let WorkloadConfig::Preset(preset) = &mut cfg.workload {
        if let Some(rate) = cli.rate {
            preset.rate_per_sec = rate;
        }
        if let Some(n) = cli.num_requests {
            preset.num_requests = n;
        }
        if let Some(m) = cli.mean_input_tokens {
            preset.mean_input_tokens = m;
        }
        if let Some(m) = cli.mean_output_tokens {
            preset.mean_output_tokens = m;
        }
    }
    if let Some(name) = &cli.admission {
        cfg.policies.admission = name.clone();
    }
    if let Some(name) = &cli.routing {
        cfg.policies.routing = name.clone();
    }
    if let Some(name) = &cli.priority {
        cfg.policies.priority = name.clone();
    }
    if let Some(name) = &cli.scheduler {
        cfg.policies.scheduler = name.clone();
    }
    if let Some(scorers) = &cli.scorers {
        cfg.policies.scorers = Some(parse_scorers(scorers)?);
    }
    if let Some(level) = &cli.trace {
        cfg.observability.trace_level = level
            .parse::<TraceLevel>()
            .map_err(anyhow::Error::msg)
            .context("parsing --trace")?;
    }
    if let Some(k) = cli.counterfactual_k {
        cfg.observability.counterfactual_k = k;
    }
    if let Some(weights) = &cli.fitness_weights {
        cfg.observability.fitness_weights = parse_fitness_weights(weights)?;
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Everything up to and including simulation construction is
    // configuration; reject with a single line and exit 2.
    let output = match configure_and_run(&cli) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let json = output.report.to_json();
    println!("{json}");
    if let Some(path) = &cli.results_file {
        if let Err(err) = std::fs::write(path, format!("{json}\n")) {
            eprintln!("error: writing results file {}: {err}", path.display());
            std::process::exit(1);
        }
    }
}

fn configure_and_run(cli: &Cli) -> anyhow::Result<blis_cluster::RunOutput> {
    let mut cfg = match &cli.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    apply_overrides(&mut cfg, cli)?;
    blis::runner::run(&cfg, cli.per_request)
}
