//! BLIS: a discrete-event simulator for LLM inference serving.
//!
//! The library surface of the root crate is the configuration model
//! and the runner that turns a config into a finished report. The
//! `blis` binary is a thin CLI over these two.

pub mod config;
pub mod runner;

pub use config::{ObservabilityConfig, PoliciesConfig, PresetConfig, RunConfig, WorkloadConfig};
pub use runner::run;
