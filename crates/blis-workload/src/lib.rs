//! Workload synthesis.
//!
//! Turns a declarative workload spec (clients, rates, distributions,
//! sessions, prefix groups) into a concrete list of requests with
//! arrival times and token vectors, entirely from the partitioned RNG.
//! Every sampler draws from its own derived stream, so adding a client
//! or changing one distribution never shifts another client's draws.

mod generate;
mod preset;
mod sampler;
mod spec;

pub use generate::generate;
pub use preset::{build_preset, PRESET_NAMES};
pub use sampler::{ArrivalSampler, LengthSampler};
pub use spec::{
    ArrivalSpec, ClientSpec, LengthSpec, MultiTurnSpec, PrefixGroupSpec, WorkloadError,
    WorkloadSpec,
};

/// Synthetic vocabulary size for generated token ids.
pub(crate) const VOCAB_SIZE: u32 = 50_000;
