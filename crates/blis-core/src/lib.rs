//! BLIS simulation kernel.
//!
//! This crate holds the pieces every other BLIS crate builds on:
//!
//! - **Logical time**: integer microseconds, advanced only by the event queue.
//! - **Event heap**: a min-heap with a total `(time, class, seq, instance)`
//!   order, so two runs with the same seed pop events in the same order.
//! - **Partitioned RNG**: one independent ChaCha stream per subsystem,
//!   derived from a single root seed.
//! - **Request lifecycle**: the `Queued -> Running -> Completed` state
//!   machine with one-shot metric timestamps.
//!
//! Everything here is pure data plus deterministic state transitions.
//! There is no I/O, no wall-clock time, and no global state.

mod event;
mod queue;
mod request;
mod rng;
mod time;

pub use event::{Event, EventClass, EventPayload, EventTarget};
pub use queue::EventQueue;
pub use request::{Request, RequestState, SloClass, Timestamps};
pub use rng::{RngPartition, Stream};
pub use time::{micros_to_ms, micros_to_secs, Micros};

/// Dense request identifier, minted in arrival order by the workload layer.
pub type RequestId = u64;

/// Instance index within the cluster, `0..num_instances`.
pub type InstanceId = u32;

/// Synthetic token identifier. Only identity matters (for prefix hashing);
/// there is no vocabulary behind it.
pub type TokenId = u32;

/// Multi-turn session identifier.
pub type SessionId = u64;
