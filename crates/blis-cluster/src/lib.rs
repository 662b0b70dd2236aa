//! Cluster control plane.
//!
//! Owns the shared event heap, the admission and routing pipeline, the
//! snapshot provider, and the router-side prefix index. Instances are
//! observed only through read-only snapshots and driven only through
//! `Queued` events; nothing below this crate ever calls back up.
//!
//! Event flow per arrival:
//!
//! ```text
//! ClusterArrival --admit?--> AdmissionDecision --route--> RoutingDecision
//!                                                             |
//!                                      Queued (chosen instance) at +routing latency
//! ```

mod admission;
mod cluster;
mod prefix_index;
mod routing;
mod scorer;
mod snapshot;

pub use admission::{build_admission_policy, AdmissionDecision, AdmissionPolicy, ADMISSION_POLICY_NAMES};
pub use cluster::{ClusterConfig, ClusterConfigError, ClusterSim, RunOutput};
pub use prefix_index::PrefixCacheIndex;
pub use routing::{
    build_routing_policy, RoutingError, RoutingOutcome, RoutingPolicy, ScorerSpec,
    ROUTING_POLICY_NAMES, SCORER_NAMES,
};
pub use scorer::Scorer;
pub use snapshot::{CachedSnapshotProvider, InstanceSnapshot, RouterState};
