//! Simulation events.
//!
//! Events are small value records owned by the heap. The only shared
//! reference they carry is the `Request` being moved between pipeline
//! stages: an event that hands a request to the next stage owns it, and
//! the receiving stage takes it out of the payload.

use crate::request::Request;
use crate::time::Micros;
use crate::InstanceId;

/// Who consumes an event when it is popped.
///
/// Cluster-targeted events are the admission/routing pipeline; instance
/// events are delivered to exactly one instance simulator. The derived
/// `Ord` puts cluster events before instance events at equal
/// `(time, class, seq)`, and instances in ascending index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventTarget {
    Cluster,
    Instance(InstanceId),
}

/// Tie-breaking class for events that share a timestamp.
///
/// The order is chosen so that, at one instant, pipeline progress
/// (arrival through enqueue) and departures are visible before the next
/// `Step` forms a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventClass {
    ClusterArrival,
    AdmissionDecision,
    RoutingDecision,
    Queued,
    Scheduled,
    RequestLeft,
    Preemption,
    Step,
}

/// Event payloads. Requests travel by value through the pipeline stages.
#[derive(Debug)]
pub enum EventPayload {
    /// A workload arrival entering the admission stage.
    ClusterArrival { request: Request },
    /// An admitted request entering the routing stage.
    AdmissionDecision { request: Request },
    /// A routed request on its way to the chosen instance.
    RoutingDecision {
        request: Request,
        priority_hint: Option<f64>,
    },
    /// Deliver a request into an instance's wait queue.
    Queued { request: Request },
    /// Wake an instance to form and execute the next batch.
    Step,
    /// Accounting record of a request's first admission into a batch.
    Scheduled { request_id: crate::RequestId },
    /// A request finished its expected output during the step ending now.
    RequestLeft { request_id: crate::RequestId },
    /// Accounting record for a preemption performed during batch formation.
    Preemption { request_id: crate::RequestId },
}

impl EventPayload {
    /// The tie-breaking class for this payload.
    pub fn class(&self) -> EventClass {
        match self {
            EventPayload::ClusterArrival { .. } => EventClass::ClusterArrival,
            EventPayload::AdmissionDecision { .. } => EventClass::AdmissionDecision,
            EventPayload::RoutingDecision { .. } => EventClass::RoutingDecision,
            EventPayload::Queued { .. } => EventClass::Queued,
            EventPayload::Scheduled { .. } => EventClass::Scheduled,
            EventPayload::RequestLeft { .. } => EventClass::RequestLeft,
            EventPayload::Preemption { .. } => EventClass::Preemption,
            EventPayload::Step => EventClass::Step,
        }
    }
}

/// A popped event, handed to the dispatch loop.
#[derive(Debug)]
pub struct Event {
    pub time: Micros,
    pub target: EventTarget,
    pub payload: EventPayload,
}
