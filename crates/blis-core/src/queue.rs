//! The shared event heap and logical clock.
//!
//! `std::collections::BinaryHeap` is a max-heap, so the queued wrapper
//! reverses its ordering to get a min-heap. A monotonic insertion
//! sequence breaks ties between events scheduled at the same instant
//! with the same class, which keeps pop order fully deterministic.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::event::{Event, EventClass, EventPayload, EventTarget};
use crate::time::Micros;

#[derive(Debug)]
struct QueuedEvent {
    time: Micros,
    class: EventClass,
    seq: u64,
    target: EventTarget,
    payload: EventPayload,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.class == other.class && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // Reversed so the max-heap behaves as a min-heap over
    // (time, class, seq, target).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.class.cmp(&self.class))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.target.cmp(&self.target))
    }
}

/// Min-heap of timestamped events plus the logical clock.
///
/// The clock is the timestamp of the most recently popped event and
/// never moves backwards. Scheduling an event in the past is a
/// programming error and panics.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<QueuedEvent>,
    next_seq: u64,
    clock: Micros,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule an event. Panics if `time` is earlier than the current
    /// clock: that would make the clock run backwards.
    pub fn push(&mut self, time: Micros, target: EventTarget, payload: EventPayload) {
        assert!(
            time >= self.clock,
            "event queue: scheduling {:?} at {}us but clock is already {}us",
            payload.class(),
            time,
            self.clock
        );
        let class = payload.class();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEvent {
            time,
            class,
            seq,
            target,
            payload,
        });
    }

    /// Pop the earliest event and advance the clock to its timestamp.
    pub fn pop(&mut self) -> Option<Event> {
        let queued = self.heap.pop()?;
        debug_assert!(queued.time >= self.clock);
        self.clock = queued.time;
        Some(Event {
            time: queued.time,
            target: queued.target,
            payload: queued.payload,
        })
    }

    /// Timestamp of the earliest pending event, if any.
    pub fn peek_time(&self) -> Option<Micros> {
        self.heap.peek().map(|q| q.time)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Current logical time.
    pub fn clock(&self) -> Micros {
        self.clock
    }
}
