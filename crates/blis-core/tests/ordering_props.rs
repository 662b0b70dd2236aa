//! Property tests for event-queue total ordering and clock
//! monotonicity under arbitrary interleavings.

use blis_core::{EventPayload, EventQueue, EventTarget};
use proptest::prelude::*;

fn payload_for(kind: u8, req: u64) -> EventPayload {
    match kind % 3 {
        0 => EventPayload::Step,
        1 => EventPayload::RequestLeft { request_id: req },
        _ => EventPayload::Preemption { request_id: req },
    }
}

proptest! {
    #[test]
    fn pops_are_time_ordered_and_clock_monotonic(
        events in prop::collection::vec((0u64..1000, 0u8..3, 0u32..4), 1..100)
    ) {
        let mut queue = EventQueue::new();
        for (i, (time, kind, instance)) in events.iter().enumerate() {
            queue.push(
                *time,
                EventTarget::Instance(*instance),
                payload_for(*kind, i as u64),
            );
        }
        let mut last_time = 0;
        while let Some(ev) = queue.pop() {
            prop_assert!(ev.time >= last_time, "time went backwards");
            prop_assert_eq!(queue.clock(), ev.time);
            last_time = ev.time;
        }
    }

    #[test]
    fn pop_order_is_reproducible(
        events in prop::collection::vec((0u64..50, 0u8..3, 0u32..4), 1..60)
    ) {
        let drain = |events: &[(u64, u8, u32)]| -> Vec<(u64, blis_core::EventClass)> {
            let mut queue = EventQueue::new();
            for (i, (time, kind, instance)) in events.iter().enumerate() {
                queue.push(
                    *time,
                    EventTarget::Instance(*instance),
                    payload_for(*kind, i as u64),
                );
            }
            std::iter::from_fn(|| queue.pop())
                .map(|e| (e.time, e.payload.class()))
                .collect()
        };
        prop_assert_eq!(drain(&events), drain(&events));
    }
}
