//! Property-based tests for the rendezvous and queueing primitives.

use proptest::prelude::*;
use rfidctl_sync::{EventLock, EventPipe, EventQueue, QueueEvent};

#[derive(Debug, Clone, PartialEq)]
struct Numbered {
    seq: usize,
    priority: i32,
}

impl QueueEvent for Numbered {
    type Kind = ();

    fn kind(&self) {}
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

proptest! {
    /// Any burst of fires is returned in fire order by one immediate await,
    /// and the pipe is empty afterwards.
    #[test]
    fn prop_pipe_drains_in_fire_order(events in prop::collection::vec(any::<u32>(), 0..64)) {
        let rt = runtime();
        let pipe = EventPipe::new(&EventLock::new());
        for event in &events {
            pipe.fire(*event);
        }

        let drained = rt.block_on(pipe.await_events(0)).unwrap();
        prop_assert_eq!(drained, events);
        prop_assert!(rt.block_on(pipe.await_events(0)).unwrap().is_empty());
    }

    /// Takes come out by descending priority, FIFO within a priority.
    #[test]
    fn prop_queue_orders_by_priority_then_fifo(priorities in prop::collection::vec(-3i32..=3, 1..48)) {
        let rt = runtime();
        let queue = EventQueue::new();
        for (seq, priority) in priorities.iter().enumerate() {
            queue.put_with_priority(Numbered { seq, priority: *priority }, *priority);
        }

        let mut taken = Vec::new();
        for _ in 0..priorities.len() {
            taken.push(rt.block_on(queue.take(100)).unwrap());
        }

        let mut expected: Vec<_> = priorities
            .iter()
            .enumerate()
            .map(|(seq, priority)| Numbered { seq, priority: *priority })
            .collect();
        expected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        prop_assert_eq!(taken, expected);
        prop_assert!(queue.is_empty());
    }
}
