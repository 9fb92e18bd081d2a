#![cfg(feature = "alive-count")]

use std::thread;

use lockfreekit::{debug, MpmcQueue, SpscQueue, Stack};

// Single test on purpose: the counter is process-wide, so nothing else may
// allocate nodes while the zero checks run.
#[test]
fn balanced_runs_leave_no_live_nodes() {
    const PRODUCERS: i32 = 4;
    const PER_PRODUCER: i32 = 25_000;

    // Stack: balanced concurrent push/pop, then drop.
    {
        let stack = Stack::new();
        thread::scope(|s| {
            for k in 0..PRODUCERS {
                let stack = &stack;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        stack.push(k * PER_PRODUCER + i);
                    }
                });
            }
            for _ in 0..PRODUCERS {
                let stack = &stack;
                s.spawn(move || {
                    let mut remaining = PER_PRODUCER;
                    while remaining > 0 {
                        if stack.pop().is_some() {
                            remaining -= 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                });
            }
        });
        assert!(stack.is_empty());
    }
    assert_eq!(debug::alive_node_count(), 0);

    // MPMC queue driven in its SPSC configuration, several rounds; every
    // round must leave the process clean.
    for _ in 0..5 {
        let queue = MpmcQueue::new();
        thread::scope(|s| {
            let producer = &queue;
            s.spawn(move || {
                for i in 0..100_000u64 {
                    producer.push(i);
                }
            });

            let consumer = &queue;
            s.spawn(move || {
                let mut expected = 0u64;
                while expected < 100_000 {
                    if let Some(value) = consumer.pop() {
                        assert_eq!(value, expected);
                        expected += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            });
        });
        drop(queue);
        assert_eq!(debug::alive_node_count(), 0);
    }

    // SPSC queue, balanced single-threaded run.
    {
        let queue = SpscQueue::new();
        unsafe {
            for i in 0..1_000 {
                queue.push(i);
            }
            for i in 0..1_000 {
                assert_eq!(queue.pop(), Some(i));
            }
        }
    }
    assert_eq!(debug::alive_node_count(), 0);
}
