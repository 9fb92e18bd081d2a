use std::thread;

use rand::Rng;

use lockfreekit::{MpmcQueue, Stack};

const THREADS: usize = 8;
const ITERATIONS: usize = 50_000;

#[test]
fn stack_survives_mixed_stress() {
    let stack = Stack::new();
    thread::scope(|s| {
        for _ in 0..THREADS {
            let stack = &stack;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERATIONS {
                    stack.push(rng.gen_range(0..10_000));
                }
            });
        }
        for _ in 0..THREADS {
            let stack = &stack;
            s.spawn(move || {
                let mut popped = 0;
                while popped < ITERATIONS {
                    if stack.pop().is_some() {
                        popped += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            });
        }
    });
    assert!(stack.is_empty());
}

#[test]
fn mpmc_queue_survives_mixed_stress() {
    let queue = MpmcQueue::new();
    thread::scope(|s| {
        for _ in 0..THREADS {
            let queue = &queue;
            s.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..ITERATIONS {
                    queue.push(rng.gen_range(0..10_000));
                }
            });
        }
        for _ in 0..THREADS {
            let queue = &queue;
            s.spawn(move || {
                let mut popped = 0;
                while popped < ITERATIONS {
                    if queue.pop().is_some() {
                        popped += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            });
        }
    });
    assert!(queue.is_empty());
}
