//! Lock-free FIFO queues.
//!
//! Two linked queues sharing the same sentinel discipline: the queue always
//! holds at least one node, the tail node's value slot is the one the next
//! producer fills, and `head == tail` (by address) means empty.
//!
//! - [`SpscQueue`]: single producer, single consumer. No reference counts;
//!   the producer owns the tail, the consumer owns the head, and a
//!   release-store of the new tail publishes each filled slot.
//! - [`MpmcQueue`]: any number of producers and consumers. Producers race
//!   in two phases: claim the tail node by bumping the tail tag, then try
//!   to flip its published flag; the flag winner fills the slot and swings
//!   the tail. Reclamation uses the split reference count in every node:
//!   the tag of a published head/tail link counts the claims on its node,
//!   and the node is freed when internal counter and external residue sum
//!   to zero.

use std::alloc::Layout;
use std::hint;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

use crate::debug;
use crate::link::{AtomicSplitCount, AtomicTaggedPtr, TaggedPtr};
use crate::pool;

#[repr(C)]
struct SpscNode<T> {
    /// Written by the producer before the new tail is published.
    next: TaggedPtr<SpscNode<T>>,
    value: MaybeUninit<T>,
}

/// A lock-free queue for exactly one producer and one consumer.
///
/// The producer and consumer may be the same thread or two different
/// threads; the contract is that `push` calls never race each other and
/// `pop` calls never race each other.
pub struct SpscQueue<T> {
    head: CachePadded<AtomicTaggedPtr<SpscNode<T>>>,
    tail: CachePadded<AtomicTaggedPtr<SpscNode<T>>>,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Create a new empty queue holding its initial sentinel.
    pub fn new() -> Self {
        let sentinel = alloc_spsc_node::<T>();
        let link = TaggedPtr::new(sentinel.as_ptr(), 1);
        Self {
            head: CachePadded::new(AtomicTaggedPtr::new(link)),
            tail: CachePadded::new(AtomicTaggedPtr::new(link)),
            marker: PhantomData,
        }
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.ptr() == tail.ptr()
    }

    /// Enqueue a value.
    ///
    /// # Safety
    ///
    /// Must not be called concurrently with another `push`.
    pub unsafe fn push(&self, value: T) {
        let new_tail = alloc_spsc_node::<T>();
        let new_link = TaggedPtr::new(new_tail.as_ptr(), 1);

        let tail = self.tail.load(Ordering::Acquire);
        let node = tail.ptr();
        ptr::addr_of_mut!((*node).value).write(MaybeUninit::new(value));
        ptr::addr_of_mut!((*node).next).write(new_link);

        self.tail.store(new_link, Ordering::Release);
    }

    /// Dequeue the oldest value, or `None` if the queue is empty.
    ///
    /// # Safety
    ///
    /// Must not be called concurrently with another `pop`.
    pub unsafe fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.ptr() == tail.ptr() {
            return None;
        }

        let node = head.ptr();
        let next = ptr::addr_of!((*node).next).read();
        match self
            .head
            .compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                let value = ptr::addr_of!((*node).value).read().assume_init();
                free_spsc_node(node);
                Some(value)
            }
            Err(_) => None,
        }
    }
}

impl<T> Default for SpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        unsafe {
            while self.pop().is_some() {}
            free_spsc_node(self.tail.load(Ordering::Relaxed).ptr());
        }
    }
}

fn alloc_spsc_node<T>() -> NonNull<SpscNode<T>> {
    let node = pool::alloc_raw(Layout::new::<SpscNode<T>>()).cast::<SpscNode<T>>();
    unsafe {
        ptr::addr_of_mut!((*node.as_ptr()).next).write(TaggedPtr::null());
    }
    debug::node_created();
    node
}

/// The value slot must already be moved out or never have been filled.
unsafe fn free_spsc_node<T>(node: *mut SpscNode<T>) {
    pool::free_raw(
        NonNull::new_unchecked(node.cast::<u8>()),
        Layout::new::<SpscNode<T>>(),
    );
    debug::node_reclaimed();
}

#[repr(C)]
struct MpmcNode<T> {
    /// Written by the winning producer before the tail exchange.
    next: TaggedPtr<MpmcNode<T>>,
    refs: AtomicSplitCount,
    /// Two-phase producer handshake: the producer that flips this owns the
    /// value slot.
    filled: AtomicBool,
    value: MaybeUninit<T>,
}

/// A lock-free queue for any number of producers and consumers.
pub struct MpmcQueue<T> {
    head: CachePadded<AtomicTaggedPtr<MpmcNode<T>>>,
    tail: CachePadded<AtomicTaggedPtr<MpmcNode<T>>>,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Create a new empty queue holding its initial sentinel.
    pub fn new() -> Self {
        let sentinel = alloc_mpmc_node::<T>();
        let link = TaggedPtr::new(sentinel.as_ptr(), 1);
        Self {
            head: CachePadded::new(AtomicTaggedPtr::new(link)),
            tail: CachePadded::new(AtomicTaggedPtr::new(link)),
            marker: PhantomData,
        }
    }

    /// Check if the queue is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.ptr() == tail.ptr()
    }

    /// Enqueue a value.
    pub fn push(&self, value: T) {
        let new_tail = alloc_mpmc_node::<T>();
        let new_link = TaggedPtr::new(new_tail.as_ptr(), 1);

        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            // Claim an external reference on the current tail node.
            let claimed = loop {
                let bumped = tail.bump_tag();
                match self.tail.compare_exchange_weak(
                    tail,
                    bumped,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break bumped,
                    Err(current) => {
                        tail = current;
                        hint::spin_loop();
                    }
                }
            };

            let node = claimed.ptr();
            let won = unsafe {
                (*node)
                    .filled
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            };
            if won {
                unsafe {
                    ptr::addr_of_mut!((*node).value).write(MaybeUninit::new(value));
                    ptr::addr_of_mut!((*node).next).write(new_link);
                    // Claims that land between the flag win and this
                    // exchange still bump the tail tag; the returned link
                    // carries the node's final external count.
                    let last = self.tail.exchange(new_link, Ordering::AcqRel);
                    release(node, 2 - last.tag() as i32, 1);
                }
                return;
            }

            // Someone else owns this slot; drop the claim and try again.
            unsafe { release(node, 1, 0) };
            tail = self.tail.load(Ordering::Relaxed);
        }
    }

    /// Dequeue the oldest value, or `None` if the queue is empty.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Claim an external reference on the current head node.
            let claimed = loop {
                let bumped = head.bump_tag();
                match self.head.compare_exchange_weak(
                    head,
                    bumped,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break bumped,
                    Err(current) => {
                        head = current;
                        hint::spin_loop();
                    }
                }
            };

            let node = claimed.ptr();
            let tail = self.tail.load(Ordering::Acquire);
            if claimed.ptr() == tail.ptr() {
                unsafe { release(node, 1, 0) };
                return None;
            }

            let next = unsafe { ptr::addr_of!((*node).next).read() };
            match self
                .head
                .compare_exchange(claimed, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => unsafe {
                    // The node is off the queue and past the tail, so its
                    // slot was filled; the claimed tag is final.
                    let value = ptr::addr_of!((*node).value).read().assume_init();
                    release(node, 2 - claimed.tag() as i32, 1);
                    return Some(value);
                },
                Err(current) => {
                    unsafe { release(node, 1, 0) };
                    head = current;
                }
            }
        }
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        unsafe { free_mpmc_node(self.tail.load(Ordering::Relaxed).ptr()) };
    }
}

fn alloc_mpmc_node<T>() -> NonNull<MpmcNode<T>> {
    let node = pool::alloc_raw(Layout::new::<MpmcNode<T>>()).cast::<MpmcNode<T>>();
    unsafe {
        ptr::addr_of_mut!((*node.as_ptr()).next).write(TaggedPtr::null());
        ptr::addr_of_mut!((*node.as_ptr()).refs).write(AtomicSplitCount::new());
        ptr::addr_of_mut!((*node.as_ptr()).filled).write(AtomicBool::new(false));
    }
    debug::node_created();
    node
}

/// The value slot must already be moved out or never have been filled.
unsafe fn free_mpmc_node<T>(node: *mut MpmcNode<T>) {
    pool::free_raw(
        NonNull::new_unchecked(node.cast::<u8>()),
        Layout::new::<MpmcNode<T>>(),
    );
    debug::node_reclaimed();
}

/// Subtract the given deltas from the node's split count; whoever brings
/// it to zero frees the node.
unsafe fn release<T>(node: *mut MpmcNode<T>, internal: i32, external: u32) {
    if (*node).refs.release(internal, external).is_zero() {
        free_mpmc_node(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spsc_new_is_empty() {
        let queue: SpscQueue<i32> = SpscQueue::new();
        assert!(queue.is_empty());
        assert!(unsafe { queue.pop() }.is_none());
    }

    #[test]
    fn test_spsc_fifo_order() {
        let queue = SpscQueue::new();

        unsafe {
            queue.push(3);
            queue.push(4);
            queue.push(2);
            assert!(!queue.is_empty());

            assert_eq!(queue.pop(), Some(3));
            assert_eq!(queue.pop(), Some(4));
            assert_eq!(queue.pop(), Some(2));
            assert_eq!(queue.pop(), None);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spsc_threaded_order() {
        const COUNT: u64 = 100_000;

        let queue = SpscQueue::new();
        thread::scope(|s| {
            let producer = &queue;
            s.spawn(move || {
                for i in 0..COUNT {
                    unsafe { producer.push(i) };
                }
            });

            let consumer = &queue;
            s.spawn(move || {
                let mut expected = 0;
                while expected < COUNT {
                    if let Some(value) = unsafe { consumer.pop() } {
                        assert_eq!(value, expected);
                        expected += 1;
                    } else {
                        hint::spin_loop();
                    }
                }
            });
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spsc_drop_drains() {
        let queue = SpscQueue::new();
        unsafe {
            for i in 0..100 {
                queue.push(i.to_string());
            }
            assert_eq!(queue.pop().as_deref(), Some("0"));
        }
        // The rest is reclaimed by Drop.
    }

    #[test]
    fn test_mpmc_new_is_empty() {
        let queue: MpmcQueue<i32> = MpmcQueue::new();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_mpmc_fifo_order() {
        let queue = MpmcQueue::new();

        queue.push(3);
        queue.push(4);
        queue.push(2);
        assert!(!queue.is_empty());

        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mpmc_single_producer_single_consumer() {
        const COUNT: u64 = 100_000;

        let queue = MpmcQueue::new();
        thread::scope(|s| {
            let producer = &queue;
            s.spawn(move || {
                for i in 0..COUNT {
                    producer.push(i);
                }
            });

            let consumer = &queue;
            s.spawn(move || {
                let mut expected = 0;
                while expected < COUNT {
                    if let Some(value) = consumer.pop() {
                        assert_eq!(value, expected);
                        expected += 1;
                    } else {
                        hint::spin_loop();
                    }
                }
            });
        });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mpmc_multiset() {
        const PRODUCERS: i32 = 4;
        const CONSUMERS: i32 = 4;
        const PER_PRODUCER: i32 = 10_000;
        const PER_CONSUMER: i32 = PRODUCERS * PER_PRODUCER / CONSUMERS;

        let queue = MpmcQueue::new();
        let mut popped = thread::scope(|s| {
            for k in 0..PRODUCERS {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.push(k * PER_PRODUCER + i);
                    }
                });
            }

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let queue = &queue;
                    s.spawn(move || {
                        let mut log = Vec::with_capacity(PER_CONSUMER as usize);
                        while log.len() < PER_CONSUMER as usize {
                            if let Some(value) = queue.pop() {
                                log.push(value);
                            } else {
                                thread::yield_now();
                            }
                        }
                        log
                    })
                })
                .collect();

            consumers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        popped.sort_unstable();
        let expected: Vec<i32> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(popped, expected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mpmc_per_producer_order() {
        const PER_PRODUCER: usize = 20_000;

        let queue = MpmcQueue::new();
        let logs = thread::scope(|s| {
            for k in 0..2u64 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER as u64 {
                        queue.push((k << 32) | i);
                    }
                });
            }

            let queue = &queue;
            s.spawn(move || {
                let mut log = Vec::with_capacity(2 * PER_PRODUCER);
                while log.len() < 2 * PER_PRODUCER {
                    if let Some(value) = queue.pop() {
                        log.push(value);
                    } else {
                        thread::yield_now();
                    }
                }
                log
            })
            .join()
            .unwrap()
        });

        // Values from one producer must dequeue in that producer's order.
        let mut last = [None::<u64>; 2];
        for value in logs {
            let producer = (value >> 32) as usize;
            let sequence = value & u32::MAX as u64;
            if let Some(previous) = last[producer] {
                assert!(sequence > previous);
            }
            last[producer] = Some(sequence);
        }
    }
}
