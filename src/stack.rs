//! Lock-free stack.
//!
//! A Treiber stack over tagged links, with split-reference reclamation so
//! that any number of concurrent consumers can pop safely: a popped node is
//! only reclaimed once every pop that transiently claimed it has let go.
//!
//! The head link's tag is the external half of each node's reference
//! count. Push publishes the new head with tag 1; every pop starts by
//! re-CASing the head with the tag bumped, which claims the node without
//! moving it. The winning pop (the one whose address-moving CAS succeeds)
//! folds `tag - 2` into the node's internal counter; every losing claimant
//! subtracts one. The counter sums to zero exactly when the last claim
//! drops, and whoever observes the zero frees the node. While any claim is
//! outstanding the node cannot be reclaimed, so its address cannot be
//! recycled into a new push, which is what makes the unlink CAS safe.

use std::alloc::Layout;
use std::hint;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam_utils::CachePadded;

use crate::debug;
use crate::link::{AtomicTaggedPtr, TaggedPtr};
use crate::pool;

#[repr(C)]
struct Node<T> {
    /// Head link observed at push time; plain because it is written before
    /// the node is published and never after.
    next: TaggedPtr<Node<T>>,
    /// Internal half of the split reference count.
    refs: AtomicI32,
    value: MaybeUninit<T>,
}

/// A lock-free stack (LIFO) for any number of producers and consumers.
pub struct Stack<T> {
    head: CachePadded<AtomicTaggedPtr<Node<T>>>,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    /// Create a new empty stack.
    #[inline]
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicTaggedPtr::null()),
            marker: PhantomData,
        }
    }

    /// Check if the stack is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        let node = alloc_node(value);
        let link = TaggedPtr::new(node.as_ptr(), 1);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { ptr::addr_of_mut!((*node.as_ptr()).next).write(head) };
            match self
                .head
                .compare_exchange_weak(head, link, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    hint::spin_loop();
                }
            }
        }
    }

    /// Pop the most recently pushed value, or `None` if the stack is
    /// empty.
    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Claim the current head: bump the tag, leave the address.
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
            if node.is_null() {
                return None;
            }

            let next = unsafe { ptr::addr_of!((*node).next).read() };
            match self
                .head
                .compare_exchange(claimed, next, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => unsafe {
                    // This pop owns the node; the claimed tag is its final
                    // external count.
                    let value = ptr::addr_of!((*node).value).read().assume_init();
                    release(node, claimed.tag() as i32 - 2);
                    return Some(value);
                },
                Err(current) => {
                    unsafe { release(node, -1) };
                    head = current;
                }
            }
        }
    }

    /// Visit every value currently in the stack, top to bottom.
    ///
    /// Exclusive access keeps the walk coherent; there is no iteration
    /// protocol over a concurrently mutated stack.
    pub fn walk(&mut self, mut f: impl FnMut(&T)) {
        let mut node = self.head.load(Ordering::Relaxed).ptr();
        while !node.is_null() {
            unsafe {
                f((*node).value.assume_init_ref());
                node = (*node).next.ptr();
            }
        }
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

fn alloc_node<T>(value: T) -> NonNull<Node<T>> {
    let node = pool::alloc_raw(Layout::new::<Node<T>>()).cast::<Node<T>>();
    unsafe {
        ptr::addr_of_mut!((*node.as_ptr()).refs).write(AtomicI32::new(0));
        ptr::addr_of_mut!((*node.as_ptr()).value).write(MaybeUninit::new(value));
    }
    debug::node_created();
    node
}

/// Fold `delta` into the node's internal counter; whoever brings the total
/// to zero frees the node. The value must already have been moved out.
unsafe fn release<T>(node: *mut Node<T>, delta: i32) {
    if (*node).refs.fetch_add(delta, Ordering::AcqRel) == -delta {
        pool::free_raw(
            NonNull::new_unchecked(node.cast::<u8>()),
            Layout::new::<Node<T>>(),
        );
        debug::node_reclaimed();
    }
}
