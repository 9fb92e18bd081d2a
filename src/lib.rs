//! Lock-free concurrent data structures for very-high-contention
//! in-process workloads.
//!
//! The containers here never take a kernel-managed lock: heads and tails
//! are single tagged words mutated only by compare-and-swap, and popped
//! nodes are reclaimed through a split reference count that keeps them
//! alive while any concurrent operation still holds a transient claim.
//! Node allocations route through a thread-local page pool whose fast path
//! has no atomics at all.
//!
//! ## Module Organization
//!
//! ### Foundation
//! - [`link`] - Tagged pointer and split reference-count words
//! - [`tid`] - Process-wide per-thread identity
//!
//! ### Locks
//! - [`spinlock`] - Spinlock mutex and reentrant critical section
//!
//! ### Memory
//! - [`pool`] - Thread-local page pool backing node allocations
//! - [`debug`] - Live-node accounting for leak checks
//!
//! ### Containers
//! - [`stack`] - Lock-free stack with split-reference reclamation
//! - [`fifo`] - Lock-free SPSC and MPMC queues
//!
//! ## Features
//!
//! - `pool` (default): container nodes allocate from the memory pool
//!   instead of the host allocator.
//! - `alive-count` (default): every node bumps a process-wide counter on
//!   creation and reclamation; see [`debug`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// =============================================================================
// Tier 0: Foundation (No Internal Dependencies)
// =============================================================================

/// Tagged pointer and split reference-count words.
pub mod link;

/// Process-wide per-thread identity.
pub mod tid;

/// Live-node accounting for leak checks.
pub mod debug;

// =============================================================================
// Tier 1: Locks (Depends on Tier 0)
// =============================================================================

/// Spinlock mutex and reentrant critical section.
pub mod spinlock;

// =============================================================================
// Tier 2: Memory (Depends on Tiers 0-1)
// =============================================================================

/// Thread-local page pool backing node allocations.
pub mod pool;

// =============================================================================
// Tier 3: Containers (Depends on Tiers 0-2)
// =============================================================================

/// Lock-free stack.
pub mod stack;

/// Lock-free FIFO queues.
pub mod fifo;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use fifo::{MpmcQueue, SpscQueue};
pub use spinlock::{ReentrantMutex, ReentrantMutexGuard, SpinMutex, SpinMutexGuard};
pub use stack::Stack;
