//! Leak diagnostics for container nodes.
//!
//! With the `alive-count` feature enabled, every container node (queue
//! sentinels included) increments a process-wide counter when allocated and
//! decrements it when reclaimed. After any balanced sequence of operations
//! on drained containers the counter reads zero; anything else is a leak or
//! a double free.

#[cfg(feature = "alive-count")]
use std::sync::atomic::{AtomicI64, Ordering};

#[cfg(feature = "alive-count")]
static ALIVE_NODES: AtomicI64 = AtomicI64::new(0);

/// Number of container nodes currently allocated, process-wide.
///
/// Reads with `SeqCst` so that a validation pass after joining worker
/// threads observes every decrement.
#[cfg(feature = "alive-count")]
#[must_use]
pub fn alive_node_count() -> i64 {
    ALIVE_NODES.load(Ordering::SeqCst)
}

#[inline]
pub(crate) fn node_created() {
    #[cfg(feature = "alive-count")]
    ALIVE_NODES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn node_reclaimed() {
    #[cfg(feature = "alive-count")]
    ALIVE_NODES.fetch_sub(1, Ordering::Relaxed);
}
