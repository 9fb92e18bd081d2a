//! Process-wide thread identity.
//!
//! The memory pool keys page ownership on a small integer id rather than
//! [`std::thread::ThreadId`] so that ids fit the page header and compare
//! with one load. Ids are handed out by a global counter, assigned lazily
//! the first time a thread asks, and never reused.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Id value no thread ever holds.
pub const UNASSIGNED: u32 = 0;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: Cell<u32> = const { Cell::new(UNASSIGNED) };
}

/// The calling thread's id, assigned on first call. Never [`UNASSIGNED`].
#[inline]
#[must_use]
pub fn current() -> u32 {
    THREAD_ID.with(|id| {
        let value = id.get();
        if value != UNASSIGNED {
            value
        } else {
            let value = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            id.set(value);
            value
        }
    })
}
