//! Spinlock mutex and reentrant critical section.
//!
//! [`SpinMutex`] is the thin blocking facility of this crate: mutually
//! exclusive, unfair, never touching the kernel except to yield. It guards
//! only cold-path bookkeeping (the memory pool's cache registry); the
//! lock-free containers never take it.
//!
//! [`ReentrantMutex`] adds owner re-entry on the same surface: the owning
//! thread may nest acquisitions, tracked by an entry count.

use std::cell::UnsafeCell;
use std::hint;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::tid;

/// Spin iterations between scheduler yields while contended.
pub const DEFAULT_SPIN_BUDGET: u32 = 512;

/// A spinlock-based mutex.
///
/// Acquisition sets a single atomic flag with sequentially consistent
/// ordering. A contended caller spins on a relaxed read for up to the spin
/// budget, yields to the scheduler, and retests; there is no fairness
/// guarantee. The flag and the budget live on their own cache lines so
/// neighbouring data does not false-share with the spin loop.
#[repr(C)]
pub struct SpinMutex<T: ?Sized> {
    flag: CachePadded<AtomicBool>,
    budget: CachePadded<u32>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    /// Create a new unlocked mutex with the default spin budget.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self::with_spin_budget(data, DEFAULT_SPIN_BUDGET)
    }

    /// Create a new unlocked mutex that spins `budget` times between
    /// scheduler yields.
    #[inline]
    pub const fn with_spin_budget(data: T, budget: u32) -> Self {
        Self {
            flag: CachePadded::new(AtomicBool::new(false)),
            budget: CachePadded::new(budget),
            data: UnsafeCell::new(data),
        }
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(SpinMutexGuard { lock: self })
        }
    }

    /// Acquire the lock, spinning (and eventually yielding) if necessary.
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        while self.flag.swap(true, Ordering::SeqCst) {
            let mut spins = 0u32;
            while self.flag.load(Ordering::Relaxed) {
                if spins < *self.budget {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    spins = 0;
                    thread::yield_now();
                }
            }
        }
        SpinMutexGuard { lock: self }
    }

    /// Check if the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for [`SpinMutex`]. The lock releases on drop.
pub struct SpinMutexGuard<'a, T: ?Sized> {
    lock: &'a SpinMutex<T>,
}

impl<T: ?Sized> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false, Ordering::SeqCst);
    }
}

/// A spinlock critical section the owning thread may re-enter.
///
/// The owner's thread id is recorded after the flag is won and cleared
/// before it is released; a nested acquisition by the owner only bumps an
/// entry count. The flag clears when the outermost guard drops.
///
/// Unlike [`SpinMutex`] this does not own data; it brackets a region.
#[repr(C)]
pub struct ReentrantMutex {
    flag: CachePadded<AtomicBool>,
    budget: CachePadded<u32>,
    owner: AtomicU32,
    depth: UnsafeCell<u32>,
}

unsafe impl Send for ReentrantMutex {}
unsafe impl Sync for ReentrantMutex {}

impl ReentrantMutex {
    /// Create a new unentered critical section.
    #[inline]
    pub const fn new() -> Self {
        Self::with_spin_budget(DEFAULT_SPIN_BUDGET)
    }

    /// Create a new unentered critical section with a custom spin budget.
    #[inline]
    pub const fn with_spin_budget(budget: u32) -> Self {
        Self {
            flag: CachePadded::new(AtomicBool::new(false)),
            budget: CachePadded::new(budget),
            owner: AtomicU32::new(tid::UNASSIGNED),
            depth: UnsafeCell::new(0),
        }
    }

    /// Enter the critical section, re-entering for free if the calling
    /// thread already owns it.
    pub fn lock(&self) -> ReentrantMutexGuard<'_> {
        let me = tid::current();
        if self.owner.load(Ordering::Relaxed) == me {
            // Only the owner can observe its own id here.
            unsafe { *self.depth.get() += 1 };
            return ReentrantMutexGuard {
                lock: self,
                _not_send: PhantomData,
            };
        }

        while self.flag.swap(true, Ordering::SeqCst) {
            let mut spins = 0u32;
            while self.flag.load(Ordering::Relaxed) {
                if spins < *self.budget {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    spins = 0;
                    thread::yield_now();
                }
            }
        }
        self.owner.store(me, Ordering::Relaxed);
        unsafe { *self.depth.get() = 1 };
        ReentrantMutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Check if any thread is inside the critical section.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`ReentrantMutex`]; the outermost drop releases the flag.
///
/// Not sendable: the release must happen on the entering thread.
pub struct ReentrantMutexGuard<'a> {
    lock: &'a ReentrantMutex,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for ReentrantMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            let depth = self.lock.depth.get();
            *depth -= 1;
            if *depth == 0 {
                self.lock.owner.store(tid::UNASSIGNED, Ordering::Relaxed);
                self.lock.flag.store(false, Ordering::SeqCst);
            }
        }
    }
}
