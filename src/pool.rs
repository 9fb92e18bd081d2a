//! Thread-local memory pool for node-sized allocations.
//!
//! The pool carves naturally-aligned pages out of the host allocator and
//! serves equal-sized blocks from per-thread caches, so the fast path runs
//! without any atomic operation at all. Freeing from the owning thread
//! pushes the block onto the page's private free list; freeing from any
//! other thread costs exactly one CAS onto the page's pending list, which
//! the owner splices back in periodically ([`collect`]) or when its
//! heartbeat counter fires. Because pages are aligned to their own size,
//! the page of any block is recovered by masking the low address bits.
//!
//! Blocks come in eight 16-byte-aligned size classes up to
//! [`MAX_BLOCK_SIZE`]; larger or more strictly aligned requests fall back
//! to the host allocator. Page allocation failure is fatal
//! ([`std::alloc::handle_alloc_error`]).
//!
//! A thread's cache is created on first use and returned, pages and all,
//! to a process-global spare list when the thread exits; the next new
//! thread adopts it wholesale.

use std::alloc::{self, handle_alloc_error, Layout};
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;
use static_assertions::const_assert;

use crate::spinlock::SpinMutex;
use crate::tid;

/// 16 KiB pages.
pub const PAGE_SIZE_16KB: usize = 16 * 1024;
/// 32 KiB pages.
pub const PAGE_SIZE_32KB: usize = 32 * 1024;
/// 64 KiB pages.
pub const PAGE_SIZE_64KB: usize = 64 * 1024;
/// 128 KiB pages.
pub const PAGE_SIZE_128KB: usize = 128 * 1024;
/// 256 KiB pages.
pub const PAGE_SIZE_256KB: usize = 256 * 1024;
/// 512 KiB pages.
pub const PAGE_SIZE_512KB: usize = 512 * 1024;
/// 1 MiB pages.
pub const PAGE_SIZE_1MB: usize = 1024 * 1024;
/// 2 MiB pages.
pub const PAGE_SIZE_2MB: usize = 2 * 1024 * 1024;
/// 4 MiB pages.
pub const PAGE_SIZE_4MB: usize = 4 * 1024 * 1024;

/// Page size the pool is built with.
pub const PAGE_SIZE: usize = PAGE_SIZE_512KB;

/// Alignment of every block the pool serves.
pub const BLOCK_ALIGN: usize = 16;

/// Largest block size the pool serves; bigger requests use the host
/// allocator.
pub const MAX_BLOCK_SIZE: usize = 128;

const NUM_CLASSES: usize = MAX_BLOCK_SIZE / BLOCK_ALIGN;
const CLASS_SHIFT: u32 = BLOCK_ALIGN.trailing_zeros();

/// Allocations between forced pending-list collections.
const HEARTBEAT_PERIOD: u64 = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(PAGE_SIZE >= PAGE_SIZE_16KB);
const_assert!(PAGE_SIZE <= PAGE_SIZE_4MB);
const_assert!(mem::size_of::<Page>() <= PAGE_SIZE_16KB / 2);

/// Intrusive list node occupying a freed block.
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Header at the base of every pool page. The block array follows it,
/// starting at the first block-size-aligned offset.
///
/// All fields except `owner` and `pending` are touched only by the owning
/// thread.
#[repr(C)]
struct Page {
    owner: AtomicU32,
    block_size: u32,
    header_size: u32,
    capacity: u32,
    allocated: u32,
    fresh: u32,
    free_list: *mut FreeBlock,
    pending: CachePadded<AtomicPtr<FreeBlock>>,
}

impl Page {
    unsafe fn init(page: *mut Page, block_size: u32) {
        let header_size =
            (mem::size_of::<Page>() as u32 + block_size - 1) & !(block_size - 1);
        ptr::write(
            page,
            Page {
                owner: AtomicU32::new(tid::current()),
                block_size,
                header_size,
                capacity: (PAGE_SIZE as u32 - header_size) / block_size,
                allocated: 0,
                fresh: 0,
                free_list: ptr::null_mut(),
                pending: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            },
        );
    }

    unsafe fn has_space(page: *mut Page) -> bool {
        (*page).allocated < (*page).capacity
    }

    /// Serve one block: the local free list first, then the bump region of
    /// never-used blocks. Owner thread only.
    ///
    /// Raw field accesses throughout: foreign threads CAS `pending`
    /// concurrently, so no reference to the whole header may exist.
    unsafe fn alloc_block(page: *mut Page) -> *mut u8 {
        debug_assert!((*page).allocated < (*page).capacity);

        let block = if !(*page).free_list.is_null() {
            let b = (*page).free_list;
            (*page).free_list = (*b).next;
            b.cast::<u8>()
        } else {
            let offset =
                (*page).header_size as usize + (*page).fresh as usize * (*page).block_size as usize;
            (*page).fresh += 1;
            page.cast::<u8>().add(offset)
        };
        (*page).allocated += 1;
        block
    }

    /// Return a block to the local free list. Owner thread only.
    unsafe fn free_block(page: *mut Page, block: *mut u8) {
        let b = block.cast::<FreeBlock>();
        (*b).next = (*page).free_list;
        (*page).free_list = b;
        (*page).allocated -= 1;
    }

    /// Push a block onto the pending list. Any thread.
    unsafe fn defer_block(page: *mut Page, block: *mut u8) {
        let pending = &(*page).pending;
        let b = block.cast::<FreeBlock>();
        let mut head = pending.load(Ordering::Relaxed);
        loop {
            (*b).next = head;
            match pending.compare_exchange_weak(head, b, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => return,
                Err(h) => head = h,
            }
        }
    }

    /// Detach the pending list and splice it into the local free list.
    /// Owner thread only.
    unsafe fn collect(page: *mut Page) {
        let mut block = (*page).pending.swap(ptr::null_mut(), Ordering::Acquire);
        while !block.is_null() {
            let next = (*block).next;
            Page::free_block(page, block.cast::<u8>());
            block = next;
        }
    }
}

/// Per-thread page caches, one free/filled list pair per size class.
struct PoolCache {
    free: [Vec<*mut Page>; NUM_CLASSES],
    filled: [Vec<*mut Page>; NUM_CLASSES],
    heartbeat: u64,
}

// Caches migrate between threads only through the spare-cache registry,
// never while in use.
unsafe impl Send for PoolCache {}

impl PoolCache {
    fn new() -> Self {
        Self {
            free: Default::default(),
            filled: Default::default(),
            heartbeat: 0,
        }
    }

    /// Take ownership of every page in the cache for the calling thread.
    fn adopt(&mut self, owner: u32) {
        self.heartbeat = 0;
        for class in 0..NUM_CLASSES {
            for &page in self.free[class].iter().chain(self.filled[class].iter()) {
                unsafe { (*page).owner.store(owner, Ordering::Relaxed) };
            }
        }
    }

    fn allocate(&mut self, size: usize) -> NonNull<u8> {
        let aligned = ((size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)).max(BLOCK_ALIGN);
        let class = (aligned >> CLASS_SHIFT) - 1;
        self.heartbeat += 1;

        if self.free[class].is_empty() && self.heartbeat >= HEARTBEAT_PERIOD {
            self.collect_class(class);
            self.heartbeat = 0;
        }
        let page = match self.free[class].last().copied() {
            Some(page) => page,
            None => self.grow(class, aligned as u32),
        };
        unsafe {
            let block = Page::alloc_block(page);
            if !Page::has_space(page) {
                self.free[class].pop();
                self.filled[class].push(page);
            }
            NonNull::new_unchecked(block)
        }
    }

    /// Drain the pending lists of the class's filled pages, moving pages
    /// with space back onto the free list.
    fn collect_class(&mut self, class: usize) {
        let mut i = 0;
        while i < self.filled[class].len() {
            let page = self.filled[class][i];
            unsafe { Page::collect(page) };
            if unsafe { Page::has_space(page) } {
                self.filled[class].swap_remove(i);
                self.free[class].push(page);
            } else {
                i += 1;
            }
        }
    }

    fn collect_all(&mut self) {
        for class in 0..NUM_CLASSES {
            self.collect_class(class);
        }
    }

    /// Allocate one fresh page for `class` from the host allocator.
    fn grow(&mut self, class: usize, block_size: u32) -> *mut Page {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE)
            .expect("page size is a power of two");
        let raw = unsafe { alloc::alloc(layout) };
        if raw.is_null() {
            handle_alloc_error(layout);
        }
        let page = raw.cast::<Page>();
        unsafe { Page::init(page, block_size) };
        self.free[class].push(page);
        page
    }
}

/// Caches of exited threads, waiting for a new thread to adopt them.
static SPARE_CACHES: SpinMutex<Vec<Box<PoolCache>>> = SpinMutex::new(Vec::new());

struct CacheHandle {
    cache: *mut PoolCache,
}

impl CacheHandle {
    fn acquire() -> Self {
        let mut cache = SPARE_CACHES
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(PoolCache::new()));
        cache.adopt(tid::current());
        Self {
            cache: Box::into_raw(cache),
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        let mut cache = unsafe { Box::from_raw(self.cache) };
        cache.collect_all();
        // Frees that race with the handover must take the deferred path.
        cache.adopt(tid::UNASSIGNED);
        SPARE_CACHES.lock().push(cache);
    }
}

thread_local! {
    static CACHE: CacheHandle = CacheHandle::acquire();
}

fn with_cache<R>(f: impl FnOnce(&mut PoolCache) -> R) -> R {
    CACHE.with(|handle| f(unsafe { &mut *handle.cache }))
}

#[inline]
fn is_pooled(layout: Layout) -> bool {
    layout.size() <= MAX_BLOCK_SIZE && layout.align() <= BLOCK_ALIGN
}

fn host_alloc(layout: Layout) -> NonNull<u8> {
    debug_assert!(layout.size() > 0);
    let raw = unsafe { alloc::alloc(layout) };
    match NonNull::new(raw) {
        Some(block) => block,
        None => handle_alloc_error(layout),
    }
}

/// Allocate a block for `layout`.
///
/// Requests up to [`MAX_BLOCK_SIZE`] bytes with at most [`BLOCK_ALIGN`]
/// alignment are served from the calling thread's page cache; anything
/// else goes to the host allocator. Never returns null: allocation failure
/// aborts via [`handle_alloc_error`].
pub fn allocate(layout: Layout) -> NonNull<u8> {
    if !is_pooled(layout) {
        return host_alloc(layout);
    }
    with_cache(|cache| cache.allocate(layout.size()))
}

/// Free a block previously returned by [`allocate`] with the same layout.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] with this exact `layout` and must not
/// be freed twice.
pub unsafe fn free(ptr: NonNull<u8>, layout: Layout) {
    if !is_pooled(layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
        return;
    }
    let page = (ptr.as_ptr() as usize & !(PAGE_SIZE - 1)) as *mut Page;
    if (*page).owner.load(Ordering::Relaxed) == tid::current() {
        Page::free_block(page, ptr.as_ptr());
    } else {
        Page::defer_block(page, ptr.as_ptr());
    }
}

/// Splice cross-thread deferred frees back into the calling thread's
/// pages. A no-op when nothing was freed remotely.
pub fn collect() {
    with_cache(PoolCache::collect_all);
}

/// Allocate backing memory for a container node.
#[cfg(feature = "pool")]
#[inline]
pub(crate) fn alloc_raw(layout: Layout) -> NonNull<u8> {
    allocate(layout)
}

/// Allocate backing memory for a container node.
#[cfg(not(feature = "pool"))]
#[inline]
pub(crate) fn alloc_raw(layout: Layout) -> NonNull<u8> {
    host_alloc(layout)
}

/// Release a container node's backing memory.
#[cfg(feature = "pool")]
#[inline]
pub(crate) unsafe fn free_raw(ptr: NonNull<u8>, layout: Layout) {
    free(ptr, layout);
}

/// Release a container node's backing memory.
#[cfg(not(feature = "pool"))]
#[inline]
pub(crate) unsafe fn free_raw(ptr: NonNull<u8>, layout: Layout) {
    alloc::dealloc(ptr.as_ptr(), layout);
}
