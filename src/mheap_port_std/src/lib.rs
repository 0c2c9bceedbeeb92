//! Hosted backend for `mheap`
//!
//! This crate supplies the collaborators a heap consumes from its
//! environment: a lock that can be shared between threads ([`SpinLock`]), a
//! task identity that tags each OS thread ([`ThreadTaskIdentity`]), a
//! corruption handler that aborts the process ([`abort_on_corruption`]), and
//! a source of non-overlapping heap regions ([`host_region`]).
#![deny(unsafe_op_in_unsafe_fn)]
use mheap::{
    CorruptionReport, HeapConfig, HeapLock, MemoryRegion, MultiHeap, PoisonConfig, PoisonedHeap,
    RegisterError, TaskIdentity, TaskTag,
};
use spin::Mutex as SpinMutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

#[doc(hidden)]
pub extern crate env_logger;

/// A [`MultiHeap`] that can be shared between threads.
pub type SharedHeap = MultiHeap<SpinLock>;

/// A [`PoisonedHeap`] that can be shared between threads.
pub type SharedPoisonedHeap = PoisonedHeap<SpinLock>;

/// A [`HeapLock`] backed by a spinning mutex.
#[derive(Debug, Default)]
pub struct SpinLock {
    mutex: SpinMutex<()>,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            mutex: SpinMutex::new(()),
        }
    }
}

// Safety: `SpinMutex` provides mutual exclusion across threads
unsafe impl HeapLock for SpinLock {
    #[inline]
    fn acquire(&self) {
        // Released by `release`
        core::mem::forget(self.mutex.lock());
    }

    #[inline]
    unsafe fn release(&self) {
        // Safety: The caller holds the lock
        unsafe { self.mutex.force_unlock() };
    }
}

static NEXT_THREAD_TAG: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static THREAD_TAG: usize = NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed);
}

/// A [`TaskIdentity`] that assigns a distinct [`TaskTag`] to each OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadTaskIdentity;

impl ThreadTaskIdentity {
    /// Get the tag of the calling thread.
    pub fn current() -> Option<TaskTag> {
        THREAD_TAG.with(|&tag| TaskTag::new(tag))
    }
}

impl TaskIdentity for ThreadTaskIdentity {
    #[inline]
    fn current_task(&self) -> Option<TaskTag> {
        Self::current()
    }
}

/// A [`CorruptionHandler`](mheap::CorruptionHandler) that logs the report and
/// aborts the process.
pub fn abort_on_corruption(report: &CorruptionReport) -> ! {
    log::error!("{}", report);
    eprintln!("{}", report);
    std::process::abort()
}

/// Install `env_logger` as the logger. Does nothing if a logger is already
/// installed.
pub fn init_logger() {
    let _ = env_logger::try_init();
}

/// The address assigned to the first region returned by [`host_region`].
pub const HOST_REGION_BASE: usize = 0x3fc8_0000;

/// The granularity of the addresses assigned by [`host_region`].
const HOST_REGION_ALIGN: usize = 0x1_0000;

static NEXT_REGION_BASE: AtomicUsize = AtomicUsize::new(HOST_REGION_BASE);

/// Allocate a zero-filled region of `len` bytes at an address not used by any
/// other region returned by this function in this process.
///
/// Returns `None` if the address space is exhausted.
pub fn host_region(len: usize) -> Option<MemoryRegion> {
    let span = len.checked_add(2 * HOST_REGION_ALIGN - 1)? & !(HOST_REGION_ALIGN - 1);
    let base = NEXT_REGION_BASE.fetch_add(span, Ordering::Relaxed);
    base.checked_add(span)?;
    MemoryRegion::new(base, len)
}

/// Register a thread-safe heap over a fresh host region.
pub fn shared_heap(len: usize, config: HeapConfig) -> Result<SharedHeap, RegisterError> {
    let region = host_region(len).ok_or(RegisterError::BadParam)?;
    MultiHeap::register_with(region, SpinLock::new(), config)
}

/// Register a thread-safe poisoned heap over a fresh host region. Owners are
/// tracked by [`ThreadTaskIdentity`].
pub fn shared_poisoned_heap(
    len: usize,
    mut config: PoisonConfig,
) -> Result<SharedPoisonedHeap, RegisterError> {
    let region = host_region(len).ok_or(RegisterError::BadParam)?;
    config.track_owner = true;
    config.task_identity = Arc::new(ThreadTaskIdentity);
    PoisonedHeap::register_with(region, SpinLock::new(), config)
}
