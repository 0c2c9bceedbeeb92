//! Heap locking mechanism
use core::{
    cell::{Cell, UnsafeCell},
    fmt,
    marker::PhantomData,
    ops,
    sync::atomic::{AtomicBool, Ordering},
};

/// The lock primitive guarding a heap's control structure.
///
/// The heap acquires the lock for exactly the duration of one engine call and
/// never holds it across calls.
///
/// # Safety
///
/// Between a return from [`acquire`] and the matching call to [`release`],
/// no other call to `acquire` on the same lock may return. If the
/// implementing type is `Sync`, this must hold across threads.
///
/// [`acquire`]: Self::acquire
/// [`release`]: Self::release
pub unsafe trait HeapLock {
    /// Block until the lock is available and take it.
    fn acquire(&self);

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller.
    unsafe fn release(&self);
}

/// A [`HeapLock`] that does nothing.
///
/// This corresponds to a heap registered without a lock handle. It's `!Sync`,
/// so the heap using it can only be accessed from one thread.
#[derive(Default)]
pub struct NullLock {
    _not_sync: PhantomData<Cell<()>>,
}

impl NullLock {
    pub const fn new() -> Self {
        Self {
            _not_sync: PhantomData,
        }
    }
}

impl fmt::Debug for NullLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("NullLock")
    }
}

// Safety: `NullLock` is `!Sync`, and `LockCell` rejects nested acquisition
// from the same thread.
unsafe impl HeapLock for NullLock {
    #[inline]
    fn acquire(&self) {}

    #[inline]
    unsafe fn release(&self) {}
}

/// Cell type whose contents can only be accessed while the contained
/// [`HeapLock`] is held.
pub(crate) struct LockCell<T, L> {
    lock: L,
    /// Set while a [`LockCellGuard`] exists. Catches nested acquisition,
    /// which the heap does not support.
    held: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: Access to `data` is serialized by `lock` (upheld by `HeapLock`'s
// contract) and `held`.
unsafe impl<T: Send, L: HeapLock + Sync> Sync for LockCell<T, L> {}
unsafe impl<T: Send, L: HeapLock + Send> Send for LockCell<T, L> {}

impl<T, L: HeapLock> LockCell<T, L> {
    pub(crate) const fn new(lock: L, x: T) -> Self {
        Self {
            lock,
            held: AtomicBool::new(false),
            data: UnsafeCell::new(x),
        }
    }

    /// Acquire the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock is already held by the current call path and `L`
    /// doesn't block (e.g., [`NullLock`]). A blocking `L` deadlocks instead.
    pub(crate) fn lock(&self) -> LockCellGuard<'_, T, L> {
        self.lock.acquire();
        if self.held.swap(true, Ordering::Acquire) {
            // Safety: We just acquired it
            unsafe { self.lock.release() };
            panic!("heap lock is not reentrant");
        }
        LockCellGuard { cell: self }
    }

    /// Replace the lock.
    pub(crate) fn set_lock(&mut self, lock: L) {
        self.lock = lock;
    }
}

impl<T: fmt::Debug, L: HeapLock> fmt::Debug for LockCell<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.held.load(Ordering::Relaxed) {
            f.write_str("LockCell(< locked >)")
        } else {
            f.debug_tuple("LockCell").field(&*self.lock()).finish()
        }
    }
}

/// RAII guard for [`LockCell`]. Releases the lock on drop.
pub(crate) struct LockCellGuard<'a, T, L: HeapLock> {
    cell: &'a LockCell<T, L>,
}

impl<T, L: HeapLock> ops::Deref for LockCellGuard<'_, T, L> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        // Safety: We hold the lock
        unsafe { &*self.cell.data.get() }
    }
}

impl<T, L: HeapLock> ops::DerefMut for LockCellGuard<'_, T, L> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: We hold the lock
        unsafe { &mut *self.cell.data.get() }
    }
}

impl<T, L: HeapLock> Drop for LockCellGuard<'_, T, L> {
    #[inline]
    fn drop(&mut self) {
        self.cell.held.store(false, Ordering::Release);
        // Safety: We hold the lock
        unsafe { self.cell.lock.release() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingLock {
        acquired: Cell<usize>,
        released: Cell<usize>,
    }

    unsafe impl HeapLock for CountingLock {
        fn acquire(&self) {
            self.acquired.set(self.acquired.get() + 1);
        }

        unsafe fn release(&self) {
            self.released.set(self.released.get() + 1);
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let cell = LockCell::new(CountingLock::default(), 42u32);
        {
            let mut guard = cell.lock();
            *guard += 1;
            assert_eq!(cell.lock.acquired.get(), 1);
            assert_eq!(cell.lock.released.get(), 0);
        }
        assert_eq!(cell.lock.released.get(), 1);
        assert_eq!(*cell.lock(), 43);
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn nested_lock_panics() {
        let cell = LockCell::new(NullLock::new(), ());
        let _outer = cell.lock();
        let _inner = cell.lock();
    }

    #[test]
    fn debug_does_not_deadlock_while_held() {
        let cell = LockCell::new(NullLock::new(), 7);
        let guard = cell.lock();
        assert_eq!(format!("{:?}", cell), "LockCell(< locked >)");
        drop(guard);
        assert_eq!(format!("{:?}", cell), "LockCell(7)");
    }
}
