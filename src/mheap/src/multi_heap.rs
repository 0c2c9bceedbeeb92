//! A lockable heap over a single registered region, with byte accounting
use core::{fmt, ops::Range};

use crate::{
    arena::{HeapPtr, MemoryRegion},
    error::{
        panic_on_corruption, AllocError, CorruptionHandler, CorruptionKind, IntegrityError,
        RegisterError,
    },
    heap::{Allocation, Heap, HeapInfo},
    lock::{HeapLock, LockCell, LockCellGuard, NullLock},
    tlsf::{BlockInfo, Tlsf, TlsfConfig, ALLOC_OVERHEAD},
};

#[cfg(test)]
mod tests;

/// Per-heap parameters fixed at registration.
#[derive(Clone, Copy)]
pub struct HeapConfig {
    /// Invoked when heap corruption is detected. Must not return.
    pub on_corruption: CorruptionHandler,
    /// The byte painted over free memory, if any.
    pub free_fill: Option<u8>,
    /// The size-class parameters. Derived from the region size if `None`.
    pub tlsf: Option<TlsfConfig>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            on_corruption: panic_on_corruption,
            free_fill: None,
            tlsf: None,
        }
    }
}

impl fmt::Debug for HeapConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HeapConfig")
            .field("free_fill", &self.free_fill)
            .field("tlsf", &self.tlsf)
            .finish_non_exhaustive()
    }
}

/// The lock-protected part of [`MultiHeap`].
#[derive(Debug)]
pub(crate) struct HeapState {
    tlsf: Tlsf,
    start: usize,
    end: usize,
    pool_size: usize,
    free_bytes: usize,
    minimum_free_bytes: usize,
}

impl HeapState {
    #[inline]
    pub(crate) fn tlsf(&self) -> &Tlsf {
        &self.tlsf
    }

    #[inline]
    pub(crate) fn tlsf_mut(&mut self) -> &mut Tlsf {
        &mut self.tlsf
    }

    #[inline]
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub(crate) fn minimum_free_bytes(&self) -> usize {
        self.minimum_free_bytes
    }

    #[inline]
    pub(crate) fn contains(&self, ptr: HeapPtr) -> bool {
        (self.start..self.end).contains(&ptr.addr())
    }

    /// Escalate a pointer outside of this heap as corruption.
    fn validate(&self, ptr: HeapPtr) {
        if !self.contains(ptr) {
            self.tlsf.corrupt(CorruptionKind::OutOfBounds, ptr.addr());
        }
    }

    /// Account for a newly allocated block.
    fn charge(&mut self, ptr: HeapPtr) {
        self.free_bytes -= self.tlsf.block_size(ptr) + ALLOC_OVERHEAD;
        self.minimum_free_bytes = self.minimum_free_bytes.min(self.free_bytes);
    }

    pub(crate) fn malloc(&mut self, size: usize) -> Result<HeapPtr, AllocError> {
        if size > self.pool_size {
            return Err(AllocError::NoMemory);
        }
        let ptr = self.tlsf.malloc(size)?;
        self.charge(ptr);
        Ok(ptr)
    }

    pub(crate) fn aligned_alloc_offs(
        &mut self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(AllocError::BadParam);
        }
        if size > self.pool_size {
            return Err(AllocError::NoMemory);
        }
        let ptr = self.tlsf.memalign_offs(align, size, offset)?;
        self.charge(ptr);
        Ok(ptr)
    }

    pub(crate) fn free(&mut self, ptr: HeapPtr) {
        self.validate(ptr);
        let size = self.tlsf.block_size(ptr);
        self.tlsf.free(ptr);
        self.free_bytes += size + ALLOC_OVERHEAD;
    }

    pub(crate) fn realloc(
        &mut self,
        ptr: Option<HeapPtr>,
        size: usize,
    ) -> Result<Option<HeapPtr>, AllocError> {
        let ptr = match ptr {
            None => return self.malloc(size).map(Some),
            Some(ptr) => ptr,
        };
        self.validate(ptr);
        if size == 0 {
            self.free(ptr);
            return Ok(None);
        }
        if size > self.pool_size {
            return Err(AllocError::NoMemory);
        }

        let old_size = self.tlsf.block_size(ptr);
        let new_ptr = match self.tlsf.realloc(Some(ptr), size)? {
            Some(x) => x,
            None => return Ok(None),
        };
        let new_size = self.tlsf.block_size(new_ptr);
        self.free_bytes = self.free_bytes + old_size - new_size;
        self.minimum_free_bytes = self.minimum_free_bytes.min(self.free_bytes);
        Ok(Some(new_ptr))
    }

    pub(crate) fn get_allocated_size(&self, ptr: HeapPtr) -> usize {
        self.validate(ptr);
        self.tlsf.block_size(ptr)
    }

    pub(crate) fn get_info(&self) -> HeapInfo {
        let mut info = HeapInfo {
            total_free_bytes: self.free_bytes,
            minimum_free_bytes: self.minimum_free_bytes,
            ..HeapInfo::default()
        };
        self.tlsf.walk(|block| {
            if block.used {
                info.allocated_blocks += 1;
                info.total_allocated_bytes += block.size;
            } else {
                info.free_blocks += 1;
                info.largest_free_block = info.largest_free_block.max(block.size);
            }
            true
        });
        info.total_blocks = info.allocated_blocks + info.free_blocks;
        info.largest_free_block = self.tlsf.fit_size(info.largest_free_block);
        info
    }

    /// Run the engine's validators plus `hook` for every block, and check the
    /// free byte count against the free blocks.
    pub(crate) fn check_with(
        &self,
        print_errors: bool,
        mut hook: impl FnMut(&Tlsf, &BlockInfo) -> Result<(), IntegrityError>,
    ) -> bool {
        let report = |e: IntegrityError| {
            if print_errors {
                log::error!("{}", e);
            }
            false
        };

        if let Err(e) = self.tlsf.check() {
            return report(e);
        }

        let mut free_total = 0;
        for pool in self.tlsf.pools() {
            let result = self.tlsf.check_pool(pool, |tlsf, block| {
                if !block.used {
                    free_total += block.size + ALLOC_OVERHEAD;
                }
                hook(tlsf, block)
            });
            if let Err(e) = result {
                return report(e);
            }
        }

        if free_total != self.free_bytes {
            return report(IntegrityError {
                what: "free byte count disagrees with the free blocks",
                address: self.start,
            });
        }
        true
    }

    pub(crate) fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(out, "Heap at {:#x}..{:#x}", self.start, self.end)?;
        let mut result = Ok(());
        self.tlsf.walk(|block| {
            result = writeln!(
                out,
                "Block {} size {} {}",
                block.ptr,
                block.size,
                if block.used { "used" } else { "free" }
            );
            result.is_ok()
        });
        result?;
        writeln!(
            out,
            "free {} minimum free {} pool size {}",
            self.free_bytes, self.minimum_free_bytes, self.pool_size
        )
    }

    /// Compute the address `ptr + offset`, escalating an overflow as
    /// corruption.
    pub(crate) fn offset(&self, ptr: HeapPtr, offset: usize) -> usize {
        match ptr.addr().checked_add(offset) {
            Some(x) => x,
            None => self.tlsf.corrupt(CorruptionKind::OutOfBounds, ptr.addr()),
        }
    }
}

/// A heap over one registered region, guarded by a lock of type `L`.
///
/// Every operation holds the lock for the duration of exactly one engine call.
/// The lock is not reentrant: calling back into the same heap from a visitor
/// panics.
///
/// The byte accounting satisfies
/// `free_size() + Σ (block size + ALLOC_OVERHEAD) + control_overhead() ==
/// pool_size()` at all times, where the sum is over live allocations.
pub struct MultiHeap<L: HeapLock = NullLock> {
    state: LockCell<HeapState, L>,
    start: usize,
    end: usize,
    pool_size: usize,
    control_overhead: usize,
}

impl<L: HeapLock> fmt::Debug for MultiHeap<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MultiHeap")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("state", &self.state)
            .finish()
    }
}

impl MultiHeap<NullLock> {
    /// Register a heap without a lock. The heap can only be used by one
    /// thread.
    pub fn register(region: MemoryRegion) -> Result<Self, RegisterError> {
        Self::register_with(region, NullLock::new(), HeapConfig::default())
    }
}

impl<L: HeapLock> MultiHeap<L> {
    /// Register a heap over `region`.
    ///
    /// Fails if the region cannot hold the pool overhead and one minimal
    /// block.
    pub fn register_with(
        region: MemoryRegion,
        lock: L,
        config: HeapConfig,
    ) -> Result<Self, RegisterError> {
        let (start, end, pool_size) = (region.start(), region.end(), region.len());
        let tlsf_config = match config.tlsf {
            Some(x) => x,
            None => TlsfConfig::for_pool_size(pool_size).ok_or(RegisterError::BadParam)?,
        };
        let control_overhead = Tlsf::pool_overhead_of(&region)
            .ok_or(RegisterError::BadParam)?
            - ALLOC_OVERHEAD;

        let mut tlsf = Tlsf::new(tlsf_config, config.on_corruption);
        tlsf.set_free_fill(config.free_fill);
        tlsf.add_pool(region)?;

        let free_bytes = pool_size - control_overhead;
        log::debug!(
            "registered heap {:#x}..{:#x} ({} bytes free)",
            start,
            end,
            free_bytes
        );

        Ok(Self {
            state: LockCell::new(
                lock,
                HeapState {
                    tlsf,
                    start,
                    end,
                    pool_size,
                    free_bytes,
                    minimum_free_bytes: free_bytes,
                },
            ),
            start,
            end,
            pool_size,
            control_overhead,
        })
    }

    /// Replace the lock.
    pub fn set_lock(&mut self, lock: L) {
        self.state.set_lock(lock);
    }

    /// Acquire the lock and access the state.
    pub(crate) fn lock(&self) -> LockCellGuard<'_, HeapState, L> {
        self.state.lock()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// The address one past the end of the region.
    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// The number of bytes of the region never available for allocation.
    #[inline]
    pub fn control_overhead(&self) -> usize {
        self.control_overhead
    }

    pub fn malloc(&self, size: usize) -> Result<HeapPtr, AllocError> {
        let result = self.lock().malloc(size);
        log::trace!("malloc({}) = {:?}", size, result);
        result
    }

    pub fn aligned_alloc(&self, size: usize, align: usize) -> Result<HeapPtr, AllocError> {
        self.aligned_alloc_offs(size, align, 0)
    }

    pub fn aligned_alloc_offs(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError> {
        let result = self.lock().aligned_alloc_offs(size, align, offset);
        log::trace!(
            "aligned_alloc_offs({}, {}, {}) = {:?}",
            size,
            align,
            offset,
            result
        );
        result
    }

    pub fn free(&self, ptr: Option<HeapPtr>) {
        log::trace!("free({:?})", ptr);
        if let Some(ptr) = ptr {
            self.lock().free(ptr);
        }
    }

    pub fn realloc(
        &self,
        ptr: Option<HeapPtr>,
        size: usize,
    ) -> Result<Option<HeapPtr>, AllocError> {
        let result = self.lock().realloc(ptr, size);
        log::trace!("realloc({:?}, {}) = {:?}", ptr, size, result);
        result
    }

    pub fn get_allocated_size(&self, ptr: HeapPtr) -> usize {
        self.lock().get_allocated_size(ptr)
    }

    pub fn free_size(&self) -> usize {
        self.lock().free_bytes()
    }

    pub fn minimum_free_size(&self) -> usize {
        self.lock().minimum_free_bytes()
    }

    /// Restore the watermark to the current free byte count.
    pub fn reset_minimum_free_bytes(&self) {
        let mut state = self.lock();
        state.minimum_free_bytes = state.free_bytes;
    }

    pub fn get_info(&self) -> HeapInfo {
        self.lock().get_info()
    }

    pub fn check(&self, print_errors: bool) -> bool {
        self.lock().check_with(print_errors, |_, _| Ok(()))
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.lock().dump(out)
    }

    /// [`Self::dump`] to the log at the `info` level.
    pub fn dump_log(&self) {
        let mut text = String::new();
        if self.dump(&mut text).is_ok() {
            for line in text.lines() {
                log::info!("{}", line);
            }
        }
    }

    /// Call `f` for every block in address order until it returns `false`.
    pub fn walk(&self, f: impl FnMut(&BlockInfo) -> bool) {
        self.lock().tlsf().walk(f);
    }

    #[inline]
    pub fn contains(&self, ptr: HeapPtr) -> bool {
        (self.start..self.end).contains(&ptr.addr())
    }

    pub fn read(&self, ptr: HeapPtr, offset: usize, buf: &mut [u8]) {
        let state = self.lock();
        let addr = state.offset(ptr, offset);
        buf.copy_from_slice(state.tlsf().bytes(addr, buf.len()));
    }

    pub fn write(&self, ptr: HeapPtr, offset: usize, data: &[u8]) {
        let mut state = self.lock();
        let addr = state.offset(ptr, offset);
        state.tlsf_mut().bytes_mut(addr, data.len()).copy_from_slice(data);
    }

    pub fn fill(&self, ptr: HeapPtr, offset: usize, len: usize, byte: u8) {
        let mut state = self.lock();
        let addr = state.offset(ptr, offset);
        state.tlsf_mut().fill(addr, len, byte);
    }
}

impl<L: HeapLock> Heap for MultiHeap<L> {
    fn malloc(&self, size: usize) -> Result<HeapPtr, AllocError> {
        MultiHeap::malloc(self, size)
    }

    fn aligned_alloc_offs(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError> {
        MultiHeap::aligned_alloc_offs(self, size, align, offset)
    }

    fn free(&self, ptr: Option<HeapPtr>) {
        MultiHeap::free(self, ptr)
    }

    fn realloc(&self, ptr: Option<HeapPtr>, size: usize) -> Result<Option<HeapPtr>, AllocError> {
        MultiHeap::realloc(self, ptr, size)
    }

    fn get_allocated_size(&self, ptr: HeapPtr) -> usize {
        MultiHeap::get_allocated_size(self, ptr)
    }

    fn free_size(&self) -> usize {
        MultiHeap::free_size(self)
    }

    fn minimum_free_size(&self) -> usize {
        MultiHeap::minimum_free_size(self)
    }

    fn get_info(&self) -> HeapInfo {
        MultiHeap::get_info(self)
    }

    fn check(&self, print_errors: bool) -> bool {
        MultiHeap::check(self, print_errors)
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        MultiHeap::dump(self, out)
    }

    fn contains(&self, ptr: HeapPtr) -> bool {
        MultiHeap::contains(self, ptr)
    }

    fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    fn read(&self, ptr: HeapPtr, offset: usize, buf: &mut [u8]) {
        MultiHeap::read(self, ptr, offset, buf)
    }

    fn write(&self, ptr: HeapPtr, offset: usize, data: &[u8]) {
        MultiHeap::write(self, ptr, offset, data)
    }

    fn for_each_allocation(&self, f: &mut dyn FnMut(&Allocation)) {
        self.walk(|block| {
            if block.used {
                f(&Allocation {
                    ptr: block.ptr,
                    size: block.size,
                    owner: None,
                });
            }
            true
        });
    }
}
