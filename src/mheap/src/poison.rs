//! Heap poisoning: canaries around every allocation and fill patterns over
//! free and fresh memory
//!
//! ```text
//!  block payload
//!  +--------------+-------------+--------------+------------------+--------+
//!  | head canary  | owner word  | size word    | user bytes       | tail   |
//!  | (word)       | (optional)  | (requested)  |                  | canary |
//!  +--------------+-------------+--------------+------------------+--------+
//!                                              ^ returned pointer   ^ 4 bytes,
//!                                                                    unaligned
//! ```
use core::{fmt, ops::Range};
use std::sync::Arc;

use crate::{
    arena::{HeapPtr, MemoryRegion, WORD},
    error::{AllocError, CorruptionKind, IntegrityError, RegisterError},
    heap::{Allocation, Heap, HeapInfo},
    lock::{HeapLock, NullLock},
    multi_heap::{HeapConfig, HeapState, MultiHeap},
    task::{NoTaskIdentity, TaskIdentity, TaskTag},
    tlsf::{BlockInfo, Tlsf},
};

#[cfg(test)]
mod tests;

pub const HEAD_CANARY_PATTERN: u32 = 0xabba_1234;
pub const TAIL_CANARY_PATTERN: u32 = 0xbaad_5678;
/// Painted over free memory in [`PoisonMode::Comprehensive`].
pub const FREE_FILL_PATTERN: u8 = 0xfe;
/// Painted over freshly allocated memory in [`PoisonMode::Comprehensive`].
pub const MALLOC_FILL_PATTERN: u8 = 0xce;

const TAIL_SIZE: usize = core::mem::size_of::<u32>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoisonMode {
    /// Canaries only.
    Light,
    /// Canaries, plus fill patterns verified on allocation and by
    /// [`PoisonedHeap::check`].
    Comprehensive,
}

#[derive(Clone)]
pub struct PoisonConfig {
    pub mode: PoisonMode,
    /// Record the allocating task in every allocation's head.
    pub track_owner: bool,
    pub task_identity: Arc<dyn TaskIdentity>,
    /// The configuration of the wrapped heap. `free_fill` is overridden
    /// according to `mode`.
    pub heap: HeapConfig,
}

impl Default for PoisonConfig {
    fn default() -> Self {
        Self {
            mode: PoisonMode::Light,
            track_owner: false,
            task_identity: Arc::new(NoTaskIdentity),
            heap: HeapConfig::default(),
        }
    }
}

impl fmt::Debug for PoisonConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoisonConfig")
            .field("mode", &self.mode)
            .field("track_owner", &self.track_owner)
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

/// The contents of a verified poison head.
#[derive(Debug, Clone, Copy)]
struct Head {
    addr: usize,
    owner: Option<TaskTag>,
    size: usize,
}

/// A [`MultiHeap`] that surrounds every allocation with canaries.
///
/// Corrupted canaries found by `free` or `realloc` are escalated through the
/// heap's corruption handler. Sizes and statistics exclude the
/// instrumentation overhead.
pub struct PoisonedHeap<L: HeapLock = NullLock> {
    inner: MultiHeap<L>,
    mode: PoisonMode,
    track_owner: bool,
    task_identity: Arc<dyn TaskIdentity>,
}

impl<L: HeapLock> fmt::Debug for PoisonedHeap<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoisonedHeap")
            .field("mode", &self.mode)
            .field("track_owner", &self.track_owner)
            .field("inner", &self.inner)
            .finish()
    }
}

fn try_read_word(tlsf: &Tlsf, addr: usize) -> Option<usize> {
    let bytes = tlsf.get(addr, WORD)?;
    let mut word = [0u8; WORD];
    word.copy_from_slice(bytes);
    Some(usize::from_ne_bytes(word))
}

fn try_read_tail(tlsf: &Tlsf, addr: usize) -> Option<u32> {
    let bytes = tlsf.get(addr, TAIL_SIZE)?;
    let mut tail = [0u8; TAIL_SIZE];
    tail.copy_from_slice(bytes);
    Some(u32::from_le_bytes(tail))
}

impl PoisonedHeap<NullLock> {
    /// Register a heap without a lock.
    pub fn register(region: MemoryRegion, config: PoisonConfig) -> Result<Self, RegisterError> {
        Self::register_with(region, NullLock::new(), config)
    }
}

impl<L: HeapLock> PoisonedHeap<L> {
    /// Register a heap over `region`. In [`PoisonMode::Comprehensive`], the
    /// whole region is painted with [`FREE_FILL_PATTERN`].
    pub fn register_with(
        region: MemoryRegion,
        lock: L,
        config: PoisonConfig,
    ) -> Result<Self, RegisterError> {
        let heap_config = HeapConfig {
            free_fill: match config.mode {
                PoisonMode::Light => None,
                PoisonMode::Comprehensive => Some(FREE_FILL_PATTERN),
            },
            ..config.heap
        };
        Ok(Self {
            inner: MultiHeap::register_with(region, lock, heap_config)?,
            mode: config.mode,
            track_owner: config.track_owner,
            task_identity: config.task_identity,
        })
    }

    #[inline]
    pub fn inner(&self) -> &MultiHeap<L> {
        &self.inner
    }

    pub fn set_lock(&mut self, lock: L) {
        self.inner.set_lock(lock);
    }

    #[inline]
    pub fn mode(&self) -> PoisonMode {
        self.mode
    }

    /// The size of the head preceding every user pointer.
    #[inline]
    pub fn head_size(&self) -> usize {
        if self.track_owner {
            3 * WORD
        } else {
            2 * WORD
        }
    }

    /// The number of bytes every allocation spends on canaries and metadata.
    #[inline]
    pub fn overhead(&self) -> usize {
        self.head_size() + TAIL_SIZE
    }

    #[inline]
    fn size_offset(&self) -> usize {
        self.head_size() - WORD
    }

    /// Write the head and the tail around a block at `head`. Returns the user
    /// pointer.
    fn poison(&self, state: &mut HeapState, head: HeapPtr, size: usize) -> HeapPtr {
        let addr = head.addr();
        let tlsf = state.tlsf_mut();
        tlsf.write_word(addr, HEAD_CANARY_PATTERN as usize);
        if self.track_owner {
            let owner = self.task_identity.current_task().map_or(0, TaskTag::get);
            tlsf.write_word(addr + WORD, owner);
        }
        tlsf.write_word(addr + self.size_offset(), size);
        let user = addr + self.head_size();
        tlsf.bytes_mut(user + size, TAIL_SIZE)
            .copy_from_slice(&TAIL_CANARY_PATTERN.to_le_bytes());
        match HeapPtr::new(user) {
            Some(x) => x,
            None => tlsf.corrupt(CorruptionKind::BadHeader, addr),
        }
    }

    /// Parse and validate the head at `addr`. `block_size` bounds the
    /// recorded size.
    fn read_head(
        &self,
        tlsf: &Tlsf,
        addr: usize,
        block_size: usize,
    ) -> Result<Head, (CorruptionKind, usize)> {
        let canary = try_read_word(tlsf, addr).ok_or((CorruptionKind::OutOfBounds, addr))?;
        if canary != HEAD_CANARY_PATTERN as usize {
            return Err((CorruptionKind::BadHeadCanary, addr));
        }
        let owner = if self.track_owner {
            let word = try_read_word(tlsf, addr + WORD)
                .ok_or((CorruptionKind::OutOfBounds, addr))?;
            TaskTag::new(word)
        } else {
            None
        };
        let size = try_read_word(tlsf, addr + self.size_offset())
            .ok_or((CorruptionKind::OutOfBounds, addr))?;
        if size > block_size.saturating_sub(self.overhead()) {
            return Err((CorruptionKind::BadHeadCanary, addr));
        }
        let tail_addr = addr + self.head_size() + size;
        let tail = try_read_tail(tlsf, tail_addr).ok_or((CorruptionKind::OutOfBounds, tail_addr))?;
        if tail != TAIL_CANARY_PATTERN {
            return Err((CorruptionKind::BadTailCanary, tail_addr));
        }
        Ok(Head { addr, owner, size })
    }

    /// Locate and validate the head of the allocation at `ptr`, escalating any
    /// problem as corruption.
    fn verify_allocated(&self, state: &HeapState, ptr: HeapPtr) -> Head {
        let tlsf = state.tlsf();
        let head = match ptr.checked_sub(self.head_size()) {
            Some(x) if state.contains(x) => x,
            _ => tlsf.corrupt(CorruptionKind::OutOfBounds, ptr.addr()),
        };
        let block_size = state.get_allocated_size(head);
        match self.read_head(tlsf, head.addr(), block_size) {
            Ok(x) => x,
            Err((kind, addr)) => tlsf.corrupt(kind, addr),
        }
    }

    /// Check that `[addr, addr + len)` holds only `pattern`. Logs the first
    /// mismatch.
    fn verify_fill(tlsf: &Tlsf, addr: usize, len: usize, pattern: u8) -> bool {
        match tlsf.bytes(addr, len).iter().position(|&b| b != pattern) {
            None => true,
            Some(i) => {
                log::warn!(
                    "CORRUPT HEAP: invalid data at {:#x}: expected {:#04x}, got {:#04x}",
                    addr + i,
                    pattern,
                    tlsf.bytes(addr + i, 1)[0]
                );
                false
            }
        }
    }

    fn malloc_locked(&self, state: &mut HeapState, size: usize) -> Result<HeapPtr, AllocError> {
        if size == 0 {
            return Err(AllocError::BadParam);
        }
        let total = size
            .checked_add(self.overhead())
            .ok_or(AllocError::NoMemory)?;
        let head = state.malloc(total)?;
        self.prepare(state, head, size)
    }

    /// Verify and swap the fill pattern of a new block, then poison it.
    fn prepare(
        &self,
        state: &mut HeapState,
        head: HeapPtr,
        size: usize,
    ) -> Result<HeapPtr, AllocError> {
        if self.mode == PoisonMode::Comprehensive {
            let block_size = state.get_allocated_size(head);
            let tlsf = state.tlsf_mut();
            // A mismatch means the block was written after being freed
            Self::verify_fill(tlsf, head.addr(), block_size, FREE_FILL_PATTERN);
            tlsf.fill(head.addr(), block_size, MALLOC_FILL_PATTERN);
        }
        Ok(self.poison(state, head, size))
    }

    fn free_locked(&self, state: &mut HeapState, ptr: HeapPtr) {
        let head = self.verify_allocated(state, ptr);
        if self.mode == PoisonMode::Light {
            // Invalidate the canary so that a stale pointer is caught. In
            // comprehensive mode, the whole block is repainted by the engine.
            state.tlsf_mut().write_word(head.addr, 0);
        }
        match HeapPtr::new(head.addr) {
            Some(x) => state.free(x),
            None => state.tlsf().corrupt(CorruptionKind::BadHeader, head.addr),
        }
    }

    pub fn malloc(&self, size: usize) -> Result<HeapPtr, AllocError> {
        let result = self.malloc_locked(&mut self.inner.lock(), size);
        log::trace!("poisoned malloc({}) = {:?}", size, result);
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
        if size == 0 {
            return Err(AllocError::BadParam);
        }
        let total = size
            .checked_add(self.overhead())
            .ok_or(AllocError::NoMemory)?;
        let offset = offset
            .checked_add(self.head_size())
            .ok_or(AllocError::BadParam)?;
        let mut state = self.inner.lock();
        let head = state.aligned_alloc_offs(total, align, offset)?;
        let result = self.prepare(&mut state, head, size);
        log::trace!(
            "poisoned aligned_alloc_offs({}, {}, {}) = {:?}",
            size,
            align,
            offset,
            result
        );
        result
    }

    pub fn free(&self, ptr: Option<HeapPtr>) {
        log::trace!("poisoned free({:?})", ptr);
        if let Some(ptr) = ptr {
            self.free_locked(&mut self.inner.lock(), ptr);
        }
    }

    pub fn realloc(
        &self,
        ptr: Option<HeapPtr>,
        size: usize,
    ) -> Result<Option<HeapPtr>, AllocError> {
        let ptr = match ptr {
            None => return self.malloc(size).map(Some),
            Some(ptr) => ptr,
        };
        if size == 0 {
            self.free(Some(ptr));
            return Ok(None);
        }

        let mut state = self.inner.lock();
        let head = self.verify_allocated(&state, ptr);
        let result = match self.mode {
            PoisonMode::Light => {
                let total = size
                    .checked_add(self.overhead())
                    .ok_or(AllocError::NoMemory)?;
                let head_ptr = match HeapPtr::new(head.addr) {
                    Some(x) => x,
                    None => state.tlsf().corrupt(CorruptionKind::BadHeader, head.addr),
                };
                match state.realloc(Some(head_ptr), total)? {
                    Some(new_head) => Ok(Some(self.poison(&mut state, new_head, size))),
                    None => Ok(None),
                }
            }
            PoisonMode::Comprehensive => {
                // Slack left by an in-place resize can't be repainted
                // reliably, so always move
                let new_ptr = self.malloc_locked(&mut state, size)?;
                state
                    .tlsf_mut()
                    .copy(ptr.addr(), new_ptr.addr(), head.size.min(size));
                self.free_locked(&mut state, ptr);
                Ok(Some(new_ptr))
            }
        };
        log::trace!("poisoned realloc({:?}, {}) = {:?}", ptr, size, result);
        result
    }

    /// Get the usable size of an allocation.
    pub fn get_allocated_size(&self, ptr: HeapPtr) -> usize {
        let state = self.inner.lock();
        let head = self.verify_allocated(&state, ptr);
        match HeapPtr::new(head.addr) {
            Some(x) => state.get_allocated_size(x).saturating_sub(self.overhead()),
            None => 0,
        }
    }

    pub fn free_size(&self) -> usize {
        self.inner.free_size().saturating_sub(self.overhead())
    }

    pub fn minimum_free_size(&self) -> usize {
        self.inner.minimum_free_size().saturating_sub(self.overhead())
    }

    pub fn get_info(&self) -> HeapInfo {
        let overhead = self.overhead();
        let mut info = self.inner.get_info();
        info.total_allocated_bytes = info
            .total_allocated_bytes
            .saturating_sub(info.allocated_blocks * overhead);
        info.largest_free_block = info.largest_free_block.saturating_sub(overhead);
        info.total_free_bytes = info.total_free_bytes.saturating_sub(overhead);
        info.minimum_free_bytes = info.minimum_free_bytes.saturating_sub(overhead);
        info
    }

    /// Validate the heap and every allocation's canaries. In
    /// [`PoisonMode::Comprehensive`], free blocks must hold only
    /// [`FREE_FILL_PATTERN`].
    pub fn check(&self, print_errors: bool) -> bool {
        self.inner
            .lock()
            .check_with(print_errors, |tlsf, block| self.check_block(tlsf, block))
    }

    fn check_block(&self, tlsf: &Tlsf, block: &BlockInfo) -> Result<(), IntegrityError> {
        if block.used {
            self.read_head(tlsf, block.ptr.addr(), block.size)
                .map(|_| ())
                .map_err(|(kind, address)| IntegrityError {
                    what: match kind {
                        CorruptionKind::BadTailCanary => "bad tail canary",
                        _ => "bad head canary",
                    },
                    address,
                })
        } else if self.mode == PoisonMode::Comprehensive {
            match tlsf.free_block_contents(block) {
                Some(range)
                    if !Self::verify_fill(
                        tlsf,
                        range.start,
                        range.end - range.start,
                        FREE_FILL_PATTERN,
                    ) =>
                {
                    Err(IntegrityError {
                        what: "free block was modified",
                        address: block.ptr.addr(),
                    })
                }
                _ => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    /// Check that `[ptr, ptr + len)` holds the free pattern (if `expect_free`)
    /// or the malloc pattern. Always succeeds in [`PoisonMode::Light`].
    pub fn verify_region(&self, ptr: HeapPtr, len: usize, expect_free: bool) -> bool {
        if self.mode == PoisonMode::Light {
            return true;
        }
        let pattern = if expect_free {
            FREE_FILL_PATTERN
        } else {
            MALLOC_FILL_PATTERN
        };
        Self::verify_fill(self.inner.lock().tlsf(), ptr.addr(), len, pattern)
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.dump(out)
    }

    #[inline]
    pub fn contains(&self, ptr: HeapPtr) -> bool {
        self.inner.contains(ptr)
    }

    pub fn read(&self, ptr: HeapPtr, offset: usize, buf: &mut [u8]) {
        self.inner.read(ptr, offset, buf)
    }

    pub fn write(&self, ptr: HeapPtr, offset: usize, data: &[u8]) {
        self.inner.write(ptr, offset, data)
    }

    pub fn fill(&self, ptr: HeapPtr, offset: usize, len: usize, byte: u8) {
        self.inner.fill(ptr, offset, len, byte)
    }

    /// Call `f` for every live allocation with an intact head.
    pub fn for_each_allocation(&self, mut f: impl FnMut(&Allocation)) {
        let state = self.inner.lock();
        let tlsf = state.tlsf();
        tlsf.walk(|block| {
            if !block.used {
                return true;
            }
            match self.read_head(tlsf, block.ptr.addr(), block.size) {
                Ok(head) => {
                    if let Some(ptr) = block.ptr.checked_add(self.head_size()) {
                        f(&Allocation {
                            ptr,
                            size: head.size,
                            owner: head.owner,
                        });
                    }
                }
                Err((kind, address)) => {
                    log::warn!("skipping allocation at {:#x}: {:?}", address, kind);
                }
            }
            true
        });
    }
}

impl<L: HeapLock> Heap for PoisonedHeap<L> {
    fn malloc(&self, size: usize) -> Result<HeapPtr, AllocError> {
        PoisonedHeap::malloc(self, size)
    }

    fn aligned_alloc_offs(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError> {
        PoisonedHeap::aligned_alloc_offs(self, size, align, offset)
    }

    fn free(&self, ptr: Option<HeapPtr>) {
        PoisonedHeap::free(self, ptr)
    }

    fn realloc(&self, ptr: Option<HeapPtr>, size: usize) -> Result<Option<HeapPtr>, AllocError> {
        PoisonedHeap::realloc(self, ptr, size)
    }

    fn get_allocated_size(&self, ptr: HeapPtr) -> usize {
        PoisonedHeap::get_allocated_size(self, ptr)
    }

    fn free_size(&self) -> usize {
        PoisonedHeap::free_size(self)
    }

    fn minimum_free_size(&self) -> usize {
        PoisonedHeap::minimum_free_size(self)
    }

    fn get_info(&self) -> HeapInfo {
        PoisonedHeap::get_info(self)
    }

    fn check(&self, print_errors: bool) -> bool {
        PoisonedHeap::check(self, print_errors)
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        PoisonedHeap::dump(self, out)
    }

    fn contains(&self, ptr: HeapPtr) -> bool {
        PoisonedHeap::contains(self, ptr)
    }

    fn range(&self) -> Range<usize> {
        self.inner.start()..self.inner.end()
    }

    fn read(&self, ptr: HeapPtr, offset: usize, buf: &mut [u8]) {
        PoisonedHeap::read(self, ptr, offset, buf)
    }

    fn write(&self, ptr: HeapPtr, offset: usize, data: &[u8]) {
        PoisonedHeap::write(self, ptr, offset, data)
    }

    fn for_each_allocation(&self, f: &mut dyn FnMut(&Allocation)) {
        PoisonedHeap::for_each_allocation(self, f)
    }
}
