//! The interface shared by the plain and the poisoning heap
use core::{fmt, ops::Range};

use crate::{
    arena::HeapPtr,
    error::AllocError,
    task::TaskTag,
};

/// Heap statistics returned by [`Heap::get_info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// The number of bytes available for allocation.
    pub total_free_bytes: usize,
    /// The total size of the allocated blocks.
    pub total_allocated_bytes: usize,
    /// The size of the largest request that is guaranteed to succeed right
    /// now.
    pub largest_free_block: usize,
    /// The lowest value of `total_free_bytes` observed.
    pub minimum_free_bytes: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub total_blocks: usize,
}

/// A live allocation reported by [`Heap::for_each_allocation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// The address returned to the caller.
    pub ptr: HeapPtr,
    /// The usable size.
    pub size: usize,
    /// The task that made the allocation, if recorded.
    pub owner: Option<TaskTag>,
}

/// A heap: a lockable allocator instance over one or more memory regions.
///
/// [`MultiHeap`](crate::MultiHeap) is the plain implementation.
/// [`PoisonedHeap`](crate::PoisonedHeap) wraps it and adds corruption
/// detection.
///
/// Every method acquires the heap's lock for its duration, so none of them
/// may be called from inside a visitor passed to the same heap.
pub trait Heap {
    /// Allocate at least `size` bytes.
    fn malloc(&self, size: usize) -> Result<HeapPtr, AllocError>;

    /// Allocate at least `size` bytes at an address that is a multiple of
    /// `align`.
    fn aligned_alloc(&self, size: usize, align: usize) -> Result<HeapPtr, AllocError> {
        self.aligned_alloc_offs(size, align, 0)
    }

    /// Allocate at least `size` bytes such that `(ptr + offset) % align == 0`.
    fn aligned_alloc_offs(
        &self,
        size: usize,
        align: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError>;

    /// Deallocate. `None` is a no-op.
    fn free(&self, ptr: Option<HeapPtr>);

    /// Resize an allocation. `None` behaves like `malloc`; a zero size frees
    /// the allocation and returns `Ok(None)`.
    fn realloc(&self, ptr: Option<HeapPtr>, size: usize) -> Result<Option<HeapPtr>, AllocError>;

    /// Get the usable size of an allocation, which may exceed the requested
    /// size.
    fn get_allocated_size(&self, ptr: HeapPtr) -> usize;

    fn free_size(&self) -> usize;

    fn minimum_free_size(&self) -> usize;

    fn get_info(&self) -> HeapInfo;

    /// Validate the heap. Returns `false` if corruption was found, logging
    /// the details if `print_errors` is set.
    fn check(&self, print_errors: bool) -> bool;

    /// Write a description of every block to `out`.
    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Check whether `ptr` points into this heap.
    fn contains(&self, ptr: HeapPtr) -> bool;

    /// The address range of the region backing this heap.
    fn range(&self) -> Range<usize>;

    /// Copy bytes out of an allocation.
    fn read(&self, ptr: HeapPtr, offset: usize, buf: &mut [u8]);

    /// Copy bytes into an allocation.
    fn write(&self, ptr: HeapPtr, offset: usize, data: &[u8]);

    /// Call `f` for every live allocation.
    fn for_each_allocation(&self, f: &mut dyn FnMut(&Allocation));
}
