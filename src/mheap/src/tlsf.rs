//! The TLSF allocator core
//!
//! # Data Structure Overview
//!
//! ```text
//!   First level
//!                            fl_index_count = 8
//!        ,-----+-----+-----+-----+-----+-----+-----+-----,
//!        |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  fl_bitmap
//!        '-----+-----+-----+--+--+-----+-----+-----+-----'
//!                             |
//!   Second level              v       sl_index_count = 8
//!        ,-----+-----+-----+-----+-----+-----+-----+-----,
//!        |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |  sl_bitmap[fl]
//!        +-----+-----+-----+-----+-----+-----+-----+-----+
//!        |     |     |  O  |     |     |     |     |     |  first_free[fl][sl]
//!        '-----+-----+--|--+-----+-----+-----+-----+-----'
//!                       |
//!   Free blocks         v
//!                 [block] <-> [block] <-> [block]
//! ```
//!
//! `sl_bitmap[fl]` bit `sl` is set iff `first_free[fl][sl]` is non-empty, and
//! `fl_bitmap` bit `fl` is set iff `sl_bitmap[fl]` is nonzero.
//!
//! Every pool is laid out as a sequence of physically adjacent blocks followed
//! by a zero-sized sentinel block. See [`block`] for the header format.
use core::{fmt, ops::Range};

use crate::{
    arena::{Arena, HeapPtr, MemoryRegion, WORD},
    error::{
        AddPoolError, AllocError, CorruptionHandler, CorruptionKind, IntegrityError,
        RemovePoolError,
    },
};

mod block;
mod config;

use self::block::{Block, BLOCK_HEADER_OVERHEAD, FLAG_MASK, FREE_BIT, PREV_FREE_BIT};
pub use self::{
    block::BLOCK_SIZE_MIN,
    config::{TlsfConfig, SL_INDEX_COUNT_LOG2_MAX},
};

/// The alignment of every block header and payload.
pub const ALIGN_SIZE: usize = WORD;

/// The number of bytes an allocation consumes in addition to its block size.
pub const ALLOC_OVERHEAD: usize = BLOCK_HEADER_OVERHEAD;

/// The smallest gap that can be carved off as a leading free block when
/// aligning an allocation.
const GAP_MIN: usize = BLOCK_HEADER_OVERHEAD + BLOCK_SIZE_MIN;

/// Identifies a pool of a [`Tlsf`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(usize);

/// A block visited by [`Tlsf::walk_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The payload address.
    pub ptr: HeapPtr,
    /// The payload size, excluding the header.
    pub size: usize,
    pub used: bool,
}

/// The TLSF header (top-level) data structure.
///
/// # Properties
///
/// The allocation granularity is [`ALIGN_SIZE`]. The minimum block size is
/// [`BLOCK_SIZE_MIN`]. The maximum block size is
/// [`TlsfConfig::block_size_max`] minus one granule.
///
/// Every operation is O(1) except `realloc` (which may copy) and the
/// walkers.
pub struct Tlsf {
    arena: Arena,
    config: TlsfConfig,
    fl_bitmap: u64,
    /// `sl_bitmap[fl]` bit `sl` is set iff `first_free[fl * sl_index_count +
    /// sl].is_some()`
    sl_bitmap: Vec<u32>,
    first_free: Vec<Option<Block>>,
    /// Painted over every byte that becomes free
    free_fill: Option<u8>,
}

impl fmt::Debug for Tlsf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tlsf")
            .field("config", &self.config)
            .field("fl_bitmap", &format_args!("{:#b}", self.fl_bitmap))
            .field("pools", &self.arena)
            .finish()
    }
}

#[inline]
fn fls(x: usize) -> u32 {
    debug_assert_ne!(x, 0);
    usize::BITS - 1 - x.leading_zeros()
}

#[inline]
fn align_up(x: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(x.checked_add(align - 1)? & !(align - 1))
}

#[inline]
fn align_down(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

impl Tlsf {
    /// The number of bytes of every pool used for block headers that can never
    /// be handed out (the first block's header and the sentinel).
    pub const POOL_OVERHEAD: usize = 2 * BLOCK_HEADER_OVERHEAD;

    /// Construct an empty instance.
    pub fn new(config: TlsfConfig, on_corruption: CorruptionHandler) -> Self {
        Self {
            arena: Arena::new(on_corruption),
            config,
            fl_bitmap: 0,
            sl_bitmap: vec![0; config.fl_index_count()],
            first_free: vec![None; config.fl_index_count() * config.sl_index_count()],
            free_fill: None,
        }
    }

    /// Construct an instance sized for `max_bytes` (or the region's length if
    /// zero) and add `region` as its first pool.
    pub fn with_pool(
        region: MemoryRegion,
        max_bytes: usize,
        on_corruption: CorruptionHandler,
    ) -> Result<(Self, PoolId), AddPoolError> {
        let max_bytes = if max_bytes == 0 { region.len() } else { max_bytes };
        let config = TlsfConfig::for_pool_size(max_bytes).ok_or(AddPoolError::BadParam)?;
        let mut this = Self::new(config, on_corruption);
        let pool = this.add_pool(region)?;
        Ok((this, pool))
    }

    #[inline]
    pub fn config(&self) -> &TlsfConfig {
        &self.config
    }

    pub fn set_on_corruption(&mut self, handler: CorruptionHandler) {
        self.arena.set_on_corruption(handler);
    }

    pub fn on_corruption(&self) -> CorruptionHandler {
        self.arena.on_corruption()
    }

    /// Report a corruption through the configured handler.
    pub fn corrupt(&self, kind: CorruptionKind, address: usize) -> ! {
        self.arena.corrupt(kind, address)
    }

    /// Set the byte painted over free memory. Affects only memory freed after
    /// the call; pools added afterwards are painted as a whole.
    pub fn set_free_fill(&mut self, fill: Option<u8>) {
        self.free_fill = fill;
    }

    #[inline]
    pub fn free_fill(&self) -> Option<u8> {
        self.free_fill
    }

    #[inline]
    pub fn block_size_max(&self) -> usize {
        self.config.block_size_max()
    }

    /// Find the first-level and second-level indices of the list containing
    /// blocks of size `size`.
    #[inline]
    fn mapping_insert(&self, size: usize) -> (usize, usize) {
        let config = &self.config;
        if size < config.small_block_size() {
            (0, size / (config.small_block_size() / config.sl_index_count()))
        } else {
            let f = fls(size);
            let sl = (size >> (f - config.sl_index_count_log2()))
                ^ (1 << config.sl_index_count_log2());
            ((f - (config.fl_index_shift() - 1)) as usize, sl)
        }
    }

    /// Like [`Self::mapping_insert`], but rounds `size` up to the next class
    /// boundary first so that any block of the found class can hold `size`
    /// bytes. Returns `None` if no class is large enough.
    #[inline]
    fn mapping_search(&self, mut size: usize) -> Option<(usize, usize)> {
        if size >= self.config.small_block_size() {
            let round = (1 << (fls(size) - self.config.sl_index_count_log2())) - 1;
            size = size.checked_add(round)?;
        }
        let (fl, sl) = self.mapping_insert(size);
        if fl < self.config.fl_index_count() {
            Some((fl, sl))
        } else {
            None
        }
    }

    /// Get the class of an existing block, escalating an impossible size as
    /// corruption.
    fn block_class(&self, block: Block) -> (usize, usize) {
        let size = block.size(&self.arena);
        if size < BLOCK_SIZE_MIN || size >= self.config.block_size_max() {
            self.corrupt(CorruptionKind::BadHeader, block.0);
        }
        self.mapping_insert(size)
    }

    #[inline]
    fn list_index(&self, fl: usize, sl: usize) -> usize {
        fl * self.config.sl_index_count() + sl
    }

    /// Find the first non-empty list at or above `(fl, sl)`.
    fn search_suitable_block(&self, fl: usize, sl: usize) -> Option<(usize, usize)> {
        let sl_map = self.sl_bitmap[fl] & (!0u32 << sl);
        let (fl, sl_map) = if sl_map == 0 {
            let fl_map = self.fl_bitmap & (!0u64 << (fl + 1));
            if fl_map == 0 {
                return None;
            }
            let fl = fl_map.trailing_zeros() as usize;
            (fl, self.sl_bitmap[fl])
        } else {
            (fl, sl_map)
        };
        debug_assert_ne!(sl_map, 0);
        Some((fl, sl_map.trailing_zeros() as usize))
    }

    fn insert_free_block(&mut self, block: Block) {
        let (fl, sl) = self.block_class(block);
        let index = self.list_index(fl, sl);
        let current = self.first_free[index];
        block.set_next_free(&mut self.arena, current);
        block.set_prev_free_link(&mut self.arena, None);
        if let Some(current) = current {
            current.set_prev_free_link(&mut self.arena, Some(block));
        }
        self.first_free[index] = Some(block);
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    fn remove_free_block(&mut self, block: Block, fl: usize, sl: usize) {
        let prev = block.prev_free(&self.arena);
        let next = block.next_free(&self.arena);
        if let Some(next) = next {
            next.set_prev_free_link(&mut self.arena, prev);
        }
        if let Some(prev) = prev {
            prev.set_next_free(&mut self.arena, next);
        }

        let index = self.list_index(fl, sl);
        if self.first_free[index] == Some(block) {
            self.first_free[index] = next;
            if next.is_none() {
                self.sl_bitmap[fl] &= !(1 << sl);
                if self.sl_bitmap[fl] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }
    }

    /// Remove a free block from its list.
    fn block_remove(&mut self, block: Block) {
        let (fl, sl) = self.block_class(block);
        self.remove_free_block(block, fl, sl);
    }

    /// Merge a just-freed block with a free previous neighbor.
    fn merge_prev(&mut self, block: Block) -> Block {
        if !block.is_prev_free(&self.arena) {
            return block;
        }
        let prev = block.prev(&self.arena);
        if !self.arena.contains(prev.0, WORD) || !prev.is_free(&self.arena) {
            self.corrupt(CorruptionKind::BadHeader, block.0);
        }
        self.block_remove(prev);
        let merged = prev.absorb(&mut self.arena, block);
        if let Some(fill) = self.free_fill {
            // The previous block's footer and `block`'s header
            self.arena.fill(block.0 - WORD, 2 * WORD, fill);
        }
        merged
    }

    /// Merge a free block with a free next neighbor.
    fn merge_next(&mut self, block: Block) -> Block {
        let next = block.next(&self.arena);
        if !next.is_free(&self.arena) {
            return block;
        }
        // The sentinel is never free
        debug_assert!(!next.is_last(&self.arena));
        self.block_remove(next);
        let merged = block.absorb(&mut self.arena, next);
        if let Some(fill) = self.free_fill {
            // `block`'s old footer, `next`'s header and free-list links
            self.arena.fill(next.0 - WORD, 4 * WORD, fill);
        }
        merged
    }

    /// Split off the tail of a free block that is about to be used.
    fn trim_free(&mut self, block: Block, size: usize) {
        debug_assert!(block.is_free(&self.arena));
        if block.can_split(&self.arena, size) {
            let remaining = block.split(&mut self.arena, size);
            block.link_next(&mut self.arena);
            remaining.set_prev_free(&mut self.arena);
            self.insert_free_block(remaining);
        }
    }

    /// Split off the tail of a used block and release it.
    fn trim_used(&mut self, block: Block, size: usize) {
        debug_assert!(!block.is_free(&self.arena));
        if block.can_split(&self.arena, size) {
            if let Some(fill) = self.free_fill {
                let start = block.to_ptr() + size + BLOCK_HEADER_OVERHEAD;
                let end = block.to_ptr() + block.size(&self.arena);
                self.arena.fill(start, end - start, fill);
            }
            let remaining = block.split(&mut self.arena, size);
            remaining.set_prev_used(&mut self.arena);
            let remaining = self.merge_next(remaining);
            self.insert_free_block(remaining);
        }
    }

    /// Split off a leading fragment of `gap` bytes (header included) from a
    /// free block and release it. Returns the trailing part.
    fn trim_free_leading(&mut self, block: Block, gap: usize) -> Block {
        debug_assert!(block.can_split(&self.arena, gap));
        let remaining = block.split(&mut self.arena, gap - BLOCK_HEADER_OVERHEAD);
        remaining.set_prev_free(&mut self.arena);
        block.link_next(&mut self.arena);
        self.insert_free_block(block);
        remaining
    }

    /// Find a free block of at least `size` bytes and remove it from its list.
    fn locate_free(&mut self, size: usize) -> Option<Block> {
        let (fl, sl) = self.mapping_search(size)?;
        let (fl, sl) = self.search_suitable_block(fl, sl)?;
        let block = self.first_free[self.list_index(fl, sl)]?;
        if block.size(&self.arena) < size {
            self.corrupt(CorruptionKind::BadHeader, block.0);
        }
        self.remove_free_block(block, fl, sl);
        Some(block)
    }

    /// Hand out a block just removed from the free lists.
    fn prepare_used(&mut self, block: Block, size: usize) -> HeapPtr {
        self.trim_free(block, size);
        block.mark_as_used(&mut self.arena);
        let ptr = block.to_ptr();
        if let Some(fill) = self.free_fill {
            // Stale links and footer
            let block_size = block.size(&self.arena);
            self.arena.fill(ptr, 2 * WORD, fill);
            self.arena.fill(ptr + block_size - WORD, WORD, fill);
        }
        // Pools never start at address zero
        match HeapPtr::new(ptr) {
            Some(ptr) => ptr,
            None => self.corrupt(CorruptionKind::BadHeader, block.0),
        }
    }

    /// Round a request up to the allocation granularity and the minimum block
    /// size.
    fn adjust_request_size(&self, size: usize) -> Result<usize, AllocError> {
        if size == 0 {
            return Err(AllocError::BadParam);
        }
        let aligned = align_up(size, ALIGN_SIZE).ok_or(AllocError::BadParam)?;
        if aligned >= self.config.block_size_max() {
            return Err(AllocError::BadParam);
        }
        Ok(aligned.max(BLOCK_SIZE_MIN))
    }

    /// Get the used block owning `ptr`, escalating anything else as
    /// corruption.
    fn used_block(&self, ptr: HeapPtr) -> Block {
        let addr = ptr.addr();
        if addr % ALIGN_SIZE != 0 || addr < BLOCK_HEADER_OVERHEAD {
            self.corrupt(CorruptionKind::BadHeader, addr);
        }
        let block = Block::from_ptr(addr);
        if !self.arena.contains(block.0, WORD) {
            self.corrupt(CorruptionKind::OutOfBounds, addr);
        }
        if block.is_free(&self.arena) {
            self.corrupt(CorruptionKind::DoubleFree, addr);
        }
        let size = block.size(&self.arena);
        let fits = size
            .checked_add(2 * BLOCK_HEADER_OVERHEAD)
            .map_or(false, |len| self.arena.contains(block.0, len));
        if size == 0 || !fits {
            self.corrupt(CorruptionKind::BadHeader, addr);
        }
        block
    }

    /// Allocate a block of at least `size` bytes aligned to [`ALIGN_SIZE`].
    pub fn malloc(&mut self, size: usize) -> Result<HeapPtr, AllocError> {
        let adjust = self.adjust_request_size(size)?;
        let block = self.locate_free(adjust).ok_or(AllocError::NoMemory)?;
        Ok(self.prepare_used(block, adjust))
    }

    /// Allocate a block of at least `size` bytes whose address is a multiple
    /// of `align`.
    pub fn memalign(&mut self, align: usize, size: usize) -> Result<HeapPtr, AllocError> {
        self.memalign_offs(align, size, 0)
    }

    /// Allocate a block of at least `size` bytes such that `(ptr + offset) %
    /// align == 0`.
    ///
    /// `offset` must be a multiple of `min(align, ALIGN_SIZE)` because block
    /// payloads are always [`ALIGN_SIZE`]-aligned.
    pub fn memalign_offs(
        &mut self,
        align: usize,
        size: usize,
        offset: usize,
    ) -> Result<HeapPtr, AllocError> {
        if !align.is_power_of_two() || offset % align.min(ALIGN_SIZE) != 0 {
            return Err(AllocError::BadParam);
        }
        let adjust = self.adjust_request_size(size)?;
        if align <= ALIGN_SIZE {
            let block = self.locate_free(adjust).ok_or(AllocError::NoMemory)?;
            return Ok(self.prepare_used(block, adjust));
        }

        // Over-allocate so that a gap too small to become a free block of its
        // own can be pushed to the next aligned position.
        let search_size = adjust
            .checked_add(align)
            .and_then(|x| x.checked_add(GAP_MIN))
            .ok_or(AllocError::NoMemory)?;
        let block = self.locate_free(search_size).ok_or(AllocError::NoMemory)?;

        let ptr = block.to_ptr();
        let offset = offset % align;
        let target = match ptr
            .checked_add(offset)
            .and_then(|x| align_up(x, align))
        {
            Some(x) => x - offset,
            None => self.corrupt(CorruptionKind::BadHeader, block.0),
        };
        let mut gap = target - ptr;
        if gap != 0 && gap < GAP_MIN {
            gap += align_up(GAP_MIN - gap, align).unwrap_or(align);
        }
        debug_assert_eq!((ptr + gap + offset) % align, 0);

        let block = if gap != 0 {
            self.trim_free_leading(block, gap)
        } else {
            block
        };
        Ok(self.prepare_used(block, adjust))
    }

    /// Deallocate a block.
    ///
    /// A pointer that does not refer to a used block is escalated as
    /// corruption.
    pub fn free(&mut self, ptr: HeapPtr) {
        let block = self.used_block(ptr);
        if let Some(fill) = self.free_fill {
            let size = block.size(&self.arena);
            self.arena.fill(ptr.addr(), size, fill);
        }
        block.mark_as_free(&mut self.arena);
        let block = self.merge_prev(block);
        let block = self.merge_next(block);
        self.insert_free_block(block);
    }

    /// Resize a block.
    ///
    ///  - `ptr == None` behaves like [`Self::malloc`].
    ///  - `size == 0` frees `ptr` and returns `Ok(None)`.
    ///  - Otherwise the block is shrunk or grown in place if possible, or
    ///    moved to a new block. On failure, the original block is left intact.
    pub fn realloc(
        &mut self,
        ptr: Option<HeapPtr>,
        size: usize,
    ) -> Result<Option<HeapPtr>, AllocError> {
        let ptr = match ptr {
            None => return self.malloc(size).map(Some),
            Some(ptr) if size == 0 => {
                self.free(ptr);
                return Ok(None);
            }
            Some(ptr) => ptr,
        };

        let block = self.used_block(ptr);
        let adjust = self.adjust_request_size(size)?;
        let cur_size = block.size(&self.arena);
        let next = block.next(&self.arena);
        let combined = cur_size + next.size(&self.arena) + BLOCK_HEADER_OVERHEAD;

        if adjust > cur_size && (!next.is_free(&self.arena) || adjust > combined) {
            let new_ptr = self.malloc(size)?;
            self.arena
                .copy(ptr.addr(), new_ptr.addr(), cur_size.min(size));
            self.free(ptr);
            return Ok(Some(new_ptr));
        }

        if adjust > cur_size {
            self.block_remove(next);
            block.absorb(&mut self.arena, next);
            block.mark_as_used(&mut self.arena);
            if let Some(fill) = self.free_fill {
                // `next`'s header, links, and the stale footer
                self.arena.fill(next.0, 3 * WORD, fill);
                self.arena.fill(ptr.addr() + combined - WORD, WORD, fill);
            }
        }
        self.trim_used(block, adjust);
        Ok(Some(ptr))
    }

    /// Get the size of the block owning `ptr`. This is at least the requested
    /// size.
    pub fn block_size(&self, ptr: HeapPtr) -> usize {
        self.used_block(ptr).size(&self.arena)
    }

    /// Get the largest request guaranteed to be satisfiable by a free block of
    /// `size` bytes.
    pub fn fit_size(&self, size: usize) -> usize {
        if size < self.config.small_block_size() {
            size
        } else {
            let shift = fls(size) - self.config.sl_index_count_log2();
            size & !((1 << shift) - 1)
        }
    }

    /// Add a pool.
    ///
    /// The region's start is rounded up and its end rounded down to
    /// [`ALIGN_SIZE`]. It must hold [`Self::POOL_OVERHEAD`] plus one minimal
    /// block, and its first block must be smaller than
    /// [`TlsfConfig::block_size_max`].
    pub fn add_pool(&mut self, region: MemoryRegion) -> Result<PoolId, AddPoolError> {
        let (first, size) =
            Self::pool_layout(region.start(), region.end()).ok_or(AddPoolError::BadParam)?;
        if size < BLOCK_SIZE_MIN || size >= self.config.block_size_max() {
            return Err(AddPoolError::BadParam);
        }
        let (start, len) = (region.start(), region.len());
        let index = self
            .arena
            .insert(region)
            .map_err(|_| AddPoolError::BadParam)?;

        if let Some(fill) = self.free_fill {
            self.arena.fill(start, len, fill);
        }

        let block = Block(first);
        block.init(&mut self.arena, size);
        block.next(&self.arena).init(&mut self.arena, 0);
        block.mark_as_free(&mut self.arena);
        self.insert_free_block(block);

        log::debug!(
            "pool {} added at {:#x}..{:#x} ({} bytes usable)",
            index,
            start,
            start + len,
            size
        );
        Ok(PoolId(index))
    }

    /// Compute `(first block address, first block size)` for a pool spanning
    /// `start..end`.
    fn pool_layout(start: usize, end: usize) -> Option<(usize, usize)> {
        let first = align_up(start, ALIGN_SIZE)?;
        let end = align_down(end, ALIGN_SIZE);
        let size = end.checked_sub(first)?.checked_sub(Self::POOL_OVERHEAD)?;
        Some((first, size))
    }

    /// Compute the number of bytes of `region` that are never available as
    /// free block payload: the alignment slack and the pool overhead.
    pub fn pool_overhead_of(region: &MemoryRegion) -> Option<usize> {
        let (_, size) = Self::pool_layout(region.start(), region.end())?;
        Some(region.len() - size)
    }

    /// Remove a pool that contains no allocations and give the region back.
    pub fn remove_pool(&mut self, pool: PoolId) -> Result<MemoryRegion, RemovePoolError> {
        let (first, _) = self.pool_bounds(pool).ok_or(RemovePoolError::BadParam)?;
        let block = Block(first);
        if !block.is_free(&self.arena) || !block.next(&self.arena).is_last(&self.arena) {
            return Err(RemovePoolError::BadObjectState);
        }
        self.block_remove(block);
        let region = self
            .arena
            .remove(pool.0)
            .ok_or(RemovePoolError::BadParam)?;
        log::debug!("pool {} removed", pool.0);
        Ok(region)
    }

    /// Get `(first block address, sentinel address)` of a live pool.
    fn pool_bounds(&self, pool: PoolId) -> Option<(usize, usize)> {
        let region = self.arena.region(pool.0)?;
        let (first, size) = Self::pool_layout(region.start(), region.end())?;
        Some((first, first + BLOCK_HEADER_OVERHEAD + size))
    }

    /// Iterate over live pools.
    pub fn pools(&self) -> impl Iterator<Item = PoolId> + '_ {
        self.arena.region_indices().map(PoolId)
    }

    pub fn pool_region(&self, pool: PoolId) -> Option<&MemoryRegion> {
        self.arena.region(pool.0)
    }

    /// Find the pool containing `addr`.
    pub fn pool_of(&self, addr: usize) -> Option<PoolId> {
        self.pools().find(|&pool| {
            self.arena
                .region(pool.0)
                .map_or(false, |r| (r.start()..r.end()).contains(&addr))
        })
    }

    /// Call `f` for every block of a pool in address order until it returns
    /// `false`. Returns `false` if the walk was stopped or the pool does not
    /// exist.
    pub fn walk_pool(&self, pool: PoolId, mut f: impl FnMut(&BlockInfo) -> bool) -> bool {
        let (first, _) = match self.pool_bounds(pool) {
            Some(x) => x,
            None => return false,
        };
        let mut block = Block(first);
        while !block.is_last(&self.arena) {
            let info = BlockInfo {
                ptr: match HeapPtr::new(block.to_ptr()) {
                    Some(x) => x,
                    None => return false,
                },
                size: block.size(&self.arena),
                used: !block.is_free(&self.arena),
            };
            if !f(&info) {
                return false;
            }
            block = block.next(&self.arena);
        }
        true
    }

    /// [`Self::walk_pool`] over every pool.
    pub fn walk(&self, mut f: impl FnMut(&BlockInfo) -> bool) -> bool {
        self.pools().all(|pool| self.walk_pool(pool, &mut f))
    }

    /// Get the bytes of a free block not occupied by free-list links or the
    /// footer. These are the bytes covered by the free fill.
    pub fn free_block_contents(&self, info: &BlockInfo) -> Option<Range<usize>> {
        if info.used {
            return None;
        }
        let start = info.ptr.addr() + 2 * WORD;
        let end = info.ptr.addr() + info.size - WORD;
        Some(start..end.max(start))
    }

    /// Read and decode a header word without escalating.
    fn try_header(&self, addr: usize) -> Result<(usize, bool, bool), IntegrityError> {
        let word = self.arena.try_read_word(addr).ok_or(IntegrityError {
            what: "block header out of bounds",
            address: addr,
        })?;
        Ok((
            word & !FLAG_MASK,
            word & FREE_BIT != 0,
            word & PREV_FREE_BIT != 0,
        ))
    }

    /// Validate the free lists against the bitmaps and the block headers.
    pub fn check(&self) -> Result<(), IntegrityError> {
        let fail = |what, address| Err(IntegrityError { what, address });
        let max_blocks = self
            .arena
            .region_indices()
            .filter_map(|i| self.arena.region(i))
            .map(|r| r.len() / (BLOCK_HEADER_OVERHEAD + BLOCK_SIZE_MIN) + 1)
            .sum::<usize>();

        for fl in 0..self.config.fl_index_count() {
            let fl_map = self.fl_bitmap & (1 << fl);
            let sl_list = self.sl_bitmap[fl];
            if (fl_map == 0) != (sl_list == 0) {
                return fail("first-level bitmap disagrees with second-level map", fl);
            }
            for sl in 0..self.config.sl_index_count() {
                let sl_map = sl_list & (1 << sl);
                let mut cursor = self.first_free[self.list_index(fl, sl)];
                if (sl_map == 0) != cursor.is_none() {
                    return fail("second-level bitmap disagrees with free list", sl);
                }

                let mut count = 0;
                while let Some(block) = cursor {
                    count += 1;
                    if count > max_blocks {
                        return fail("free list is cyclic", block.0);
                    }
                    let (size, free, prev_free) = self.try_header(block.0)?;
                    if !free {
                        return fail("block in free list is not free", block.0);
                    }
                    if prev_free {
                        return fail("free blocks should have coalesced", block.0);
                    }
                    if size < BLOCK_SIZE_MIN || size >= self.config.block_size_max() {
                        return fail("free block has an invalid size", block.0);
                    }
                    let next = block.0 + BLOCK_HEADER_OVERHEAD + size;
                    let (_, _, next_prev_free) = self.try_header(next)?;
                    if !next_prev_free {
                        return fail("next block does not see the free block", next);
                    }
                    if self.mapping_insert(size) != (fl, sl) {
                        return fail("block size indexed in wrong list", block.0);
                    }
                    let link = self.arena.try_read_word(block.to_ptr()).ok_or(
                        IntegrityError {
                            what: "free block links out of bounds",
                            address: block.0,
                        },
                    )?;
                    cursor = if link == 0 { None } else { Some(Block(link)) };
                }
            }
        }
        Ok(())
    }

    /// Walk a pool physically, validating the headers and footers, and call
    /// `hook` for every block.
    pub fn check_pool(
        &self,
        pool: PoolId,
        mut hook: impl FnMut(&Self, &BlockInfo) -> Result<(), IntegrityError>,
    ) -> Result<(), IntegrityError> {
        let fail = |what, address| Err(IntegrityError { what, address });
        let (first, sentinel) = match self.pool_bounds(pool) {
            Some(x) => x,
            None => return fail("no such pool", pool.0),
        };

        let mut addr = first;
        let mut prev: Option<(usize, bool)> = None;
        loop {
            let (size, free, prev_free) = self.try_header(addr)?;
            let prev_is_free = prev.map_or(false, |(_, free)| free);
            if prev_free != prev_is_free {
                return fail("prev_free bit disagrees with previous block", addr);
            }
            if let Some((prev_addr, true)) = prev {
                if self.arena.try_read_word(addr - WORD) != Some(prev_addr) {
                    return fail("free block footer is invalid", prev_addr);
                }
            }
            if size == 0 {
                if addr != sentinel {
                    return fail("zero-sized block before the end of the pool", addr);
                }
                if free {
                    return fail("sentinel block is free", addr);
                }
                return Ok(());
            }
            if size % ALIGN_SIZE != 0 || size < BLOCK_SIZE_MIN {
                return fail("block has an invalid size", addr);
            }
            if free && prev_is_free {
                return fail("adjacent free blocks", addr);
            }
            let next = match addr.checked_add(BLOCK_HEADER_OVERHEAD + size) {
                Some(x) if x <= sentinel => x,
                _ => return fail("block overruns its pool", addr),
            };
            let info = BlockInfo {
                ptr: match HeapPtr::new(addr + BLOCK_HEADER_OVERHEAD) {
                    Some(x) => x,
                    None => return fail("block at address zero", addr),
                },
                size,
                used: !free,
            };
            hook(self, &info)?;
            prev = Some((addr, free));
            addr = next;
        }
    }

    /// Check whether `[addr, addr + len)` lies entirely in one pool.
    #[inline]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        self.arena.contains(addr, len)
    }

    /// Borrow pool memory. An out-of-bounds range is escalated as corruption.
    #[inline]
    pub fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        self.arena.bytes(addr, len)
    }

    /// Mutably borrow pool memory. An out-of-bounds range is escalated as
    /// corruption.
    #[inline]
    pub fn bytes_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        self.arena.bytes_mut(addr, len)
    }

    /// Borrow pool memory, returning `None` if the range is out of bounds.
    #[inline]
    pub fn get(&self, addr: usize, len: usize) -> Option<&[u8]> {
        self.arena.get(addr, len)
    }

    #[inline]
    pub fn read_word(&self, addr: usize) -> usize {
        self.arena.read_word(addr)
    }

    #[inline]
    pub fn write_word(&mut self, addr: usize, value: usize) {
        self.arena.write_word(addr, value)
    }

    #[inline]
    pub fn fill(&mut self, addr: usize, len: usize, byte: u8) {
        self.arena.fill(addr, len, byte)
    }

    /// Copy `len` bytes between possibly overlapping ranges.
    #[inline]
    pub fn copy(&mut self, src: usize, dst: usize, len: usize) {
        self.arena.copy(src, dst, len)
    }
}
