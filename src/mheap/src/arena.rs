//! Memory regions and the bounds-checked arena the engine operates on
use core::{fmt, num::NonZeroUsize};

use crate::error::{CorruptionHandler, CorruptionKind, CorruptionReport};

/// The size of a machine word, which is also the size of a block header.
pub const WORD: usize = core::mem::size_of::<usize>();

/// A pointer into a heap's address space.
///
/// Heap pointers are plain addresses; the memory behind them is owned by the
/// heap and accessed through it. `Option<HeapPtr>` stands in for a nullable
/// pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapPtr(NonZeroUsize);

impl HeapPtr {
    /// Construct a `HeapPtr` from an address. Returns `None` for zero.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(x) => Some(Self(x)),
            None => None,
        }
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Offset the pointer by `count` bytes. Returns `None` on overflow.
    #[inline]
    pub fn checked_add(self, count: usize) -> Option<Self> {
        self.addr().checked_add(count).and_then(Self::new)
    }

    /// Offset the pointer backward by `count` bytes. Returns `None` on
    /// underflow or when the result is zero.
    #[inline]
    pub fn checked_sub(self, count: usize) -> Option<Self> {
        self.addr().checked_sub(count).and_then(Self::new)
    }
}

impl fmt::Debug for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "HeapPtr({:#x})", self.addr())
    }
}

impl fmt::Display for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// A contiguous byte range donated to an allocator.
///
/// The bytes are owned by the region. `base` is the address of the first
/// byte in the heap's address space.
pub struct MemoryRegion {
    base: NonZeroUsize,
    bytes: Box<[u8]>,
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("end", &format_args!("{:#x}", self.end()))
            .finish()
    }
}

impl MemoryRegion {
    /// Create a zero-filled region of `len` bytes located at `base`.
    ///
    /// Returns `None` if `base` is zero or the region would wrap around the
    /// address space.
    pub fn new(base: usize, len: usize) -> Option<Self> {
        Self::from_bytes(base, vec![0u8; len].into_boxed_slice())
    }

    /// Wrap an existing buffer as a region located at `base`.
    pub fn from_bytes(base: usize, bytes: Box<[u8]>) -> Option<Self> {
        let base = NonZeroUsize::new(base)?;
        base.get().checked_add(bytes.len())?;
        Some(Self { base, bytes })
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.base.get()
    }

    /// The address one past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.base.get() + self.bytes.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Get the offset of `[addr, addr + len)` in this region if the range is
    /// entirely contained.
    #[inline]
    fn offset_of(&self, addr: usize, len: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.start())?;
        if offset.checked_add(len)? <= self.bytes.len() {
            Some(offset)
        } else {
            None
        }
    }

    fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }
}

/// A set of memory regions addressed by bounds-checked addresses.
///
/// Slots of removed regions are kept vacant so that region indices stay
/// stable.
pub(crate) struct Arena {
    regions: Vec<Option<MemoryRegion>>,
    on_corruption: CorruptionHandler,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.regions.iter().flatten())
            .finish()
    }
}

impl Arena {
    pub(crate) fn new(on_corruption: CorruptionHandler) -> Self {
        Self {
            regions: Vec::new(),
            on_corruption,
        }
    }

    pub(crate) fn on_corruption(&self) -> CorruptionHandler {
        self.on_corruption
    }

    pub(crate) fn set_on_corruption(&mut self, handler: CorruptionHandler) {
        self.on_corruption = handler;
    }

    /// Report a corruption through the configured handler.
    #[cold]
    pub(crate) fn corrupt(&self, kind: CorruptionKind, address: usize) -> ! {
        (self.on_corruption)(&CorruptionReport { kind, address })
    }

    /// Insert a region. Gives the region back if it overlaps an existing one.
    pub(crate) fn insert(&mut self, region: MemoryRegion) -> Result<usize, MemoryRegion> {
        if self.regions.iter().flatten().any(|r| r.overlaps(&region)) {
            return Err(region);
        }
        if let Some(i) = self.regions.iter().position(Option::is_none) {
            self.regions[i] = Some(region);
            Ok(i)
        } else {
            self.regions.push(Some(region));
            Ok(self.regions.len() - 1)
        }
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<MemoryRegion> {
        self.regions.get_mut(index)?.take()
    }

    pub(crate) fn region(&self, index: usize) -> Option<&MemoryRegion> {
        self.regions.get(index)?.as_ref()
    }

    pub(crate) fn region_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.regions
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|_| i))
    }

    /// Locate `[addr, addr + len)`. Returns `(region index, offset)`.
    #[inline]
    fn locate(&self, addr: usize, len: usize) -> Option<(usize, usize)> {
        self.regions.iter().enumerate().find_map(|(i, r)| {
            r.as_ref()
                .and_then(|r| r.offset_of(addr, len))
                .map(|offset| (i, offset))
        })
    }

    /// Check whether `[addr, addr + len)` lies entirely in one region.
    #[inline]
    pub(crate) fn contains(&self, addr: usize, len: usize) -> bool {
        self.locate(addr, len).is_some()
    }

    #[inline]
    pub(crate) fn get(&self, addr: usize, len: usize) -> Option<&[u8]> {
        let (i, offset) = self.locate(addr, len)?;
        let region = self.regions[i].as_ref()?;
        Some(&region.bytes[offset..offset + len])
    }

    /// Borrow `[addr, addr + len)`. Escalates an out-of-bounds access as heap
    /// corruption.
    #[inline]
    pub(crate) fn bytes(&self, addr: usize, len: usize) -> &[u8] {
        match self.get(addr, len) {
            Some(x) => x,
            None => self.corrupt(CorruptionKind::OutOfBounds, addr),
        }
    }

    /// Mutably borrow `[addr, addr + len)`. Escalates an out-of-bounds access
    /// as heap corruption.
    #[inline]
    pub(crate) fn bytes_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        let (i, offset) = match self.locate(addr, len) {
            Some(x) => x,
            None => self.corrupt(CorruptionKind::OutOfBounds, addr),
        };
        // `corrupt` is unavailable while `regions` is borrowed
        let on_corruption = self.on_corruption;
        match self.regions.get_mut(i).and_then(Option::as_mut) {
            Some(region) => &mut region.bytes[offset..offset + len],
            None => on_corruption(&CorruptionReport {
                kind: CorruptionKind::OutOfBounds,
                address: addr,
            }),
        }
    }

    #[inline]
    pub(crate) fn try_read_word(&self, addr: usize) -> Option<usize> {
        let bytes = self.get(addr, WORD)?;
        let mut word = [0u8; WORD];
        word.copy_from_slice(bytes);
        Some(usize::from_ne_bytes(word))
    }

    #[inline]
    pub(crate) fn read_word(&self, addr: usize) -> usize {
        match self.try_read_word(addr) {
            Some(x) => x,
            None => self.corrupt(CorruptionKind::OutOfBounds, addr),
        }
    }

    #[inline]
    pub(crate) fn write_word(&mut self, addr: usize, value: usize) {
        self.bytes_mut(addr, WORD)
            .copy_from_slice(&value.to_ne_bytes());
    }

    #[inline]
    pub(crate) fn fill(&mut self, addr: usize, len: usize, byte: u8) {
        if len > 0 {
            self.bytes_mut(addr, len).fill(byte);
        }
    }

    /// Copy `len` bytes from `src` to `dst`. The ranges may live in different
    /// regions and may overlap.
    pub(crate) fn copy(&mut self, src: usize, dst: usize, len: usize) {
        if len == 0 || src == dst {
            return;
        }
        let (src_region, src_offset) = match self.locate(src, len) {
            Some(x) => x,
            None => self.corrupt(CorruptionKind::OutOfBounds, src),
        };
        let (dst_region, dst_offset) = match self.locate(dst, len) {
            Some(x) => x,
            None => self.corrupt(CorruptionKind::OutOfBounds, dst),
        };
        if src_region == dst_region {
            if let Some(region) = self.regions[src_region].as_mut() {
                region
                    .bytes
                    .copy_within(src_offset..src_offset + len, dst_offset);
            }
        } else {
            let tmp = self.bytes(src, len).to_vec();
            if let Some(region) = self.regions[dst_region].as_mut() {
                region.bytes[dst_offset..dst_offset + len].copy_from_slice(&tmp);
            }
        }
    }
}
