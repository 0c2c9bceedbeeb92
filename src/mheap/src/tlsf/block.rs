//! Physical block headers
//!
//! ```text
//!  block B                      payload P = B + W
//!  +------------------+---------------------------------------------+
//!  | size | PF | F    | next_free | prev_free | ...       | footer   |
//!  +------------------+---------------------------------------------+
//!    header word         (free blocks only) ---------------^
//! ```
//!
//! The footer of a free block holds the block's own address and is read by
//! the next physical block through its `PREV_FREE` bit. It's the last word of
//! the free block's payload, so it's only valid while the block is free.
use crate::arena::{Arena, WORD};

/// The bit of the header word indicating that the block is free.
pub(super) const FREE_BIT: usize = 1 << 0;
/// The bit of the header word indicating that the previous physical block is
/// free.
pub(super) const PREV_FREE_BIT: usize = 1 << 1;
pub(super) const FLAG_MASK: usize = FREE_BIT | PREV_FREE_BIT;

/// The per-block overhead: the header word.
pub const BLOCK_HEADER_OVERHEAD: usize = WORD;

/// The minimum payload size of a block. A free block has to hold two links
/// and a footer.
pub const BLOCK_SIZE_MIN: usize = WORD * 3;

/// A view of the block header located at the contained address.
///
/// All accesses go through an [`Arena`], which escalates an address outside
/// of every pool as heap corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Block(pub(super) usize);

impl Block {
    /// Get the block owning the payload starting at `ptr`.
    #[inline]
    pub(super) fn from_ptr(ptr: usize) -> Self {
        Self(ptr - BLOCK_HEADER_OVERHEAD)
    }

    /// Get the payload address.
    #[inline]
    pub(super) fn to_ptr(self) -> usize {
        self.0 + BLOCK_HEADER_OVERHEAD
    }

    #[inline]
    fn header(self, arena: &Arena) -> usize {
        arena.read_word(self.0)
    }

    #[inline]
    pub(super) fn size(self, arena: &Arena) -> usize {
        self.header(arena) & !FLAG_MASK
    }

    /// Update the size, preserving the flags.
    #[inline]
    pub(super) fn set_size(self, arena: &mut Arena, size: usize) {
        debug_assert_eq!(size & FLAG_MASK, 0);
        let flags = self.header(arena) & FLAG_MASK;
        arena.write_word(self.0, size | flags);
    }

    /// Write a fresh header with the given size and no flags set.
    #[inline]
    pub(super) fn init(self, arena: &mut Arena, size: usize) {
        debug_assert_eq!(size & FLAG_MASK, 0);
        arena.write_word(self.0, size);
    }

    /// The sentinel block capping a pool has a zero size.
    #[inline]
    pub(super) fn is_last(self, arena: &Arena) -> bool {
        self.size(arena) == 0
    }

    #[inline]
    pub(super) fn is_free(self, arena: &Arena) -> bool {
        self.header(arena) & FREE_BIT != 0
    }

    #[inline]
    pub(super) fn set_free(self, arena: &mut Arena) {
        let header = self.header(arena);
        arena.write_word(self.0, header | FREE_BIT);
    }

    #[inline]
    pub(super) fn set_used(self, arena: &mut Arena) {
        let header = self.header(arena);
        arena.write_word(self.0, header & !FREE_BIT);
    }

    #[inline]
    pub(super) fn is_prev_free(self, arena: &Arena) -> bool {
        self.header(arena) & PREV_FREE_BIT != 0
    }

    #[inline]
    pub(super) fn set_prev_free(self, arena: &mut Arena) {
        let header = self.header(arena);
        arena.write_word(self.0, header | PREV_FREE_BIT);
    }

    #[inline]
    pub(super) fn set_prev_used(self, arena: &mut Arena) {
        let header = self.header(arena);
        arena.write_word(self.0, header & !PREV_FREE_BIT);
    }

    /// Get the next physical block.
    #[inline]
    pub(super) fn next(self, arena: &Arena) -> Block {
        debug_assert!(!self.is_last(arena));
        Block(self.to_ptr() + self.size(arena))
    }

    /// Get the previous physical block. Only valid if it's free.
    #[inline]
    pub(super) fn prev(self, arena: &Arena) -> Block {
        debug_assert!(self.is_prev_free(arena));
        Block(arena.read_word(self.footer_of_prev()))
    }

    /// The address of the previous block's footer.
    #[inline]
    fn footer_of_prev(self) -> usize {
        self.0 - WORD
    }

    /// Store `self` in the next block's view of its previous block, and return
    /// the next block.
    #[inline]
    pub(super) fn link_next(self, arena: &mut Arena) -> Block {
        let next = self.next(arena);
        arena.write_word(next.footer_of_prev(), self.0);
        next
    }

    /// Read the address stored in the footer slot.
    #[cfg(test)]
    pub(super) fn footer(self, arena: &Arena) -> usize {
        arena.read_word(self.to_ptr() + self.size(arena) - WORD)
    }

    pub(super) fn mark_as_free(self, arena: &mut Arena) {
        let next = self.link_next(arena);
        next.set_prev_free(arena);
        self.set_free(arena);
    }

    pub(super) fn mark_as_used(self, arena: &mut Arena) {
        let next = self.next(arena);
        next.set_prev_used(arena);
        self.set_used(arena);
    }

    #[inline]
    pub(super) fn next_free(self, arena: &Arena) -> Option<Block> {
        link_from_word(arena.read_word(self.to_ptr()))
    }

    #[inline]
    pub(super) fn set_next_free(self, arena: &mut Arena, block: Option<Block>) {
        arena.write_word(self.to_ptr(), link_to_word(block));
    }

    #[inline]
    pub(super) fn prev_free(self, arena: &Arena) -> Option<Block> {
        link_from_word(arena.read_word(self.to_ptr() + WORD))
    }

    #[inline]
    pub(super) fn set_prev_free_link(self, arena: &mut Arena, block: Option<Block>) {
        arena.write_word(self.to_ptr() + WORD, link_to_word(block));
    }

    /// Check whether the block can be split into one with a payload of `size`
    /// bytes and a remainder block of at least [`BLOCK_SIZE_MIN`] bytes.
    #[inline]
    pub(super) fn can_split(self, arena: &Arena, size: usize) -> bool {
        self.size(arena) >= BLOCK_HEADER_OVERHEAD + BLOCK_SIZE_MIN + size
    }

    /// Split the block, keeping `size` bytes, and return the remainder, which
    /// is marked free.
    pub(super) fn split(self, arena: &mut Arena, size: usize) -> Block {
        let remaining = Block(self.to_ptr() + size);
        let remain_size = self.size(arena) - (size + BLOCK_HEADER_OVERHEAD);
        debug_assert_eq!(remaining.to_ptr() % WORD, 0);
        debug_assert!(remain_size >= BLOCK_SIZE_MIN);

        remaining.init(arena, remain_size);
        self.set_size(arena, size);
        remaining.mark_as_free(arena);
        remaining
    }

    /// Merge `block` (the next physical block) into `self`.
    pub(super) fn absorb(self, arena: &mut Arena, block: Block) -> Block {
        debug_assert!(!self.is_last(arena), "previous block can't be last");
        let size = self.size(arena) + block.size(arena) + BLOCK_HEADER_OVERHEAD;
        self.set_size(arena, size);
        self.link_next(arena);
        self
    }
}

#[inline]
fn link_from_word(word: usize) -> Option<Block> {
    if word == 0 {
        None
    } else {
        Some(Block(word))
    }
}

#[inline]
fn link_to_word(block: Option<Block>) -> usize {
    block.map_or(0, |b| b.0)
}
