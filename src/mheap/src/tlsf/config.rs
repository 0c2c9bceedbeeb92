//! Size-class parameters of the TLSF engine
use crate::arena::WORD;

/// `log2(ALIGN_SIZE)`
pub(crate) const ALIGN_SIZE_LOG2: u32 = WORD.trailing_zeros();

/// The maximum value of [`TlsfConfig::sl_index_count_log2`]. The second-level
/// bitmaps are `u32`s.
pub const SL_INDEX_COUNT_LOG2_MAX: u32 = 5;

/// The size-class parameters of a [`Tlsf`](super::Tlsf) instance, fixed at
/// construction time.
///
/// Every block size `s` is mapped to a first-level index `fl` and a
/// second-level index `sl`:
///
///  - Below [`small_block_size`](Self::small_block_size), `fl = 0` and the
///    second level subdivides the range linearly into `ALIGN_SIZE`-byte steps.
///
///  - Otherwise, `fl` is derived from `floor(log2(s))` and `sl` from the
///    `sl_index_count_log2` bits following the most significant one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TlsfConfig {
    fl_index_max: u32,
    sl_index_count_log2: u32,
}

impl TlsfConfig {
    /// Construct a `TlsfConfig` from an explicit pair of parameters.
    ///
    /// Returns `None` if `sl_index_count_log2` is not in
    /// `1..=SL_INDEX_COUNT_LOG2_MAX`, `fl_index_max` is not below
    /// `usize::BITS`, or `fl_index_max` is smaller than the resulting
    /// [`fl_index_shift`](Self::fl_index_shift).
    pub const fn new(fl_index_max: u32, sl_index_count_log2: u32) -> Option<Self> {
        if sl_index_count_log2 == 0 || sl_index_count_log2 > SL_INDEX_COUNT_LOG2_MAX {
            return None;
        }
        if fl_index_max >= usize::BITS {
            return None;
        }
        if fl_index_max < sl_index_count_log2 + ALIGN_SIZE_LOG2 {
            return None;
        }
        Some(Self {
            fl_index_max,
            sl_index_count_log2,
        })
    }

    /// Choose parameters for a pool of `bytes` bytes.
    ///
    /// The first level is sized so that the maximum block size exceeds
    /// `bytes`. The second level shrinks for small pools, which do not benefit
    /// from fine-grained classes as much as they suffer from the larger
    /// control structure.
    pub const fn for_pool_size(bytes: usize) -> Option<Self> {
        if bytes == 0 {
            return None;
        }
        let sl_index_count_log2 = if bytes <= 16 * 1024 {
            3
        } else if bytes <= 256 * 1024 {
            4
        } else {
            5
        };
        let mut fl_index_max = usize::BITS - bytes.leading_zeros();
        let fl_index_shift = sl_index_count_log2 + ALIGN_SIZE_LOG2;
        if fl_index_max < fl_index_shift {
            fl_index_max = fl_index_shift;
        }
        Self::new(fl_index_max, sl_index_count_log2)
    }

    /// `1 << fl_index_max` is the exclusive upper bound of block sizes.
    #[inline]
    pub const fn fl_index_max(&self) -> u32 {
        self.fl_index_max
    }

    #[inline]
    pub const fn sl_index_count_log2(&self) -> u32 {
        self.sl_index_count_log2
    }

    #[inline]
    pub const fn sl_index_count(&self) -> usize {
        1 << self.sl_index_count_log2
    }

    /// The bit position where the first level starts to be logarithmic.
    #[inline]
    pub const fn fl_index_shift(&self) -> u32 {
        self.sl_index_count_log2 + ALIGN_SIZE_LOG2
    }

    #[inline]
    pub const fn fl_index_count(&self) -> usize {
        (self.fl_index_max - self.fl_index_shift() + 1) as usize
    }

    /// Blocks smaller than this are all mapped to `fl = 0`.
    #[inline]
    pub const fn small_block_size(&self) -> usize {
        1 << self.fl_index_shift()
    }

    /// The exclusive upper bound of block sizes.
    #[inline]
    pub const fn block_size_max(&self) -> usize {
        1 << self.fl_index_max
    }
}
