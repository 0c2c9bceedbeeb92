//! Error types
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use mheap::ResultCode;
            /// assert_eq!(ResultCode::NoMemory.as_str(), "NoMemory");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that a heap operation can
    /// produce.
    ///
    /// Heap corruption is deliberately absent: it's never returned to the
    /// caller but escalated through [`CorruptionHandler`].
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful. No additional information is available.
        Success = 0,
        /// A parameter is invalid, e.g., a zero allocation size, an alignment
        /// that is not a power of two, or a memory region that is too small to
        /// hold a pool.
        BadParam = -17,
        /// No free block large enough to satisfy the request was found.
        NoMemory = -33,
        /// A target object is in a state that disallows the operation.
        BadObjectState = -41,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    ///
    /// Failure codes have negative values.
    #[inline]
    pub fn is_err(self) -> bool {
        (self as i8) < 0
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode`
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(ResultCode::from(*self).as_str())
            }
        }

        impl std::error::Error for $name {}

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => Self::$vname,
                    )*
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                    assert_eq!(ResultCode::$vname as i8, $name::$vname as i8);
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }
    };
}

define_error! {
    mod alloc_error {}
    /// Error type for the allocation operations (`malloc`, `aligned_alloc`,
    /// `realloc`).
    pub enum AllocError {
        /// The requested size is zero or overflows the maximum block size, or
        /// the alignment is not a nonzero power of two.
        BadParam,
        /// No size class holds a free block large enough.
        NoMemory,
    }
}

define_error! {
    mod register_error {}
    /// Error type for [`MultiHeap::register`][1] and friends, and
    /// [`HeapRegistry::register`][2].
    ///
    /// [1]: crate::MultiHeap::register
    /// [2]: crate::HeapRegistry::register
    pub enum RegisterError {
        /// The region is too small to hold the control overhead and one
        /// minimal block, or too large to be described by the configured size
        /// classes. For a registry, the heap overlaps a registered one.
        BadParam,
    }
}

define_error! {
    mod add_pool_error {}
    /// Error type for [`Tlsf::add_pool`][1].
    ///
    /// [1]: crate::Tlsf::add_pool
    pub enum AddPoolError {
        /// The region is too small or too large for the engine, or it overlaps
        /// an existing pool.
        BadParam,
    }
}

define_error! {
    mod remove_pool_error {}
    /// Error type for [`Tlsf::remove_pool`][1].
    ///
    /// [1]: crate::Tlsf::remove_pool
    pub enum RemovePoolError {
        /// The pool identifier does not refer to a live pool.
        BadParam,
        /// The pool still contains allocated blocks.
        BadObjectState,
    }
}

impl From<AddPoolError> for RegisterError {
    #[inline]
    fn from(x: AddPoolError) -> Self {
        match x {
            AddPoolError::BadParam => Self::BadParam,
        }
    }
}

/// The kind of heap corruption detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    /// An address outside of every pool of the heap was dereferenced or
    /// passed to `free`.
    OutOfBounds,
    /// A block was freed while it was already free.
    DoubleFree,
    /// A block header holds an impossible size or flag combination.
    BadHeader,
    /// The canary preceding a poisoned allocation was overwritten.
    BadHeadCanary,
    /// The canary following a poisoned allocation was overwritten.
    BadTailCanary,
}

impl CorruptionKind {
    fn description(self) -> &'static str {
        match self {
            Self::OutOfBounds => "address outside of the heap",
            Self::DoubleFree => "block is already free",
            Self::BadHeader => "bad block header",
            Self::BadHeadCanary => "bad head canary",
            Self::BadTailCanary => "bad tail canary",
        }
    }
}

/// Describes a detected heap corruption. Passed to [`CorruptionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionReport {
    pub kind: CorruptionKind,
    /// The offending address.
    pub address: usize,
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CORRUPT HEAP: {} at {:#x}",
            self.kind.description(),
            self.address
        )
    }
}

/// The fatal-error primitive invoked when heap corruption is detected.
///
/// A corrupted free list can silently damage any future allocation, so the
/// handler must not return.
pub type CorruptionHandler = fn(&CorruptionReport) -> !;

/// The default [`CorruptionHandler`]. Panics with the report's message.
pub fn panic_on_corruption(report: &CorruptionReport) -> ! {
    log::error!("{}", report);
    panic!("{}", report)
}

/// A problem found by a consistency check.
///
/// Unlike [`CorruptionReport`], this is returned to the caller, who decides
/// whether to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityError {
    /// A short description of the violated property.
    pub what: &'static str,
    /// The address of the offending block.
    pub address: usize,
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CORRUPT HEAP: {} at {:#x}", self.what, self.address)
    }
}

impl std::error::Error for IntegrityError {}
