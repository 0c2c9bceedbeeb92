#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(doc)]
#[doc = include_str!("../CHANGELOG.md")]
pub mod _changelog_ {}

mod arena;
mod diag;
mod error;
mod heap;
mod lock;
mod multi_heap;
mod poison;
mod task;
pub mod tlsf;

pub use self::{
    arena::{HeapPtr, MemoryRegion, WORD},
    diag::{HeapCaps, HeapId, HeapRegistry, PerTaskInfo, RegionClass, TaskBlock, TaskTotals},
    error::{
        panic_on_corruption, AddPoolError, AllocError, CorruptionHandler, CorruptionKind,
        CorruptionReport, IntegrityError, RegisterError, RemovePoolError, ResultCode,
    },
    heap::{Allocation, Heap, HeapInfo},
    lock::{HeapLock, NullLock},
    multi_heap::{HeapConfig, MultiHeap},
    poison::{
        PoisonConfig, PoisonMode, PoisonedHeap, FREE_FILL_PATTERN, HEAD_CANARY_PATTERN,
        MALLOC_FILL_PATTERN, TAIL_CANARY_PATTERN,
    },
    task::{NoTaskIdentity, TaskIdentity, TaskTag},
    tlsf::{BlockInfo, PoolId, Tlsf, TlsfConfig},
};
