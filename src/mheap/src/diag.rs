//! Heap registry and per-task diagnostics
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    arena::HeapPtr,
    error::{
        panic_on_corruption, AllocError, CorruptionHandler, CorruptionKind, CorruptionReport,
        RegisterError,
    },
    heap::Heap,
    task::TaskTag,
};

bitflags::bitflags! {
    /// Capabilities of the memory backing a registered heap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct HeapCaps: u32 {
        /// Instructions can be fetched from the memory.
        const EXEC = 1 << 0;

        /// The memory supports byte (not just word) accesses.
        const BYTE_ADDRESSABLE = 1 << 1;

        /// The memory is external RAM.
        const EXTERNAL = 1 << 2;
    }
}

/// The region category used to bucket per-task totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegionClass {
    /// Byte-addressable, non-executable memory.
    Data = 0,
    Executable = 1,
    /// Executable and byte-addressable memory.
    Combined = 2,
    External = 3,
}

impl RegionClass {
    pub const COUNT: usize = 4;

    pub fn from_caps(caps: HeapCaps) -> Self {
        if caps.contains(HeapCaps::EXTERNAL) {
            Self::External
        } else if caps.contains(HeapCaps::EXEC | HeapCaps::BYTE_ADDRESSABLE) {
            Self::Combined
        } else if caps.contains(HeapCaps::EXEC) {
            Self::Executable
        } else {
            Self::Data
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Identifies a heap in a [`HeapRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeapId(usize);

impl HeapId {
    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

/// The live allocation total of one task, per [`RegionClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTotals {
    /// `None` groups the allocations without an owner tag.
    pub task: Option<TaskTag>,
    /// Indexed by [`RegionClass::index`].
    pub size: [usize; RegionClass::COUNT],
}

/// A live allocation of a task selected by the filter passed to
/// [`HeapRegistry::per_task_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskBlock {
    pub task: Option<TaskTag>,
    pub address: HeapPtr,
    pub size: usize,
    pub region: RegionClass,
}

/// The result of [`HeapRegistry::per_task_info`].
#[derive(Debug, Clone)]
pub struct PerTaskInfo<const MAX_TOTALS: usize, const MAX_BLOCKS: usize> {
    pub totals: ArrayVec<TaskTotals, MAX_TOTALS>,
    pub blocks: ArrayVec<TaskBlock, MAX_BLOCKS>,
    /// Set if some tasks or blocks didn't fit.
    pub truncated: bool,
}

struct RegisteredHeap<H> {
    heap: H,
    caps: HeapCaps,
    region: RegionClass,
}

/// A set of heaps tagged with capabilities.
///
/// Allocations are routed by capability, and deallocations to the heap
/// containing the pointer.
pub struct HeapRegistry<H> {
    heaps: Vec<RegisteredHeap<H>>,
    on_corruption: CorruptionHandler,
}

impl<H> fmt::Debug for HeapRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.heaps.iter().map(|h| (h.caps, h.region)))
            .finish()
    }
}

impl<H: Heap> Default for HeapRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Heap> HeapRegistry<H> {
    pub fn new() -> Self {
        Self::with_on_corruption(panic_on_corruption)
    }

    /// Construct a `HeapRegistry` that reports unroutable pointers through
    /// `on_corruption`.
    pub fn with_on_corruption(on_corruption: CorruptionHandler) -> Self {
        Self {
            heaps: Vec::new(),
            on_corruption,
        }
    }

    /// Add a heap. Fails if its region overlaps that of a registered heap,
    /// since deallocations are routed by address.
    pub fn register(&mut self, heap: H, caps: HeapCaps) -> Result<HeapId, RegisterError> {
        let range = heap.range();
        if let Some(other) = self.heaps.iter().find(|h| {
            let r = h.heap.range();
            r.start < range.end && range.start < r.end
        }) {
            log::warn!(
                "heap at {:#x}..{:#x} overlaps a registered heap at {:#x}..{:#x}",
                range.start,
                range.end,
                other.heap.range().start,
                other.heap.range().end
            );
            return Err(RegisterError::BadParam);
        }

        let region = RegionClass::from_caps(caps);
        log::debug!(
            "registering heap #{} with {:?} ({:?})",
            self.heaps.len(),
            caps,
            region
        );
        self.heaps.push(RegisteredHeap { heap, caps, region });
        Ok(HeapId(self.heaps.len() - 1))
    }

    pub fn heap(&self, id: HeapId) -> Option<&H> {
        self.heaps.get(id.0).map(|h| &h.heap)
    }

    pub fn caps(&self, id: HeapId) -> Option<HeapCaps> {
        self.heaps.get(id.0).map(|h| h.caps)
    }

    pub fn heaps(&self) -> impl Iterator<Item = (HeapId, &H)> + '_ {
        self.heaps.iter().enumerate().map(|(i, h)| (HeapId(i), &h.heap))
    }

    /// Find the heap containing `ptr`.
    pub fn heap_for_ptr(&self, ptr: HeapPtr) -> Option<HeapId> {
        self.heaps
            .iter()
            .position(|h| h.heap.contains(ptr))
            .map(HeapId)
    }

    /// Allocate from the first heap, in registration order, that has all of
    /// `caps` and can satisfy the request.
    pub fn malloc_caps(&self, size: usize, caps: HeapCaps) -> Result<HeapPtr, AllocError> {
        for h in self.heaps.iter().filter(|h| h.caps.contains(caps)) {
            match h.heap.malloc(size) {
                Err(AllocError::NoMemory) => continue,
                result => return result,
            }
        }
        Err(AllocError::NoMemory)
    }

    /// Deallocate `ptr` from the heap containing it. A pointer that belongs
    /// to no registered heap is reported as corruption.
    pub fn free(&self, ptr: Option<HeapPtr>) {
        let ptr = match ptr {
            Some(x) => x,
            None => return,
        };
        match self.heap_for_ptr(ptr) {
            Some(id) => self.heaps[id.0].heap.free(Some(ptr)),
            None => (self.on_corruption)(&CorruptionReport {
                kind: CorruptionKind::OutOfBounds,
                address: ptr.addr(),
            }),
        }
    }

    /// Get the total free bytes of the heaps that have all of `caps`.
    pub fn free_size(&self, caps: HeapCaps) -> usize {
        self.heaps
            .iter()
            .filter(|h| h.caps.contains(caps))
            .map(|h| h.heap.free_size())
            .sum()
    }

    /// Check every heap. Doesn't stop at the first failure so that every
    /// problem is logged.
    pub fn check_all(&self, print_errors: bool) -> bool {
        self.heaps
            .iter()
            .fold(true, |ok, h| h.heap.check(print_errors) & ok)
    }

    /// Accumulate the live allocations of every heap by owning task.
    ///
    /// Allocations of the tasks in `filter` are also listed individually.
    pub fn per_task_info<const MAX_TOTALS: usize, const MAX_BLOCKS: usize>(
        &self,
        filter: &[Option<TaskTag>],
    ) -> PerTaskInfo<MAX_TOTALS, MAX_BLOCKS> {
        let mut info = PerTaskInfo {
            totals: ArrayVec::new(),
            blocks: ArrayVec::new(),
            truncated: false,
        };

        for h in self.heaps.iter() {
            let region = h.region;
            h.heap.for_each_allocation(&mut |allocation| {
                let task = allocation.owner;

                match info.totals.iter_mut().find(|t| t.task == task) {
                    Some(totals) => totals.size[region.index()] += allocation.size,
                    None => {
                        let mut totals = TaskTotals {
                            task,
                            size: [0; RegionClass::COUNT],
                        };
                        totals.size[region.index()] = allocation.size;
                        if info.totals.try_push(totals).is_err() {
                            info.truncated = true;
                        }
                    }
                }

                if filter.contains(&task) {
                    let block = TaskBlock {
                        task,
                        address: allocation.ptr,
                        size: allocation.size,
                        region,
                    };
                    if info.blocks.try_push(block).is_err() {
                        info.truncated = true;
                    }
                }
            });
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arena::MemoryRegion,
        multi_heap::MultiHeap,
        poison::{PoisonConfig, PoisonMode, PoisonedHeap},
        task::TaskIdentity,
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct SwitchableTask(AtomicUsize);

    impl TaskIdentity for SwitchableTask {
        fn current_task(&self) -> Option<TaskTag> {
            TaskTag::new(self.0.load(Ordering::Relaxed))
        }
    }

    fn poisoned(base: usize, identity: &Arc<SwitchableTask>) -> PoisonedHeap {
        let config = PoisonConfig {
            mode: PoisonMode::Light,
            track_owner: true,
            task_identity: identity.clone(),
            ..PoisonConfig::default()
        };
        PoisonedHeap::register(MemoryRegion::new(base, 4096).unwrap(), config).unwrap()
    }

    #[test]
    fn region_class_from_caps() {
        use HeapCaps as C;
        assert_eq!(RegionClass::from_caps(C::empty()), RegionClass::Data);
        assert_eq!(
            RegionClass::from_caps(C::BYTE_ADDRESSABLE),
            RegionClass::Data
        );
        assert_eq!(RegionClass::from_caps(C::EXEC), RegionClass::Executable);
        assert_eq!(
            RegionClass::from_caps(C::EXEC | C::BYTE_ADDRESSABLE),
            RegionClass::Combined
        );
        assert_eq!(
            RegionClass::from_caps(C::EXEC | C::EXTERNAL),
            RegionClass::External
        );
    }

    #[test]
    fn routing_by_caps_and_address() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut registry = HeapRegistry::new();
        let iram = registry.register(
            MultiHeap::register(MemoryRegion::new(0x4008_0000, 1024).unwrap()).unwrap(),
            HeapCaps::EXEC,
        )
        .unwrap();
        let dram = registry.register(
            MultiHeap::register(MemoryRegion::new(0x3ffb_0000, 4096).unwrap()).unwrap(),
            HeapCaps::BYTE_ADDRESSABLE,
        )
        .unwrap();

        let a = registry.malloc_caps(100, HeapCaps::EXEC).unwrap();
        assert_eq!(registry.heap_for_ptr(a), Some(iram));
        let b = registry
            .malloc_caps(100, HeapCaps::BYTE_ADDRESSABLE)
            .unwrap();
        assert_eq!(registry.heap_for_ptr(b), Some(dram));
        assert_eq!(
            registry.malloc_caps(100, HeapCaps::EXTERNAL),
            Err(AllocError::NoMemory)
        );
        assert_eq!(registry.malloc_caps(0, HeapCaps::EXEC), Err(AllocError::BadParam));

        // Falls through to the next heap with the same caps
        let c = registry.malloc_caps(2000, HeapCaps::empty()).unwrap();
        assert_eq!(registry.heap_for_ptr(c), Some(dram));

        let before = registry.free_size(HeapCaps::empty());
        registry.free(Some(a));
        assert!(registry.free_size(HeapCaps::empty()) > before);
        assert_eq!(
            registry.free_size(HeapCaps::EXEC),
            registry.heap(iram).unwrap().free_size()
        );
        registry.free(Some(b));
        registry.free(Some(c));
        registry.free(None);
        assert!(registry.check_all(true));
    }

    #[test]
    #[should_panic(expected = "CORRUPT HEAP")]
    fn free_of_unknown_pointer_is_corruption() {
        let mut registry = HeapRegistry::new();
        registry
            .register(
                MultiHeap::register(MemoryRegion::new(0x3ffb_0000, 1024).unwrap()).unwrap(),
                HeapCaps::BYTE_ADDRESSABLE,
            )
            .unwrap();
        registry.free(HeapPtr::new(0x1000));
    }

    #[test]
    fn overlapping_heaps_are_rejected() {
        let _ = env_logger::builder().is_test(true).try_init();
        let region = || MemoryRegion::new(0x3ffb_0000, 4096).unwrap();
        let mut registry = HeapRegistry::new();
        let h0 = registry
            .register(MultiHeap::register(region()).unwrap(), HeapCaps::BYTE_ADDRESSABLE)
            .unwrap();
        assert_eq!(
            registry
                .register(MultiHeap::register(region()).unwrap(), HeapCaps::EXEC)
                .err(),
            Some(RegisterError::BadParam)
        );
        assert_eq!(
            registry
                .register(
                    MultiHeap::register(MemoryRegion::new(0x3ffb_0800, 4096).unwrap()).unwrap(),
                    HeapCaps::EXEC
                )
                .err(),
            Some(RegisterError::BadParam)
        );
        assert_eq!(registry.heaps().count(), 1);

        // An adjacent region is fine
        let h1 = registry
            .register(
                MultiHeap::register(MemoryRegion::new(0x3ffb_1000, 4096).unwrap()).unwrap(),
                HeapCaps::EXEC,
            )
            .unwrap();

        let initial = registry.heap(h0).unwrap().free_size();
        let p = registry.malloc_caps(100, HeapCaps::BYTE_ADDRESSABLE).unwrap();
        let q = registry.malloc_caps(100, HeapCaps::EXEC).unwrap();
        assert_eq!(registry.heap_for_ptr(p), Some(h0));
        assert_eq!(registry.heap_for_ptr(q), Some(h1));
        registry.free(Some(p));
        assert_eq!(registry.heap(h0).unwrap().free_size(), initial);
        assert!(registry.heap(h1).unwrap().free_size() < initial);
        registry.free(Some(q));
        assert!(registry.check_all(true));
    }

    #[test]
    fn per_task_totals() {
        let _ = env_logger::builder().is_test(true).try_init();
        let identity = Arc::new(SwitchableTask::default());
        let mut registry = HeapRegistry::new();
        registry
            .register(poisoned(0x3ffb_0000, &identity), HeapCaps::BYTE_ADDRESSABLE)
            .unwrap();
        registry
            .register(poisoned(0x4008_0000, &identity), HeapCaps::EXEC)
            .unwrap();

        let t1 = TaskTag::new(0x100);
        let t2 = TaskTag::new(0x200);

        let _anon = registry.malloc_caps(8, HeapCaps::empty()).unwrap();
        identity.0.store(0x100, Ordering::Relaxed);
        let a = registry.malloc_caps(40, HeapCaps::BYTE_ADDRESSABLE).unwrap();
        let _ = registry.malloc_caps(24, HeapCaps::EXEC).unwrap();
        identity.0.store(0x200, Ordering::Relaxed);
        let _ = registry.malloc_caps(16, HeapCaps::EXEC).unwrap();

        let info = registry.per_task_info::<4, 4>(&[t1]);
        assert!(!info.truncated);

        let totals_of = |task| info.totals.iter().find(|t| t.task == task).unwrap().size;
        assert_eq!(totals_of(None), [8, 0, 0, 0]);
        assert_eq!(totals_of(t1), [40, 24, 0, 0]);
        assert_eq!(totals_of(t2), [0, 16, 0, 0]);

        assert_eq!(info.blocks.len(), 2);
        assert!(info.blocks.iter().all(|b| b.task == t1));
        assert!(info.blocks.contains(&TaskBlock {
            task: t1,
            address: a,
            size: 40,
            region: RegionClass::Data,
        }));

        // Bounded output
        let info = registry.per_task_info::<2, 1>(&[t1]);
        assert!(info.truncated);
        assert_eq!(info.totals.len(), 2);
        assert_eq!(info.blocks.len(), 1);
    }
}
