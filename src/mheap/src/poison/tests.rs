use quickcheck_macros::quickcheck;
use std::prelude::v1::*;

use super::*;

const BASE: usize = 0x3fc8_0000;

struct FixedTask(usize);

impl TaskIdentity for FixedTask {
    fn current_task(&self) -> Option<TaskTag> {
        TaskTag::new(self.0)
    }
}

fn heap(len: usize, mode: PoisonMode) -> PoisonedHeap {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PoisonConfig {
        mode,
        ..PoisonConfig::default()
    };
    PoisonedHeap::register(MemoryRegion::new(BASE, len).unwrap(), config).unwrap()
}

fn tracked_heap(len: usize, task: usize) -> PoisonedHeap {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = PoisonConfig {
        mode: PoisonMode::Light,
        track_owner: true,
        task_identity: Arc::new(FixedTask(task)),
        ..PoisonConfig::default()
    };
    PoisonedHeap::register(MemoryRegion::new(BASE, len).unwrap(), config).unwrap()
}

#[test]
fn canaries_survive_in_bounds_writes() {
    for &mode in &[PoisonMode::Light, PoisonMode::Comprehensive] {
        let heap = heap(4096, mode);
        let initial = heap.free_size();

        let p = heap.malloc(16).unwrap();
        heap.write(p, 0, &[0x11; 16]);
        assert!(heap.check(true));
        heap.free(Some(p));

        assert!(heap.check(true));
        assert_eq!(heap.free_size(), initial);
    }
}

#[test]
#[should_panic(expected = "CORRUPT HEAP")]
fn overrun_by_one_byte_is_caught_by_free() {
    let heap = heap(4096, PoisonMode::Light);
    let p = heap.malloc(16).unwrap();
    heap.write(p, 0, &[0x11; 16]);
    heap.free(Some(p));

    let p = heap.malloc(16).unwrap();
    heap.write(p, 0, &[0x11; 17]);
    heap.free(Some(p));
}

#[test]
fn overrun_is_caught_by_check() {
    let heap = heap(4096, PoisonMode::Light);
    let p = heap.malloc(16).unwrap();
    assert!(heap.check(true));
    heap.write(p, 16, &[0]);
    assert!(!heap.check(true));
}

#[test]
#[should_panic(expected = "CORRUPT HEAP")]
fn underrun_is_caught_by_free() {
    let heap = heap(4096, PoisonMode::Comprehensive);
    let p = heap.malloc(16).unwrap();
    let head = p.checked_sub(heap.head_size()).unwrap();
    heap.fill(head, 0, 1, 0);
    heap.free(Some(p));
}

#[test]
#[should_panic(expected = "CORRUPT HEAP")]
fn double_free_is_corruption() {
    let heap = heap(4096, PoisonMode::Light);
    let p = heap.malloc(16).unwrap();
    heap.free(Some(p));
    heap.free(Some(p));
}

#[test]
#[should_panic(expected = "CORRUPT HEAP")]
fn realloc_checks_canaries() {
    let heap = heap(4096, PoisonMode::Light);
    let p = heap.malloc(16).unwrap();
    heap.write(p, 16, &[0xff]);
    let _ = heap.realloc(Some(p), 100);
}

#[test]
fn sizes_exclude_overhead() {
    let heap = heap(4096, PoisonMode::Light);
    assert_eq!(heap.overhead(), 2 * WORD + 4);
    assert_eq!(heap.free_size(), heap.inner().free_size() - heap.overhead());
    assert_eq!(
        heap.minimum_free_size(),
        heap.inner().minimum_free_size() - heap.overhead()
    );

    let p = heap.malloc(30).unwrap();
    let head = p.checked_sub(heap.head_size()).unwrap();
    let size = heap.get_allocated_size(p);
    assert!(size >= 30);
    assert_eq!(size, heap.inner().get_allocated_size(head) - heap.overhead());

    let info = heap.get_info();
    let inner_info = heap.inner().get_info();
    assert_eq!(info.allocated_blocks, 1);
    assert_eq!(info.total_allocated_bytes, size);
    assert_eq!(
        info.largest_free_block,
        inner_info.largest_free_block - heap.overhead()
    );

    // The largest free block is usable as reported
    let q = heap.malloc(info.largest_free_block).unwrap();
    heap.free(Some(q));
    heap.free(Some(p));
}

#[test]
fn invalid_requests() {
    let heap = heap(1024, PoisonMode::Light);
    assert_eq!(heap.malloc(0), Err(AllocError::BadParam));
    assert_eq!(heap.aligned_alloc(0, 16), Err(AllocError::BadParam));
    assert_eq!(heap.aligned_alloc(16, 24), Err(AllocError::BadParam));
    assert_eq!(heap.malloc(usize::MAX), Err(AllocError::NoMemory));
    assert_eq!(heap.malloc(1024), Err(AllocError::NoMemory));
    heap.free(None);
    assert!(heap.check(true));
}

#[test]
fn comprehensive_fill_patterns() {
    let heap = heap(4096, PoisonMode::Comprehensive);
    assert!(heap.check(true));

    let a = heap.malloc(40).unwrap();
    let mut buf = [0u8; 40];
    heap.read(a, 0, &mut buf);
    assert_eq!(buf, [MALLOC_FILL_PATTERN; 40]);
    assert!(heap.verify_region(a, 40, false));
    assert!(!heap.verify_region(a, 40, true));

    heap.fill(a, 0, 40, 0x42);
    heap.free(Some(a));
    assert!(heap.verify_region(a, 40, true));
    assert!(heap.check(true));
}

#[test]
fn light_mode_skips_patterns() {
    let heap = heap(4096, PoisonMode::Light);
    let a = heap.malloc(40).unwrap();
    heap.fill(a, 0, 40, 0x42);
    assert!(heap.verify_region(a, 40, false));
    heap.free(Some(a));
    heap.write(a, 0, &[1, 2, 3]);
    assert!(heap.check(true));
}

#[test]
fn use_after_free_is_caught_by_check() {
    let heap = heap(4096, PoisonMode::Comprehensive);
    let a = heap.malloc(40).unwrap();
    let _b = heap.malloc(40).unwrap();
    heap.free(Some(a));
    assert!(heap.check(true));

    heap.write(a, 0, &[0x00]);
    assert!(!heap.check(true));
}

#[test]
fn owner_is_recorded() {
    let heap = tracked_heap(4096, 0x1234);
    assert_eq!(heap.head_size(), 3 * WORD);

    let a = heap.malloc(10).unwrap();
    let b = heap.aligned_alloc(20, 32).unwrap();
    assert_eq!(b.addr() % 32, 0);

    let mut allocations = Vec::new();
    heap.for_each_allocation(|x| allocations.push(*x));
    allocations.sort_by_key(|x| x.ptr);

    let owner = TaskTag::new(0x1234);
    let mut expected = vec![
        Allocation {
            ptr: a,
            size: 10,
            owner,
        },
        Allocation {
            ptr: b,
            size: 20,
            owner,
        },
    ];
    expected.sort_by_key(|x| x.ptr);
    assert_eq!(allocations, expected);

    heap.free(Some(a));
    heap.free(Some(b));
    assert!(heap.check(true));
}

#[test]
fn realloc_preserves_contents() {
    for &mode in &[PoisonMode::Light, PoisonMode::Comprehensive] {
        let heap = heap(4096, mode);
        let initial = heap.free_size();

        let a = heap.realloc(None, 10).unwrap().unwrap();
        heap.write(a, 0, b"0123456789");
        let pin = heap.malloc(8).unwrap();

        let a = heap.realloc(Some(a), 500).unwrap().unwrap();
        let mut buf = [0u8; 10];
        heap.read(a, 0, &mut buf);
        assert_eq!(&buf, b"0123456789");
        assert!(heap.check(true));

        let a = heap.realloc(Some(a), 4).unwrap().unwrap();
        let mut buf = [0u8; 4];
        heap.read(a, 0, &mut buf);
        assert_eq!(&buf, b"0123");
        assert!(heap.check(true));

        assert_eq!(heap.realloc(Some(a), 0), Ok(None));
        heap.free(Some(pin));
        assert_eq!(heap.free_size(), initial);
    }
}

#[test]
fn aligned_alloc_with_offset() {
    let heap = heap(8192, PoisonMode::Comprehensive);
    for &align in &[8, 16, 64, 256] {
        let p = heap.aligned_alloc_offs(24, align, 8).unwrap();
        assert_eq!((p.addr() + 8) % align, 0);
        heap.write(p, 0, &[0x77; 24]);
        assert!(heap.check(true));
        heap.free(Some(p));
    }
}

#[test]
fn comprehensive_check_passes_after_aligned_alloc() {
    let heap = heap(4096, PoisonMode::Comprehensive);
    let p = heap.aligned_alloc_offs(24, 16, 8).unwrap();
    assert!(heap.check(true));
    let q = heap.malloc(100).unwrap();
    heap.free(Some(p));
    assert!(heap.check(true));

    // Carve a new allocation out of the merged block
    let r = heap.malloc(24).unwrap();
    assert!(heap.verify_region(r, 24, false));
    heap.free(Some(q));
    heap.free(Some(r));
    assert!(heap.check(true));
}

#[quickcheck]
fn random(bytecode: Vec<u8>) {
    random_inner(bytecode);
}

fn random_inner(bytecode: Vec<u8>) -> Option<()> {
    let heap = heap(8192, PoisonMode::Comprehensive);
    let initial = heap.free_size();
    let mut live: Vec<(HeapPtr, usize, u8)> = Vec::new();

    let mut it = bytecode.iter().cloned();
    loop {
        assert!(heap.check(true));
        for &(p, size, seed) in &live {
            let mut buf = vec![0u8; size];
            heap.read(p, 0, &mut buf);
            assert!(buf.iter().all(|&b| b == seed), "{:?} was modified", p);
        }

        match it.next() {
            None => break,
            Some(op) => match op % 3 {
                0 => {
                    let size = (it.next()? as usize * 8 + it.next()? as usize) % 1500 + 1;
                    let seed = it.next()?;
                    log::trace!("malloc {}", size);
                    if let Ok(p) = heap.malloc(size) {
                        heap.fill(p, 0, size, seed);
                        live.push((p, size, seed));
                    }
                }
                1 => {
                    let i = it.next()? as usize;
                    if !live.is_empty() {
                        let (p, _, _) = live.swap_remove(i % live.len());
                        log::trace!("free {:?}", p);
                        heap.free(Some(p));
                    }
                }
                2 => {
                    let i = it.next()? as usize;
                    let size = it.next()? as usize * 4 + 1;
                    if !live.is_empty() {
                        let i = i % live.len();
                        let (p, old_size, seed) = live[i];
                        log::trace!("realloc {:?} {}", p, size);
                        if let Ok(Some(p)) = heap.realloc(Some(p), size) {
                            let mut buf = vec![0u8; old_size.min(size)];
                            heap.read(p, 0, &mut buf);
                            assert!(buf.iter().all(|&b| b == seed));
                            heap.fill(p, 0, size, seed);
                            live[i] = (p, size, seed);
                        }
                    }
                }
                _ => unreachable!(),
            },
        }
    }

    for (p, _, _) in live {
        heap.free(Some(p));
    }
    assert_eq!(heap.free_size(), initial);
    Some(())
}
