use quickcheck_macros::quickcheck;
use std::prelude::v1::*;

use super::*;

const BASE: usize = 0x3fc8_0000;

fn heap(len: usize) -> MultiHeap {
    let _ = env_logger::builder().is_test(true).try_init();
    MultiHeap::register(MemoryRegion::new(BASE, len).unwrap()).unwrap()
}

fn assert_accounting(heap: &MultiHeap, live: &[HeapPtr]) {
    let charged: usize = live
        .iter()
        .map(|&p| heap.get_allocated_size(p) + ALLOC_OVERHEAD)
        .sum();
    assert_eq!(
        heap.free_size() + charged + heap.control_overhead(),
        heap.pool_size()
    );
    assert!(heap.minimum_free_size() <= heap.free_size());
    assert!(heap.check(true));
}

fn dump_string(heap: &MultiHeap) -> String {
    let mut s = String::new();
    heap.dump(&mut s).unwrap();
    s
}

#[test]
fn register_and_basic_usage() {
    let heap = heap(4096);
    assert_eq!(heap.free_size(), heap.minimum_free_size());
    assert!(heap.free_size() <= 4096 - heap.control_overhead());

    let a = heap.malloc(100).unwrap();
    assert!(heap.contains(a));
    assert!(heap.get_allocated_size(a) >= 100);
    assert_eq!(heap.malloc(5000), Err(AllocError::NoMemory));
    assert_accounting(&heap, &[a]);

    heap.free(Some(a));
    let info = heap.get_info();
    assert_eq!(info.allocated_blocks, 0);
    assert_eq!(info.total_allocated_bytes, 0);
    assert_eq!(info.free_blocks, 1);
    assert_eq!(info.total_blocks, 1);
    assert_accounting(&heap, &[]);
}

#[test]
fn register_too_small() {
    let region = MemoryRegion::new(BASE, 16).unwrap();
    assert_eq!(MultiHeap::register(region).err(), Some(RegisterError::BadParam));
}

#[test]
fn free_none_is_noop() {
    let heap = heap(1024);
    let before = heap.free_size();
    heap.free(None);
    assert_eq!(heap.free_size(), before);
}

#[test]
fn invalid_sizes_leave_state_unchanged() {
    let heap = heap(1024);
    let before = dump_string(&heap);
    assert_eq!(heap.malloc(0), Err(AllocError::BadParam));
    assert_eq!(heap.aligned_alloc(16, 0), Err(AllocError::BadParam));
    assert_eq!(heap.aligned_alloc(16, 48), Err(AllocError::BadParam));
    assert_eq!(heap.malloc(1024), Err(AllocError::NoMemory));
    assert_eq!(dump_string(&heap), before);
    assert_eq!(heap.minimum_free_size(), heap.free_size());
}

#[test]
fn malloc_free_restores_layout() {
    let heap = heap(4096);
    let _pinned = heap.malloc(40).unwrap();
    let before = dump_string(&heap);
    let free_before = heap.free_size();
    for size in 1..3000 {
        if let Ok(p) = heap.malloc(size) {
            heap.free(Some(p));
        }
        assert_eq!(heap.free_size(), free_before, "size = {}", size);
    }
    // Only the watermark moved
    assert!(heap.minimum_free_size() < free_before);
    heap.reset_minimum_free_bytes();
    assert_eq!(dump_string(&heap), before);
}

#[test]
fn reuse_keeps_neighbors_intact() {
    let heap = heap(4096);
    let a = heap.malloc(64).unwrap();
    let b = heap.malloc(64).unwrap();
    let c = heap.malloc(64).unwrap();
    heap.write(a, 0, &[0xaa; 64]);
    heap.write(b, 0, &[0xbb; 64]);
    heap.write(c, 0, &[0xcc; 64]);

    heap.free(Some(b));
    let d = heap.malloc(32).unwrap();
    heap.fill(d, 0, 32, 0xdd);

    let mut buf = [0u8; 64];
    heap.read(a, 0, &mut buf);
    assert_eq!(buf, [0xaa; 64]);
    heap.read(c, 0, &mut buf);
    assert_eq!(buf, [0xcc; 64]);
    assert_accounting(&heap, &[a, c, d]);
}

#[test]
fn aligned_alloc_honors_alignment_and_offset() {
    let heap = heap(8192);
    let mut align = 1;
    while align <= heap.pool_size() {
        for &offset in &[0, 8, 24] {
            if offset % align.min(ALLOC_OVERHEAD) != 0 {
                continue;
            }
            match heap.aligned_alloc_offs(48, align, offset) {
                Ok(p) => {
                    assert_eq!((p.addr() + offset) % align, 0);
                    assert_accounting(&heap, &[p]);
                    heap.free(Some(p));
                }
                Err(e) => {
                    assert_eq!(e, AllocError::NoMemory);
                    assert!(align > 1024);
                }
            }
        }
        align <<= 1;
    }
    assert_accounting(&heap, &[]);
}

#[test]
fn realloc_accounting() {
    let heap = heap(4096);
    let initial = heap.free_size();

    let a = heap.realloc(None, 100).unwrap().unwrap();
    heap.write(a, 0, b"0123456789");
    let _b = heap.malloc(16).unwrap();

    let a = heap.realloc(Some(a), 1000).unwrap().unwrap();
    let mut buf = [0u8; 10];
    heap.read(a, 0, &mut buf);
    assert_eq!(&buf, b"0123456789");
    assert_accounting(&heap, &[a, _b]);

    let a = heap.realloc(Some(a), 24).unwrap().unwrap();
    assert_accounting(&heap, &[a, _b]);

    assert_eq!(heap.realloc(Some(a), 5000), Err(AllocError::NoMemory));
    assert_eq!(heap.realloc(Some(a), 0), Ok(None));
    heap.free(Some(_b));
    assert_eq!(heap.free_size(), initial);
}

#[test]
fn watermark() {
    let heap = heap(4096);
    let initial = heap.minimum_free_size();
    let a = heap.malloc(1000).unwrap();
    let low = heap.minimum_free_size();
    assert!(low < initial);
    heap.free(Some(a));
    assert_eq!(heap.minimum_free_size(), low);
    assert!(heap.free_size() > low);

    heap.reset_minimum_free_bytes();
    assert_eq!(heap.minimum_free_size(), heap.free_size());
}

#[test]
fn largest_free_block_never_overestimates() {
    let heap = heap(16384);
    let mut live = Vec::new();
    for size in [100, 2000, 37, 5000, 900] {
        live.push(heap.malloc(size).unwrap());
    }
    heap.free(Some(live.swap_remove(1)));
    heap.free(Some(live.swap_remove(2)));

    let info = heap.get_info();
    log::trace!("{:?}", info);
    assert_eq!(info.allocated_blocks, live.len());
    assert_eq!(info.total_blocks, info.allocated_blocks + info.free_blocks);
    assert_eq!(info.total_free_bytes, heap.free_size());
    assert_eq!(
        info.total_allocated_bytes,
        live.iter().map(|&p| heap.get_allocated_size(p)).sum::<usize>()
    );
    let p = heap.malloc(info.largest_free_block).unwrap();
    heap.free(Some(p));
}

#[test]
fn dump_lists_blocks() {
    let heap = heap(1024);
    let a = heap.malloc(32).unwrap();
    let text = dump_string(&heap);
    log::trace!("{}", text);
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        format!("Heap at {:#x}..{:#x}", BASE, BASE + 1024)
    );
    assert_eq!(
        lines.next().unwrap(),
        format!("Block {} size 32 used", a)
    );
    assert!(lines.next().unwrap().ends_with("free"));
    heap.dump_log();
}

#[test]
fn check_detects_overrun_into_header() {
    let heap = heap(1024);
    let a = heap.malloc(32).unwrap();
    let _b = heap.malloc(32).unwrap();
    assert!(heap.check(true));
    heap.fill(a, 0, 32 + ALLOC_OVERHEAD, 0x5a);
    assert!(!heap.check(true));
    assert!(!heap.check(false));
}

#[test]
fn walk_reports_every_block() {
    let heap = heap(1024);
    let a = heap.malloc(32).unwrap();
    let mut blocks = Vec::new();
    heap.walk(|b| {
        blocks.push(*b);
        true
    });
    assert_eq!(blocks.len(), 2);
    assert_eq!((blocks[0].ptr, blocks[0].used), (a, true));
    assert!(!blocks[1].used);

    let mut allocations = Vec::new();
    Heap::for_each_allocation(&heap, &mut |x| allocations.push(*x));
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].owner, None);
}

#[test]
#[should_panic(expected = "CORRUPT HEAP")]
fn free_outside_heap_is_corruption() {
    let heap = heap(1024);
    heap.free(HeapPtr::new(BASE + 4096));
}

#[test]
#[should_panic(expected = "not reentrant")]
fn nested_call_panics() {
    let heap = heap(1024);
    heap.malloc(32).unwrap();
    heap.walk(|_| {
        let _ = heap.malloc(16);
        true
    });
}

#[quickcheck]
fn accounting_identity(bytecode: Vec<u8>) {
    accounting_identity_inner(bytecode);
}

fn accounting_identity_inner(bytecode: Vec<u8>) -> Option<()> {
    let heap = heap(8192);
    let mut live: Vec<HeapPtr> = Vec::new();
    let mut watermark = heap.minimum_free_size();

    let mut it = bytecode.iter().cloned();
    loop {
        assert_accounting(&heap, &live);
        assert!(heap.minimum_free_size() <= watermark);
        watermark = heap.minimum_free_size();

        match it.next()? % 4 {
            0 => {
                let size = u16::from_le_bytes([it.next()?, it.next()?]) as usize % 3000;
                log::trace!("malloc {}", size);
                if let Ok(p) = heap.malloc(size) {
                    live.push(p);
                }
            }
            1 => {
                let size = it.next()? as usize * 4;
                let align = 1 << (it.next()? % 9);
                if let Ok(p) = heap.aligned_alloc(size, align) {
                    assert_eq!(p.addr() % align, 0);
                    live.push(p);
                }
            }
            2 => {
                let i = it.next()? as usize;
                if !live.is_empty() {
                    let p = live.swap_remove(i % live.len());
                    log::trace!("free {:?}", p);
                    heap.free(Some(p));
                }
            }
            3 => {
                let i = it.next()? as usize;
                let size = u16::from_le_bytes([it.next()?, it.next()?]) as usize % 3000;
                if !live.is_empty() {
                    let i = i % live.len();
                    log::trace!("realloc {:?} {}", live[i], size);
                    match heap.realloc(Some(live[i]), size) {
                        Ok(Some(p)) => live[i] = p,
                        Ok(None) => {
                            live.swap_remove(i);
                        }
                        Err(_) => {}
                    }
                }
            }
            _ => unreachable!(),
        }
    }
}
