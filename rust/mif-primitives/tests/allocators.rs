use mif_primitives::{BitmapAllocator, Exhausted, MifRamRef, RAM_BLOCK_SIZE, RamAllocator};

#[test]
fn bitmap_runs_never_overlap() {
    let mut bm = BitmapAllocator::new(16);
    let sizes = [3u32, 1, 4, 2, 5];
    let mut runs = Vec::new();
    for n in sizes {
        let first = bm.alloc_n(n).unwrap();
        runs.push((first, n));
    }
    assert_eq!(bm.used_count(), 15);
    for (i, &(a, an)) in runs.iter().enumerate() {
        for &(b, bn) in &runs[i + 1..] {
            assert!(a + an <= b || b + bn <= a, "{a}+{an} overlaps {b}+{bn}");
        }
    }
    assert_eq!(bm.alloc_n(2), Err(Exhausted { requested: 2 }));
}

#[test]
fn freed_bits_are_reusable() {
    let mut bm = BitmapAllocator::new(16);
    let a = bm.alloc_n(4).unwrap();
    let b = bm.alloc_n(4).unwrap();
    bm.free_n(a, 4);
    assert_eq!(bm.alloc_n(4), Ok(a));
    bm.free_n(b, 4);
    assert_eq!(bm.alloc_n(8), Ok(4));
}

#[test]
fn ram_allocations_are_disjoint_and_recoverable() {
    let base = MifRamRef::new(0x1_0000);
    let mut ram = RamAllocator::new(base, 64 * 1024);
    let total = ram.total_blocks();

    let mut live = Vec::new();
    for (i, bytes) in [100u32, 64, 4000, 1, 256, 777].into_iter().enumerate() {
        let align = if i % 2 == 0 { 256 } else { 4 };
        let r = ram.alloc(bytes, align).unwrap();
        assert!(r.is_aligned(align));
        live.push((r.get(), r.get() + bytes.div_ceil(RAM_BLOCK_SIZE) * RAM_BLOCK_SIZE));
    }
    live.sort();
    for pair in live.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }

    for (start, _) in live {
        ram.free(MifRamRef::new(start)).unwrap();
    }
    assert_eq!(ram.free_blocks(), total);
    assert_eq!(ram.alloc(64 * 1024, 1), Some(base));
}
