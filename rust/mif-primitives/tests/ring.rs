//! Behaviour of the packet ring as seen from both ends.

use mif_primitives::{HeapRegion, MifRamRef, PacketRing, RingLayout};

const SLOT_COUNT: u32 = 8;
const SLOT_SIZE: u32 = 8;

fn make_ring(heap: &HeapRegion) -> (PacketRing, PacketRing) {
    let layout = RingLayout {
        buffer: MifRamRef::new(128),
        slot_count: SLOT_COUNT,
        slot_size: SLOT_SIZE,
        read_index: MifRamRef::new(0),
        write_index: MifRamRef::new(64),
    };
    let producer = unsafe { PacketRing::init(heap.region(), layout) }.unwrap();
    let consumer = unsafe { PacketRing::attach(heap.region(), layout) }.unwrap();
    (producer, consumer)
}

fn assert_space_invariant(ring: &PacketRing) {
    assert_eq!(ring.free_space() + ring.used_space(), SLOT_COUNT - 1);
}

#[test]
fn packets_come_out_in_order() {
    let heap = HeapRegion::new_zeroed(4096);
    let (tx, rx) = make_ring(&heap);

    let mut next_out = 0u8;
    let mut buf = [0u8; 8];
    for i in 0u8..40 {
        assert!(tx.write(&[i; 8]));
        assert_space_invariant(&tx);
        if i % 3 == 2 {
            while rx.read(&mut buf) == 8 {
                assert_eq!(buf, [next_out; 8]);
                next_out += 1;
                assert_space_invariant(&rx);
            }
        }
    }
    while rx.read(&mut buf) == 8 {
        assert_eq!(buf, [next_out; 8]);
        next_out += 1;
    }
    assert_eq!(next_out, 40);
}

#[test]
fn ring_keeps_one_slot_free() {
    let heap = HeapRegion::new_zeroed(4096);
    let (tx, _rx) = make_ring(&heap);
    for _ in 0..SLOT_COUNT - 1 {
        assert!(tx.write(&[1; 8]));
    }
    assert_eq!(tx.free_space(), 0);
    assert!(!tx.write(&[1]));
    assert_space_invariant(&tx);
}

#[test]
fn oversize_write_leaves_ring_unchanged() {
    let heap = HeapRegion::new_zeroed(4096);
    let (tx, rx) = make_ring(&heap);
    assert!(tx.write(&[7; 20]));
    let before = tx.status();
    let mut snapshot = [0u8; (SLOT_COUNT * SLOT_SIZE) as usize];
    heap.region()
        .read_bytes(MifRamRef::new(128), &mut snapshot)
        .unwrap();

    // 3 slots used, 4 free: 5 slots worth cannot fit.
    assert!(!tx.write(&[0xee; 33]));
    assert!(!tx.write_gather(&[&[0xee; 16][..], &[0xee; 17][..]]));

    assert_eq!(tx.status(), before);
    let mut after = [0u8; (SLOT_COUNT * SLOT_SIZE) as usize];
    heap.region()
        .read_bytes(MifRamRef::new(128), &mut after)
        .unwrap();
    assert_eq!(snapshot, after);

    let mut buf = [0u8; 24];
    assert_eq!(rx.read(&mut buf), 24);
    assert_eq!(&buf[..20], &[7; 20]);
    assert_eq!(&buf[20..], &[0; 4]);
}

#[test]
fn gather_matches_single_write() {
    let parts: [&[u8]; 4] = [&[1, 2, 3], &[4, 5, 6, 7, 8, 9, 10], &[], &[11, 12, 13, 14, 15]];
    let joined: Vec<u8> = parts.concat();

    // Offset the start so the data wraps around the end of the buffer.
    for lead in 0..SLOT_COUNT {
        let heap_a = HeapRegion::new_zeroed(4096);
        let heap_b = HeapRegion::new_zeroed(4096);
        let (tx_a, rx_a) = make_ring(&heap_a);
        let (tx_b, rx_b) = make_ring(&heap_b);
        let mut sink = [0u8; 8];
        for _ in 0..lead {
            assert!(tx_a.write(&[0xaa; 8]));
            assert!(tx_b.write(&[0xaa; 8]));
            rx_a.read(&mut sink);
            rx_b.read(&mut sink);
        }

        assert!(tx_a.write_gather(&parts));
        assert!(tx_b.write(&joined));
        assert_eq!(tx_a.status(), tx_b.status());

        let mut out_a = [0u8; 16];
        let mut out_b = [0u8; 16];
        assert_eq!(rx_a.read(&mut out_a), 16);
        assert_eq!(rx_b.read(&mut out_b), 16);
        assert_eq!(out_a, out_b);
        assert_eq!(&out_a[..15], joined.as_slice());
        assert_eq!(out_a[15], 0);
    }
}

#[test]
fn peek_drains_one_packet_at_a_time() {
    let heap = HeapRegion::new_zeroed(4096);
    let (tx, rx) = make_ring(&heap);
    for i in 0u8..3 {
        assert!(tx.write(&[i, 0xff]));
    }

    let mut seen = Vec::new();
    while let Some(slot) = rx.peek(None) {
        seen.push(slot.data()[0]);
        assert_eq!(&slot.data()[1..], &[0xff, 0, 0, 0, 0, 0, 0]);
        assert!(rx.peek_complete(slot.index()));
        assert_space_invariant(&rx);
    }
    assert_eq!(seen, [0, 1, 2]);
}
