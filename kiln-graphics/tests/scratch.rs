//! Ring bookkeeping and scratch buffer allocation.

mod common;

use kiln_graphics::{
    noop,
    ring::RingControl,
    scratch::{ChunkedScratchBuffer, ScratchAlloc},
    MAX_FRAME_LATENCY,
};
use proptest::prelude::*;

const MIB: u64 = 1 << 20;

fn scratch(device: &noop::Context, num_chunks: u32) -> ChunkedScratchBuffer {
    ChunkedScratchBuffer::new(
        device,
        MIB as u32,
        num_chunks,
        wgpu::BufferUsages::UNIFORM,
        256,
    )
}

fn overlaps(a: &ScratchAlloc, b: &ScratchAlloc) -> bool {
    a.chunk == b.chunk && a.offset < b.offset + b.size && b.offset < a.offset + a.size
}

/// Reserve, commit and consume keep the ring counters ordered
#[test]
fn test_ring_control_lifecycle() {
    let mut ring = RingControl::new(16);
    assert_eq!(ring.available(), 16);
    assert!(ring.is_empty());

    assert_eq!(ring.reserve(10, true), 10);
    assert_eq!(ring.num_reserved(), 10);
    assert_eq!(ring.reserve(10, true), 0, "must_fit refuses a partial reservation");
    assert_eq!(ring.reserve(10, false), 6);
    assert_eq!(ring.available(), 0);

    ring.commit(16);
    assert_eq!(ring.num_reserved(), 0);
    assert_eq!(ring.num_committed(), 16);

    ring.consume(10);
    assert_eq!(ring.available(), 10);
    assert_eq!(ring.read_index(), 10);
    assert_eq!(ring.current_index(), 0, "position wraps modulo the size");
    ring.consume(6);
    assert!(ring.is_empty());
}

/// A write lands in the current chunk with aligned stage offsets
#[test]
fn test_scratch_write_offsets() {
    common::init_logger();
    let device = noop::Context::default();
    let mut scratch = scratch(&device, 2);

    let first = scratch
        .write(&device, &[1; 64], &[2; 16])
        .expect("Failed to write constants");
    assert_eq!(first.offsets, [0, 256]);
    let second = scratch
        .write(&device, &[3; 64], &[])
        .expect("Failed to write constants");
    assert_eq!(second.offsets[0], 512);
    assert_eq!(scratch.used(), 768);

    scratch.end(&device, 0);
    let data = device
        .buffer_data(first.buffer)
        .expect("Scratch chunk buffer is missing");
    assert_eq!(&data[0..64], &[1; 64][..]);
    assert_eq!(&data[256..272], &[2; 16][..]);
    assert_eq!(&data[512..576], &[3; 64][..]);
}

/// Allocating past a chunk while every chunk is live adds a chunk
#[test]
fn test_scratch_grows_when_full() {
    common::init_logger();
    let device = noop::Context::default();
    let mut scratch = scratch(&device, 1);
    assert_eq!(scratch.num_chunks(), 1);

    let first = scratch
        .alloc(&device, MIB - 256)
        .expect("Failed to allocate");
    let second = scratch.alloc(&device, 512).expect("Failed to allocate");
    assert_eq!(scratch.num_chunks(), 2);
    assert_ne!(first.chunk, second.chunk);
    assert_eq!(second.offset, 0);
}

/// A retired chunk is reused instead of growing
#[test]
fn test_scratch_reuses_retired_chunk() {
    common::init_logger();
    let device = noop::Context::default();
    let mut scratch = scratch(&device, 2);

    scratch.begin(0);
    scratch.alloc(&device, MIB).expect("Failed to allocate");
    scratch.end(&device, 0);

    scratch.begin(1);
    let next = scratch.alloc(&device, MIB).expect("Failed to allocate");
    scratch.end(&device, 1);
    assert_eq!(scratch.num_chunks(), 2);

    // Slot 0 comes around: the first chunk is free again.
    scratch.begin(0);
    let again = scratch.alloc(&device, MIB).expect("Failed to allocate");
    assert_eq!(scratch.num_chunks(), 2);
    assert_ne!(again.chunk, next.chunk);
}

/// A retired chunk left mid-way starts over at offset 0
#[test]
fn test_scratch_retired_chunk_rewinds() {
    common::init_logger();
    let device = noop::Context::default();
    let mut scratch = scratch(&device, 2);

    scratch.begin(0);
    scratch.alloc(&device, 614_400).expect("Failed to allocate");
    scratch.end(&device, 0);

    scratch.begin(1);
    scratch.alloc(&device, 434_176).expect("Failed to allocate");
    scratch.end(&device, 1);

    scratch.begin(0);
    scratch.alloc(&device, 500_224).expect("Failed to allocate");
    let moved = scratch.alloc(&device, 200_192).expect("Failed to allocate");
    assert_eq!(moved.offset, 0);
    scratch.end(&device, 0);

    scratch.begin(1);
    scratch.end(&device, 1);

    // Both chunks are retired now, each with its position mid-chunk.
    scratch.begin(0);
    let large = scratch
        .alloc(&device, 900_096)
        .expect("Failed to allocate in a retired chunk");
    assert_eq!(large.chunk, moved.chunk);
    assert_eq!(large.offset, 0);
    assert_eq!(scratch.num_chunks(), 2);
}

/// Rewinding an empty ring restarts every position at 0
#[test]
fn test_ring_control_reset() {
    let mut ring = RingControl::new(16);
    ring.reserve(10, true);
    ring.commit(10);
    ring.consume(10);
    assert_eq!(ring.current_index(), 10);

    ring.reset();
    assert_eq!(ring.current_index(), 0);
    assert_eq!(ring.read_index(), 0);
    assert_eq!(ring.available(), 16);
    assert_eq!(ring.reserve(16, true), 16);
}

proptest! {
    /// Live allocations never share bytes, within and across frames
    #[test]
    fn prop_scratch_allocations_never_overlap(
        frames in prop::collection::vec(
            prop::collection::vec(1u64..200_000, 1..24),
            1..12,
        ),
        latency in 1u32..=MAX_FRAME_LATENCY as u32,
    ) {
        let device = noop::Context::default();
        let mut scratch = scratch(&device, 2);
        let mut live: Vec<Vec<ScratchAlloc>> = vec![Vec::new(); latency as usize];

        for (frame, sizes) in frames.iter().enumerate() {
            let slot = frame as u32 % latency;
            scratch.begin(slot);
            live[slot as usize].clear();

            let mut current = Vec::new();
            for &size in sizes.iter() {
                let alloc = scratch.alloc(&device, size).expect("allocation failed");
                prop_assert!(alloc.offset + alloc.size <= scratch.chunk_size());
                for other in live.iter().flatten().chain(current.iter()) {
                    prop_assert!(
                        !overlaps(&alloc, other),
                        "{:?} overlaps {:?}",
                        alloc,
                        other
                    );
                }
                current.push(alloc);
            }
            scratch.end(&device, slot);
            live[slot as usize] = current;
        }
    }

    /// Any allocation up to a chunk succeeds, whatever order slots recycle in
    #[test]
    fn prop_scratch_reuse_never_fails(
        frames in prop::collection::vec(
            (0u32..MAX_FRAME_LATENCY as u32, prop::collection::vec(1u64..=MIB, 0..6)),
            1..16,
        ),
    ) {
        let device = noop::Context::default();
        let mut scratch = scratch(&device, 2);
        let mut live: Vec<Vec<ScratchAlloc>> = vec![Vec::new(); MAX_FRAME_LATENCY];

        for (slot, sizes) in frames.iter() {
            scratch.begin(*slot);
            live[*slot as usize].clear();

            let mut current = Vec::new();
            for &size in sizes.iter() {
                let alloc = scratch.alloc(&device, size);
                prop_assert!(alloc.is_some(), "allocation of {} failed", size);
                let alloc = alloc.expect("Failed to allocate");
                prop_assert!(alloc.offset + alloc.size <= scratch.chunk_size());
                for other in live.iter().flatten().chain(current.iter()) {
                    prop_assert!(
                        !overlaps(&alloc, other),
                        "{:?} overlaps {:?}",
                        alloc,
                        other
                    );
                }
                current.push(alloc);
            }
            scratch.end(&device, *slot);
            live[*slot as usize] = current;
        }
    }

    /// Reserved space never exceeds the ring size
    #[test]
    fn prop_ring_never_overcommits(ops in prop::collection::vec((0u8..3, 0u64..64), 0..64)) {
        let mut ring = RingControl::new(64);
        for (op, count) in ops {
            match op {
                0 => {
                    ring.reserve(count, false);
                }
                1 => ring.commit(count.min(ring.num_reserved())),
                _ => ring.consume(count.min(ring.num_committed())),
            }
            prop_assert!(ring.num_reserved() + ring.num_committed() <= ring.size());
            prop_assert_eq!(ring.available(), ring.size() - ring.num_reserved() - ring.num_committed());
        }
    }
}
