//! Chunked scratch memory for per-draw uniform data.
//!
//! Every chunk is a GPU uniform buffer with a CPU mirror and its own
//! [`RingControl`]. Allocations are carved from the current chunk. When a
//! chunk runs out, the remainder is padded off and allocation moves to the
//! next chunk if it has fully retired, or to a freshly inserted one. A
//! retired chunk starts over at offset 0.
//!
//! Bytes go through three stages: reserved while the frame records,
//! committed by [`ChunkedScratchBuffer::end`], and consumed by
//! [`ChunkedScratchBuffer::begin`] once the frame slot that committed them
//! comes around again.

use std::ops::Range;

use crate::{
    ring::RingControl,
    traits::{BufferKey, Device},
    MAX_FRAME_LATENCY,
};

const CHUNK_GRANULARITY: u64 = 1 << 20;
const COPY_ALIGNMENT: u64 = 4;

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Identifies a chunk for the lifetime of the scratch buffer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchAlloc {
    pub chunk: ChunkId,
    pub buffer: BufferKey,
    pub offset: u64,
    pub size: u64,
}

/// Location of one draw's vertex and fragment constant blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScratchWrite {
    pub chunk: ChunkId,
    pub buffer: BufferKey,
    pub offsets: [u32; 2],
}

struct Chunk {
    id: ChunkId,
    buffer: BufferKey,
    mirror: Box<[u8]>,
    ring: RingControl,
    /// Reserved during the current frame, not yet committed.
    pending: u64,
    /// Committed per frame slot, waiting to be consumed.
    consume: [u64; MAX_FRAME_LATENCY],
    dirty: Vec<Range<u64>>,
}

impl Chunk {
    fn mark_dirty(&mut self, range: Range<u64>) {
        match self.dirty.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => self.dirty.push(range),
        }
    }
}

pub struct ChunkedScratchBuffer {
    chunks: Vec<Chunk>,
    current: usize,
    chunk_size: u64,
    align: u64,
    usage: wgpu::BufferUsages,
    next_id: u32,
    used: u64,
}

impl ChunkedScratchBuffer {
    /// Creates `num_chunks` chunks of `chunk_size` rounded up to 1 MiB.
    /// Allocations are aligned to `align`.
    pub fn new<D: Device>(
        device: &D,
        chunk_size: u32,
        num_chunks: u32,
        usage: wgpu::BufferUsages,
        align: u32,
    ) -> Self {
        let mut scratch = Self {
            chunks: Vec::new(),
            current: 0,
            chunk_size: align_up(chunk_size.max(1) as u64, CHUNK_GRANULARITY),
            align: align.max(1) as u64,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            next_id: 0,
            used: 0,
        };
        for _ in 0..num_chunks.max(1) {
            let chunk = scratch.create_chunk(device);
            scratch.chunks.push(chunk);
        }
        scratch
    }

    fn create_chunk<D: Device>(&mut self, device: &D) -> Chunk {
        let id = ChunkId(self.next_id);
        self.next_id += 1;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("scratch"),
            size: self.chunk_size,
            usage: self.usage,
            mapped_at_creation: false,
        });
        Chunk {
            id,
            buffer,
            mirror: vec![0; self.chunk_size as usize].into_boxed_slice(),
            ring: RingControl::new(self.chunk_size),
            pending: 0,
            consume: [0; MAX_FRAME_LATENCY],
            dirty: Vec::new(),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn align(&self) -> u64 {
        self.align
    }

    /// Bytes reserved since the last [`Self::begin`], padding included.
    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn current_chunk(&self) -> ChunkId {
        self.chunks[self.current].id
    }

    pub fn buffer(&self, chunk: ChunkId) -> Option<BufferKey> {
        self.chunks
            .iter()
            .find(|c| c.id == chunk)
            .map(|c| c.buffer)
    }

    /// Reserves `size` bytes, rounded up to the allocation alignment.
    /// Returns `None` only when `size` exceeds a whole chunk.
    pub fn alloc<D: Device>(&mut self, device: &D, size: u64) -> Option<ScratchAlloc> {
        let size = align_up(size.max(1), self.align);
        if size > self.chunk_size {
            log::error!(
                "Scratch allocation of {} bytes exceeds chunk size {}",
                size,
                self.chunk_size
            );
            debug_assert!(false, "scratch allocation larger than a chunk");
            return None;
        }

        for _ in 0..2 {
            if let Some(alloc) = self.try_alloc(size) {
                return Some(alloc);
            }
            let chunk = &mut self.chunks[self.current];
            let pos = chunk.ring.current_index();
            if pos + size > self.chunk_size {
                let padding = chunk.ring.reserve(self.chunk_size - pos, true);
                chunk.pending += padding;
                self.used += padding;
            }
            self.next_chunk(device);
        }

        log::error!("Unable to reserve {} scratch bytes after growing", size);
        debug_assert!(false, "scratch reservation failed");
        None
    }

    fn try_alloc(&mut self, size: u64) -> Option<ScratchAlloc> {
        let chunk = &mut self.chunks[self.current];
        if chunk.ring.is_empty() {
            chunk.ring.reset();
        }
        let offset = chunk.ring.current_index();
        if offset + size > self.chunk_size || chunk.ring.reserve(size, true) != size {
            return None;
        }
        chunk.pending += size;
        self.used += size;
        Some(ScratchAlloc {
            chunk: chunk.id,
            buffer: chunk.buffer,
            offset,
            size,
        })
    }

    fn next_chunk<D: Device>(&mut self, device: &D) {
        let next = (self.current + 1) % self.chunks.len();
        if next != self.current && self.chunks[next].ring.is_empty() {
            self.current = next;
        } else {
            let chunk = self.create_chunk(device);
            log::debug!(
                "Growing scratch buffer to {} chunks of {} bytes",
                self.chunks.len() + 1,
                self.chunk_size
            );
            self.current += 1;
            self.chunks.insert(self.current, chunk);
        }
    }

    /// Copies the vertex and fragment constant blocks into one allocation.
    pub fn write<D: Device>(&mut self, device: &D, vs: &[u8], fs: &[u8]) -> Option<ScratchWrite> {
        let vs_size = align_up(vs.len() as u64, self.align);
        let fs_size = align_up(fs.len() as u64, self.align);
        let alloc = self.alloc(device, vs_size + fs_size)?;
        let chunk = &mut self.chunks[self.current];
        debug_assert_eq!(chunk.id, alloc.chunk);

        let vs_offset = alloc.offset;
        let fs_offset = alloc.offset + vs_size;
        chunk.mirror[vs_offset as usize..vs_offset as usize + vs.len()].copy_from_slice(vs);
        chunk.mirror[fs_offset as usize..fs_offset as usize + fs.len()].copy_from_slice(fs);
        chunk.mark_dirty(alloc.offset..alloc.offset + alloc.size);

        Some(ScratchWrite {
            chunk: alloc.chunk,
            buffer: alloc.buffer,
            offsets: [vs_offset as u32, fs_offset as u32],
        })
    }

    /// Frees the bytes frame slot `slot` committed last time it was used.
    pub fn begin(&mut self, slot: u32) {
        let slot = slot as usize % MAX_FRAME_LATENCY;
        for chunk in self.chunks.iter_mut() {
            chunk.ring.consume(chunk.consume[slot]);
            chunk.consume[slot] = 0;
        }
        self.used = 0;
    }

    /// Uploads dirty ranges and commits this frame's reservations to `slot`.
    pub fn end<D: Device>(&mut self, device: &D, slot: u32) {
        profiling::scope!("scratch end");
        let slot = slot as usize % MAX_FRAME_LATENCY;
        for chunk in self.chunks.iter_mut() {
            for range in chunk.dirty.drain(..) {
                let end = align_up(range.end, COPY_ALIGNMENT).min(chunk.mirror.len() as u64);
                device.write_buffer(
                    chunk.buffer,
                    range.start,
                    &chunk.mirror[range.start as usize..end as usize],
                );
            }
            chunk.ring.commit(chunk.pending);
            chunk.consume[slot] += chunk.pending;
            chunk.pending = 0;
        }
    }

    /// Uploads and commits mid-frame. Nothing is released; the bytes stay
    /// live until `slot` is begun again.
    pub fn flush<D: Device>(&mut self, device: &D, slot: u32) {
        self.end(device, slot);
    }

    /// Live byte ranges per chunk, for diagnostics.
    pub fn live_ranges(&self) -> Vec<(ChunkId, u64, u64)> {
        self.chunks
            .iter()
            .map(|chunk| {
                let live = chunk.ring.num_committed() + chunk.ring.num_reserved();
                (chunk.id, chunk.ring.read_index(), live)
            })
            .collect()
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for chunk in self.chunks.drain(..) {
            device.destroy_buffer(chunk.buffer);
        }
        self.current = 0;
    }
}
