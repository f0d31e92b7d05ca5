//! Occlusion and timer queries.
//!
//! Both resolve into a buffer at the end of a frame, copy into a
//! `MAP_READ` buffer and map it once the frame is submitted. Results land
//! before the next submission starts, because [`CommandQueue::wait`] treats
//! the pending map as in-flight work.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use web_time::Instant;

use crate::{
    command::{Command, CommandEncoder, CommandQueue, Release},
    ring::RingControl,
    traits::{BufferKey, Device, QuerySetKey},
    OcclusionQueryHandle, MAX_FRAME_LATENCY,
};

type Readback = Arc<Mutex<Option<Result<Vec<u8>, String>>>>;

fn create_readback_pair<D: Device>(device: &D, label: &str, size: u64) -> (BufferKey, BufferKey) {
    let resolve = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    (resolve, readback)
}

fn read_u64(data: &[u8], index: usize) -> Option<u64> {
    let bytes = data.get(index * 8..index * 8 + 8)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Some(u64::from_le_bytes(word))
}

//=============================================================================
// Occlusion
//=============================================================================

struct PendingOcclusion {
    handles: Vec<OcclusionQueryHandle>,
    data: Readback,
}

pub struct OcclusionQuery {
    set: QuerySetKey,
    resolve: BufferKey,
    readback: BufferKey,
    capacity: u32,
    issued: Vec<OcclusionQueryHandle>,
    pending: Option<PendingOcclusion>,
    results: HashMap<OcclusionQueryHandle, u64>,
}

impl OcclusionQuery {
    pub fn new<D: Device>(device: &D, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        let set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("occlusion"),
            ty: wgpu::QueryType::Occlusion,
            count: capacity,
        });
        let (resolve, readback) = create_readback_pair(device, "occlusion", capacity as u64 * 8);
        Self {
            set,
            resolve,
            readback,
            capacity,
            issued: Vec::new(),
            pending: None,
            results: HashMap::new(),
        }
    }

    pub fn query_set(&self) -> QuerySetKey {
        self.set
    }

    /// Allocates a query index for `handle` in the current frame.
    pub fn begin(&mut self, handle: OcclusionQueryHandle) -> Option<u32> {
        if self.issued.len() as u32 >= self.capacity {
            log::warn!("Out of occlusion queries ({} per frame)", self.capacity);
            return None;
        }
        self.issued.push(handle);
        Some(self.issued.len() as u32 - 1)
    }

    pub fn num_issued(&self) -> u32 {
        self.issued.len() as u32
    }

    /// Records the resolve of this frame's queries. Call outside any pass.
    pub fn resolve(&mut self, encoder: &mut CommandEncoder) {
        let count = self.issued.len() as u32;
        if count == 0 {
            return;
        }
        encoder.push(Command::ResolveQuerySet {
            set: self.set,
            queries: 0..count,
            destination: self.resolve,
            offset: 0,
        });
        encoder.push(Command::CopyBufferToBuffer {
            src: self.resolve,
            src_offset: 0,
            dst: self.readback,
            dst_offset: 0,
            size: count as u64 * 8,
        });
    }

    /// Maps the resolved results. Call after the frame is submitted.
    pub fn request_readback<D: Device>(&mut self, device: &D, queue: &CommandQueue) {
        if self.issued.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.issued);
        let data: Readback = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&data);
        let retire = queue.track();
        device.map_read(
            self.readback,
            0..handles.len() as u64 * 8,
            Box::new(move |result| {
                *slot.lock().unwrap() = Some(result);
                retire();
            }),
        );
        self.pending = Some(PendingOcclusion { handles, data });
    }

    /// Harvests the previous frame's results.
    pub fn consume(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let result = pending.data.lock().unwrap().take();
        match result {
            Some(Ok(data)) => {
                for (index, handle) in pending.handles.into_iter().enumerate() {
                    if let Some(value) = read_u64(&data, index) {
                        self.results.insert(handle, value);
                    }
                }
            }
            Some(Err(error)) => log::error!("Occlusion readback failed: {}", error),
            None => {
                log::warn!("Occlusion results not ready, retrying next frame");
                self.pending = Some(pending);
            }
        }
    }

    /// Samples passed in the last resolved frame, if any was recorded.
    pub fn result(&self, handle: OcclusionQueryHandle) -> Option<u64> {
        self.results.get(&handle).copied()
    }

    /// Unknown queries count as visible.
    pub fn is_visible(&self, handle: OcclusionQueryHandle) -> bool {
        self.result(handle).is_none_or(|samples| samples > 0)
    }

    pub fn forget(&mut self, handle: OcclusionQueryHandle) {
        self.results.remove(&handle);
    }

    pub fn destroy(self, queue: &mut CommandQueue) {
        queue.release(Release::QuerySet(self.set));
        queue.release(Release::Buffer(self.resolve));
        queue.release(Release::Buffer(self.readback));
    }
}

//=============================================================================
// Timer
//=============================================================================

/// GPU time of one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameTime {
    pub elapsed_ns: u64,
    /// Whether the time came from GPU timestamps.
    pub gpu: bool,
}

enum TimerBackend {
    Gpu {
        set: QuerySetKey,
        resolve: BufferKey,
        readback: BufferKey,
        period: f32,
    },
    Cpu,
}

#[derive(Default)]
struct TimerSlot {
    data: Option<Readback>,
    cpu_begin: Option<Instant>,
    cpu_end: Option<Arc<Mutex<Option<Instant>>>>,
}

const TIMER_STRIDE: u64 = wgpu::QUERY_RESOLVE_BUFFER_ALIGNMENT;

/// Ring of per-frame timers.
pub struct TimerQuery {
    backend: TimerBackend,
    ring: RingControl,
    slots: [TimerSlot; MAX_FRAME_LATENCY],
    active: Option<usize>,
    last: Option<FrameTime>,
}

impl TimerQuery {
    /// Uses GPU timestamps when `timestamps` is set, CPU submit-to-done
    /// timing otherwise.
    pub fn new<D: Device>(device: &D, timestamps: bool, period: f32) -> Self {
        let backend = if timestamps {
            let set = device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("timer"),
                ty: wgpu::QueryType::Timestamp,
                count: MAX_FRAME_LATENCY as u32 * 2,
            });
            let (resolve, readback) =
                create_readback_pair(device, "timer", MAX_FRAME_LATENCY as u64 * TIMER_STRIDE);
            TimerBackend::Gpu {
                set,
                resolve,
                readback,
                period,
            }
        } else {
            TimerBackend::Cpu
        };
        Self {
            backend,
            ring: RingControl::new(MAX_FRAME_LATENCY as u64),
            slots: Default::default(),
            active: None,
            last: None,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.backend, TimerBackend::Gpu { .. })
    }

    pub fn last(&self) -> Option<FrameTime> {
        self.last
    }

    /// Starts timing the frame being recorded.
    pub fn begin(&mut self, encoder: &mut CommandEncoder) {
        if self.ring.reserve(1, true) == 0 {
            log::debug!("Timer ring full, frame not timed");
            self.active = None;
            return;
        }
        let index = (self.ring.current_index() + self.ring.size() - 1) % self.ring.size();
        let index = index as usize;
        self.active = Some(index);
        match self.backend {
            TimerBackend::Gpu { set, .. } => encoder.push(Command::WriteTimestamp {
                set,
                index: index as u32 * 2,
            }),
            TimerBackend::Cpu => self.slots[index].cpu_begin = Some(Instant::now()),
        }
    }

    /// Stops timing; records the resolve for GPU timers.
    pub fn end(&mut self, queue: &mut CommandQueue) {
        let Some(index) = self.active else { return };
        match self.backend {
            TimerBackend::Gpu {
                set,
                resolve,
                readback,
                ..
            } => {
                let offset = index as u64 * TIMER_STRIDE;
                let encoder = queue.encoder();
                encoder.push(Command::WriteTimestamp {
                    set,
                    index: index as u32 * 2 + 1,
                });
                encoder.push(Command::ResolveQuerySet {
                    set,
                    queries: index as u32 * 2..index as u32 * 2 + 2,
                    destination: resolve,
                    offset,
                });
                encoder.push(Command::CopyBufferToBuffer {
                    src: resolve,
                    src_offset: offset,
                    dst: readback,
                    dst_offset: offset,
                    size: 16,
                });
            }
            TimerBackend::Cpu => {
                let end = Arc::new(Mutex::new(None));
                let slot = Arc::clone(&end);
                queue.on_submitted_work_done(Box::new(move || {
                    *slot.lock().unwrap() = Some(Instant::now());
                }));
                self.slots[index].cpu_end = Some(end);
            }
        }
        self.ring.commit(1);
    }

    /// Maps GPU timestamps. Call after the frame is submitted.
    pub fn request_readback<D: Device>(&mut self, device: &D, queue: &CommandQueue) {
        let Some(index) = self.active.take() else { return };
        if let TimerBackend::Gpu { readback, .. } = self.backend {
            let offset = index as u64 * TIMER_STRIDE;
            let data: Readback = Arc::new(Mutex::new(None));
            let slot = Arc::clone(&data);
            let retire = queue.track();
            device.map_read(
                readback,
                offset..offset + 16,
                Box::new(move |result| {
                    *slot.lock().unwrap() = Some(result);
                    retire();
                }),
            );
            self.slots[index].data = Some(data);
        }
    }

    /// Collects finished timers in ring order.
    pub fn consume(&mut self) {
        while self.ring.num_committed() > 0 {
            let index = self.ring.read_index() as usize;
            let slot = &mut self.slots[index];
            let time = match self.backend {
                TimerBackend::Gpu { period, .. } => {
                    let Some(data) = slot.data.as_ref() else { break };
                    let result = data.lock().unwrap().take();
                    match result {
                        Some(Ok(bytes)) => match (read_u64(&bytes, 0), read_u64(&bytes, 1)) {
                            (Some(begin), Some(end)) => Some(FrameTime {
                                elapsed_ns: (end.saturating_sub(begin) as f64 * period as f64)
                                    as u64,
                                gpu: true,
                            }),
                            _ => None,
                        },
                        Some(Err(error)) => {
                            log::warn!("Timer readback failed: {}", error);
                            None
                        }
                        None => break,
                    }
                }
                TimerBackend::Cpu => {
                    let end = slot.cpu_end.as_ref().and_then(|end| *end.lock().unwrap());
                    let (Some(begin), Some(end)) = (slot.cpu_begin, end) else {
                        break;
                    };
                    Some(FrameTime {
                        elapsed_ns: end.duration_since(begin).as_nanos() as u64,
                        gpu: false,
                    })
                }
            };
            *slot = TimerSlot::default();
            if time.is_some() {
                self.last = time;
            }
            self.ring.consume(1);
        }
    }

    pub fn destroy(self, queue: &mut CommandQueue) {
        if let TimerBackend::Gpu {
            set,
            resolve,
            readback,
            ..
        } = self.backend
        {
            queue.release(Release::QuerySet(set));
            queue.release(Release::Buffer(resolve));
            queue.release(Release::Buffer(readback));
        }
    }
}
