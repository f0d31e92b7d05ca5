//! Deferred command recording and queue bookkeeping.
//!
//! Commands are recorded into a [`CommandEncoder`] and handed to the
//! backend at [`CommandQueue::kick`], where they are replayed into a native
//! command buffer.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{
    scratch::ChunkedScratchBuffer,
    traits::{
        BindGroupKey, BindGroupLayoutKey, BufferKey, ComputePipelineKey, Device, QuerySetKey,
        RenderPipelineKey, SamplerKey, ShaderModuleKey, TextureKey, TextureRegion,
        TextureViewKey, WorkDoneCallback,
    },
    MAX_FRAME_LATENCY,
};

//=============================================================================
// Command Types
//=============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct ColorAttachment {
    pub view: TextureViewKey,
    pub resolve_target: Option<TextureViewKey>,
    pub ops: wgpu::Operations<wgpu::Color>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DepthStencilAttachment {
    pub view: TextureViewKey,
    pub depth_ops: Option<wgpu::Operations<f32>>,
    pub stencil_ops: Option<wgpu::Operations<u32>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassDesc {
    pub label: String,
    pub colors: Vec<ColorAttachment>,
    pub depth_stencil: Option<DepthStencilAttachment>,
    pub occlusion_query_set: Option<QuerySetKey>,
}

/// Recorded commands - executed at submit time
#[derive(Clone, Debug)]
pub enum Command {
    BeginRenderPass(RenderPassDesc),
    EndRenderPass,
    BeginComputePass {
        label: String,
    },
    EndComputePass,
    SetRenderPipeline(RenderPipelineKey),
    SetComputePipeline(ComputePipelineKey),
    SetBindGroup {
        group: BindGroupKey,
        dynamic_offsets: Vec<u32>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferKey,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferKey,
        format: wgpu::IndexFormat,
        offset: u64,
    },
    SetViewport {
        rect: [f32; 4],
        depth: Range<f32>,
    },
    SetScissor {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    SetStencilReference(u32),
    SetBlendConstant(wgpu::Color),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    DrawIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    DrawIndexedIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    Dispatch([u32; 3]),
    DispatchIndirect {
        buffer: BufferKey,
        offset: u64,
    },
    BeginOcclusionQuery(u32),
    EndOcclusionQuery,
    ResolveQuerySet {
        set: QuerySetKey,
        queries: Range<u32>,
        destination: BufferKey,
        offset: u64,
    },
    WriteTimestamp {
        set: QuerySetKey,
        index: u32,
    },
    CopyBufferToBuffer {
        src: BufferKey,
        src_offset: u64,
        dst: BufferKey,
        dst_offset: u64,
        size: u64,
    },
    CopyTextureToTexture {
        src: TextureRegion,
        dst: TextureRegion,
        size: wgpu::Extent3d,
    },
    CopyTextureToBuffer {
        src: TextureRegion,
        dst: BufferKey,
        layout: wgpu::TexelCopyBufferLayout,
        size: wgpu::Extent3d,
    },
    PushDebugGroup(String),
    PopDebugGroup,
}

// `wgpu::TexelCopyBufferLayout` does not implement `PartialEq`, so this is
// the field-wise equivalent of `#[derive(PartialEq)]`.
impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        use Command::*;
        match (self, other) {
            (BeginRenderPass(a), BeginRenderPass(b)) => a == b,
            (EndRenderPass, EndRenderPass) => true,
            (BeginComputePass { label: a }, BeginComputePass { label: b }) => a == b,
            (EndComputePass, EndComputePass) => true,
            (SetRenderPipeline(a), SetRenderPipeline(b)) => a == b,
            (SetComputePipeline(a), SetComputePipeline(b)) => a == b,
            (
                SetBindGroup { group: g1, dynamic_offsets: d1 },
                SetBindGroup { group: g2, dynamic_offsets: d2 },
            ) => g1 == g2 && d1 == d2,
            (
                SetVertexBuffer { slot: s1, buffer: b1, offset: o1 },
                SetVertexBuffer { slot: s2, buffer: b2, offset: o2 },
            ) => s1 == s2 && b1 == b2 && o1 == o2,
            (
                SetIndexBuffer { buffer: b1, format: f1, offset: o1 },
                SetIndexBuffer { buffer: b2, format: f2, offset: o2 },
            ) => b1 == b2 && f1 == f2 && o1 == o2,
            (SetViewport { rect: r1, depth: d1 }, SetViewport { rect: r2, depth: d2 }) => {
                r1 == r2 && d1 == d2
            }
            (
                SetScissor { x: x1, y: y1, width: w1, height: h1 },
                SetScissor { x: x2, y: y2, width: w2, height: h2 },
            ) => x1 == x2 && y1 == y2 && w1 == w2 && h1 == h2,
            (SetStencilReference(a), SetStencilReference(b)) => a == b,
            (SetBlendConstant(a), SetBlendConstant(b)) => a == b,
            (
                Draw { vertices: v1, instances: i1 },
                Draw { vertices: v2, instances: i2 },
            ) => v1 == v2 && i1 == i2,
            (
                DrawIndexed { indices: x1, base_vertex: b1, instances: i1 },
                DrawIndexed { indices: x2, base_vertex: b2, instances: i2 },
            ) => x1 == x2 && b1 == b2 && i1 == i2,
            (
                DrawIndirect { buffer: b1, offset: o1 },
                DrawIndirect { buffer: b2, offset: o2 },
            ) => b1 == b2 && o1 == o2,
            (
                DrawIndexedIndirect { buffer: b1, offset: o1 },
                DrawIndexedIndirect { buffer: b2, offset: o2 },
            ) => b1 == b2 && o1 == o2,
            (Dispatch(a), Dispatch(b)) => a == b,
            (
                DispatchIndirect { buffer: b1, offset: o1 },
                DispatchIndirect { buffer: b2, offset: o2 },
            ) => b1 == b2 && o1 == o2,
            (BeginOcclusionQuery(a), BeginOcclusionQuery(b)) => a == b,
            (EndOcclusionQuery, EndOcclusionQuery) => true,
            (
                ResolveQuerySet { set: s1, queries: q1, destination: d1, offset: o1 },
                ResolveQuerySet { set: s2, queries: q2, destination: d2, offset: o2 },
            ) => s1 == s2 && q1 == q2 && d1 == d2 && o1 == o2,
            (
                WriteTimestamp { set: s1, index: i1 },
                WriteTimestamp { set: s2, index: i2 },
            ) => s1 == s2 && i1 == i2,
            (
                CopyBufferToBuffer { src: s1, src_offset: so1, dst: d1, dst_offset: do1, size: z1 },
                CopyBufferToBuffer { src: s2, src_offset: so2, dst: d2, dst_offset: do2, size: z2 },
            ) => s1 == s2 && so1 == so2 && d1 == d2 && do1 == do2 && z1 == z2,
            (
                CopyTextureToTexture { src: s1, dst: d1, size: z1 },
                CopyTextureToTexture { src: s2, dst: d2, size: z2 },
            ) => s1 == s2 && d1 == d2 && z1 == z2,
            (
                CopyTextureToBuffer { src: s1, dst: d1, layout: l1, size: z1 },
                CopyTextureToBuffer { src: s2, dst: d2, layout: l2, size: z2 },
            ) => {
                s1 == s2
                    && d1 == d2
                    && l1.offset == l2.offset
                    && l1.bytes_per_row == l2.bytes_per_row
                    && l1.rows_per_image == l2.rows_per_image
                    && z1 == z2
            }
            (PushDebugGroup(a), PushDebugGroup(b)) => a == b,
            (PopDebugGroup, PopDebugGroup) => true,
            _ => false,
        }
    }
}

//=============================================================================
// Command Encoder
//=============================================================================

/// Identifies one encoder instance. Objects recorded against an encoder
/// must not leak into the next one.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct EncoderToken(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassKind {
    None,
    Render,
    Compute,
}

pub struct CommandEncoder {
    token: EncoderToken,
    commands: Vec<Command>,
    pass: PassKind,
}

impl CommandEncoder {
    fn new(token: EncoderToken) -> Self {
        Self {
            token,
            commands: Vec::new(),
            pass: PassKind::None,
        }
    }

    pub fn token(&self) -> EncoderToken {
        self.token
    }

    pub fn pass(&self) -> PassKind {
        self.pass
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn begin_render_pass(&mut self, desc: RenderPassDesc) {
        debug_assert_eq!(self.pass, PassKind::None, "render pass inside an open pass");
        self.pass = PassKind::Render;
        self.commands.push(Command::BeginRenderPass(desc));
    }

    pub fn begin_compute_pass(&mut self, label: &str) {
        debug_assert_eq!(self.pass, PassKind::None, "compute pass inside an open pass");
        self.pass = PassKind::Compute;
        self.commands.push(Command::BeginComputePass {
            label: label.to_string(),
        });
    }

    /// Ends the open pass. Returns false if there was none.
    pub fn end_pass(&mut self) -> bool {
        let command = match self.pass {
            PassKind::None => return false,
            PassKind::Render => Command::EndRenderPass,
            PassKind::Compute => Command::EndComputePass,
        };
        self.pass = PassKind::None;
        self.commands.push(command);
        true
    }

    /// Binds group 0. The group must have been created against this encoder.
    pub fn set_bind_group(&mut self, group: &crate::bind_group::BindGroup, dynamic_offsets: &[u32]) {
        debug_assert_eq!(
            group.token, self.token,
            "bind group was created against another encoder"
        );
        self.commands.push(Command::SetBindGroup {
            group: group.raw,
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

//=============================================================================
// Command Queue
//=============================================================================

/// Native object whose destruction waits for the frame slot to retire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    Buffer(BufferKey),
    Texture(TextureKey),
    TextureView(TextureViewKey),
    Sampler(SamplerKey),
    ShaderModule(ShaderModuleKey),
    BindGroupLayout(BindGroupLayoutKey),
    RenderPipeline(RenderPipelineKey),
    ComputePipeline(ComputePipelineKey),
    BindGroup(BindGroupKey),
    QuerySet(QuerySetKey),
}

impl Release {
    pub(crate) fn destroy<D: Device>(self, device: &D) {
        match self {
            Self::Buffer(key) => device.destroy_buffer(key),
            Self::Texture(key) => device.destroy_texture(key),
            Self::TextureView(key) => device.destroy_texture_view(key),
            Self::Sampler(key) => device.destroy_sampler(key),
            Self::ShaderModule(key) => device.destroy_shader_module(key),
            Self::BindGroupLayout(key) => device.destroy_bind_group_layout(key),
            Self::RenderPipeline(key) => device.destroy_render_pipeline(key),
            Self::ComputePipeline(key) => device.destroy_compute_pipeline(key),
            Self::BindGroup(key) => device.destroy_bind_group(key),
            Self::QuerySet(key) => device.destroy_query_set(key),
        }
    }
}

/// Owns the active encoder and bounds how much work is in flight.
pub struct CommandQueue {
    encoder: CommandEncoder,
    next_token: u64,
    in_flight: Arc<AtomicU32>,
    frame_in_flight: u32,
    max_frame_latency: u32,
    release: [Vec<Release>; MAX_FRAME_LATENCY],
    on_done: Vec<WorkDoneCallback>,
    num_submissions: u64,
}

impl CommandQueue {
    pub fn new(max_frame_latency: u32) -> Self {
        Self {
            encoder: CommandEncoder::new(EncoderToken(0)),
            next_token: 1,
            in_flight: Arc::new(AtomicU32::new(0)),
            frame_in_flight: 0,
            max_frame_latency: max_frame_latency.clamp(1, MAX_FRAME_LATENCY as u32),
            release: Default::default(),
            on_done: Vec::new(),
            num_submissions: 0,
        }
    }

    pub fn encoder(&mut self) -> &mut CommandEncoder {
        &mut self.encoder
    }

    pub fn token(&self) -> EncoderToken {
        self.encoder.token
    }

    pub fn frame_in_flight(&self) -> u32 {
        self.frame_in_flight
    }

    pub fn max_frame_latency(&self) -> u32 {
        self.max_frame_latency
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn num_submissions(&self) -> u64 {
        self.num_submissions
    }

    /// Flushes scratch writes, submits the current encoder and starts a new
    /// one. Bind groups created before this call are unusable afterwards.
    pub fn alloc<D: Device>(
        &mut self,
        device: &D,
        scratch: &mut ChunkedScratchBuffer,
    ) -> EncoderToken {
        scratch.flush(device, self.frame_in_flight);
        self.kick(device);
        self.encoder.token
    }

    /// Submits recorded work without waiting for it.
    pub fn kick<D: Device>(&mut self, device: &D) {
        profiling::scope!("kick");
        if self.encoder.end_pass() {
            log::warn!("Pass was still open at kick");
        }
        let commands = self.encoder.take();
        let callbacks = std::mem::take(&mut self.on_done);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        device.submit(
            commands,
            Box::new(move || {
                for callback in callbacks {
                    callback();
                }
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }),
        );
        self.num_submissions += 1;
        self.encoder = CommandEncoder::new(EncoderToken(self.next_token));
        self.next_token += 1;
    }

    /// Runs `callback` once the work of the next kick has completed.
    pub fn on_submitted_work_done(&mut self, callback: WorkDoneCallback) {
        self.on_done.push(callback);
    }

    /// Counts an outstanding asynchronous operation, such as a buffer map,
    /// as in-flight work. The returned callback retires it.
    pub(crate) fn track(&self) -> impl FnOnce() + Send + 'static {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        move || {
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Polls the device until all submitted work has retired.
    pub fn wait<D: Device>(&mut self, device: &D) {
        profiling::scope!("wait");
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if device.is_device_lost() {
                log::error!("Device lost while waiting for {} submissions", self.in_flight());
                self.in_flight.store(0, Ordering::Release);
                break;
            }
            device.poll(true);
        }
    }

    /// Ends the frame: submits and moves to the next frame slot, destroying
    /// the objects released when that slot was last used.
    pub fn frame<D: Device>(&mut self, device: &D) {
        self.kick(device);
        self.frame_in_flight = (self.frame_in_flight + 1) % self.max_frame_latency;
        self.consume(device);
    }

    /// Defers destruction of `object` until its frame slot comes around.
    pub fn release(&mut self, object: Release) {
        self.release[self.frame_in_flight as usize].push(object);
    }

    fn consume<D: Device>(&mut self, device: &D) {
        for object in self.release[self.frame_in_flight as usize].drain(..) {
            object.destroy(device);
        }
    }

    /// Waits for the GPU and destroys everything still pending.
    pub fn finish<D: Device>(&mut self, device: &D) {
        self.kick(device);
        self.wait(device);
        for list in self.release.iter_mut() {
            for object in list.drain(..) {
                object.destroy(device);
            }
        }
    }
}
