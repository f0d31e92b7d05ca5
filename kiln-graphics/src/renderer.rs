use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use glam::Mat4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    bind_group::{collect_entries, dynamic_offsets, BindGroupCache, BindResources, SamplerCache},
    clear::ClearQuad,
    command::{
        ColorAttachment, Command, CommandQueue, DepthStencilAttachment, PassKind, RenderPassDesc,
    },
    frame::{
        unpack_rgba, Clear, ClearFlags, DebugFlags, Dispatch, Frame, OcclusionUse, Rect,
        RenderCompute, RenderDraw, RenderItem, Resolution, ResourceUpdate, SubmitItem, View,
        ViewId, DRAW_INDIRECT_STRIDE,
    },
    frame_buffer::{Attachment, Attachments, FrameBuffer, SwapChain, TargetFormats},
    pipeline::{PipelineCache, PipelineStats, RenderPipelineRequest},
    pool::Pool,
    program::Program,
    query::{FrameTime, OcclusionQuery, TimerQuery},
    resource::{
        padded_bytes_per_row, unpad_rows, Buffer, BufferFlags, Texture, TextureConfig,
        TextureFormat,
    },
    scratch::{ChunkedScratchBuffer, ScratchWrite},
    shader::{PredefinedUniform, Shader, UniformRegistry},
    state::State,
    traits::{
        BindGroupKey, BufferKey, ComputePipelineKey, Device, DeviceLimits, RenderPipelineKey,
        TextureRegion,
    },
    vertex::VertexLayout,
    ContextDesc, Error, FrameBufferHandle, IndexBufferHandle, OcclusionQueryHandle,
    ProgramHandle, ShaderHandle, TextureHandle, UniformHandle, UniformType, VertexBufferHandle,
    VertexLayoutHandle, MAX_COLOR_PALETTE, MAX_VERTEX_STREAMS, MIN_BUFFER_OFFSET_ALIGNMENT,
};

const MAX_VERTEX_LAYOUTS: usize = 64;
const MAX_BUFFERS: usize = 4096;
const MAX_SHADERS: usize = 512;
const MAX_PROGRAMS: usize = 512;
const MAX_TEXTURES: usize = 4096;
const MAX_FRAME_BUFFERS: usize = 128;
const MAX_UNIFORMS: usize = 512;

/// Counters of the last submitted frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub num_draws: u32,
    pub num_computes: u32,
    pub num_blits: u32,
    pub num_prims: u64,
    pub num_views: u32,
    pub num_render_passes: u32,
    pub num_compute_passes: u32,
    /// Items dropped because a resource or target was unavailable.
    pub num_skipped: u32,
    /// Draws skipped because their occlusion query saw nothing.
    pub num_occlusion_culled: u32,
    pub pipelines: PipelineStats,
    pub num_bind_groups_created: u32,
    pub scratch_bytes: u64,
    pub num_scratch_chunks: u32,
    pub num_presents: u32,
    /// Pre-reset and post-reset cycles since the previous frame.
    pub num_pre_resets: u32,
    pub num_post_resets: u32,
    /// Time of the most recent frame whose timer has been read back.
    pub gpu_time: Option<FrameTime>,
}

//=============================================================================
// Submission state
//=============================================================================

/// State last set in the open pass, to skip redundant commands.
#[derive(Default)]
struct PassCache {
    render_pipeline: Option<RenderPipelineKey>,
    compute_pipeline: Option<ComputePipelineKey>,
    bind_group: Option<(BindGroupKey, Vec<u32>)>,
    vertex_buffers: [Option<(BufferKey, u64)>; MAX_VERTEX_STREAMS + 1],
    index_buffer: Option<(BufferKey, wgpu::IndexFormat)>,
    stencil_reference: Option<u32>,
    blend_constant: Option<u32>,
    scissor: Option<Rect>,
}

struct ViewTarget {
    handle: FrameBufferHandle,
    attachments: Attachments,
    formats: TargetFormats,
    rect: Rect,
    scissor: Rect,
    clear: Clear,
    /// The clear rectangle covers the whole target, so load operations can
    /// clear it.
    full_clear: bool,
    /// A render pass of this view has been opened, and the clear applied.
    started: bool,
}

struct ViewMatrices {
    rect: Rect,
    view: Mat4,
    proj: Mat4,
    view_proj: Mat4,
}

impl ViewMatrices {
    fn new(view: &View, rect: Rect) -> Self {
        let view_matrix = Mat4::from(view.view);
        let proj = Mat4::from(view.proj);
        Self {
            rect,
            view: view_matrix,
            proj,
            view_proj: proj * view_matrix,
        }
    }

    fn value(&self, kind: PredefinedUniform, model: Mat4, alpha_ref: f32) -> [f32; 16] {
        let vec4 = |x: f32, y: f32, z: f32, w: f32| {
            let mut out = [0.0; 16];
            out[..4].copy_from_slice(&[x, y, z, w]);
            out
        };
        let rect = self.rect;
        match kind {
            PredefinedUniform::ViewRect => vec4(
                rect.x as f32,
                rect.y as f32,
                rect.width as f32,
                rect.height as f32,
            ),
            PredefinedUniform::ViewTexel => vec4(
                1.0 / (rect.width.max(1) as f32),
                1.0 / (rect.height.max(1) as f32),
                0.0,
                0.0,
            ),
            PredefinedUniform::View => self.view.to_cols_array(),
            PredefinedUniform::InvView => self.view.inverse().to_cols_array(),
            PredefinedUniform::Proj => self.proj.to_cols_array(),
            PredefinedUniform::InvProj => self.proj.inverse().to_cols_array(),
            PredefinedUniform::ViewProj => self.view_proj.to_cols_array(),
            PredefinedUniform::InvViewProj => self.view_proj.inverse().to_cols_array(),
            PredefinedUniform::Model => model.to_cols_array(),
            PredefinedUniform::ModelView => (self.view * model).to_cols_array(),
            PredefinedUniform::ModelViewProj => (self.view_proj * model).to_cols_array(),
            PredefinedUniform::AlphaRef => vec4(alpha_ref, 0.0, 0.0, 0.0),
        }
    }
}

struct ViewState {
    id: ViewId,
    label: String,
    debug_group: bool,
    matrices: ViewMatrices,
    target: Option<ViewTarget>,
    bound: PassCache,
}

fn is_vec4(kind: PredefinedUniform) -> bool {
    matches!(
        kind,
        PredefinedUniform::ViewRect | PredefinedUniform::ViewTexel | PredefinedUniform::AlphaRef
    )
}

fn write_block(block: &mut [u8], loc: usize, data: &[u8]) {
    if loc >= block.len() {
        return;
    }
    let len = data.len().min(block.len() - loc);
    block[loc..loc + len].copy_from_slice(&data[..len]);
}

/// Lays out the constant block of `shader` from registered uniform values
/// and the values the renderer supplies itself.
fn assemble_block(
    shader: &Shader,
    registry: &UniformRegistry,
    matrices: &ViewMatrices,
    models: &[mint::ColumnMatrix4<f32>],
    alpha_ref: f32,
) -> Vec<u8> {
    let mut block = vec![0u8; shader.size as usize];
    for binding in shader.uniforms.iter() {
        let (Some(data), Some((ty, _))) = (
            registry.data(binding.handle),
            registry.info(binding.handle),
        ) else {
            continue;
        };
        let len = (ty.size() as usize * binding.count as usize).min(data.len());
        write_block(&mut block, binding.loc as usize, &data[..len]);
    }

    let model = models.first().map_or(Mat4::IDENTITY, |&m| Mat4::from(m));
    for binding in shader.predefined.iter() {
        let loc = binding.loc as usize;
        if binding.kind == PredefinedUniform::Model {
            for (index, &matrix) in models.iter().take(binding.count as usize).enumerate() {
                let value = Mat4::from(matrix).to_cols_array();
                write_block(&mut block, loc + index * 64, bytemuck::cast_slice(&value));
            }
            continue;
        }
        let value = matrices.value(binding.kind, model, alpha_ref);
        let floats = if is_vec4(binding.kind) {
            &value[..4]
        } else {
            &value[..]
        };
        write_block(&mut block, loc, bytemuck::cast_slice(floats));
    }
    block
}

fn to_wgpu_color(rgba: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: rgba[0] as f64,
        g: rgba[1] as f64,
        b: rgba[2] as f64,
        a: rgba[3] as f64,
    }
}

//=============================================================================
// Context
//=============================================================================

/// Owns every engine object and translates frames into GPU work.
pub struct RendererContext<D: Device> {
    device: D,
    limits: DeviceLimits,
    queue: CommandQueue,
    scratch: ChunkedScratchBuffer,
    pipelines: PipelineCache,
    bind_groups: BindGroupCache,
    samplers: SamplerCache,
    uniforms: UniformRegistry,
    clear_quad: Option<ClearQuad>,
    occlusion: OcclusionQuery,
    occlusion_handles: Pool<OcclusionQueryHandle, ()>,
    timer: Option<TimerQuery>,
    vertex_layouts: Pool<VertexLayoutHandle, VertexLayout>,
    vertex_buffers: Pool<VertexBufferHandle, Buffer>,
    index_buffers: Pool<IndexBufferHandle, Buffer>,
    shaders: Pool<ShaderHandle, Shader>,
    programs: Pool<ProgramHandle, Program>,
    textures: Pool<TextureHandle, Texture>,
    frame_buffers: Pool<FrameBufferHandle, FrameBuffer>,
    main_frame_buffer: Option<FrameBufferHandle>,
    resolution: Resolution,
    debug: DebugFlags,
    pending_resets: u32,
    stats: Stats,
}

impl<D: Device> RendererContext<D> {
    pub fn new(device: D, desc: ContextDesc) -> Result<Self, Error> {
        let limits = device.limits();
        log::info!(
            "Creating renderer: {} frames in flight, timestamps {}",
            desc.max_frame_latency,
            limits.timestamp_queries
        );
        let align = limits
            .min_uniform_buffer_offset_alignment
            .max(MIN_BUFFER_OFFSET_ALIGNMENT);
        let scratch = ChunkedScratchBuffer::new(
            &device,
            desc.scratch_chunk_size,
            desc.scratch_chunks,
            wgpu::BufferUsages::UNIFORM,
            align,
        );
        let mut uniforms = UniformRegistry::new(MAX_UNIFORMS);
        let clear_quad = ClearQuad::new(&device, &mut uniforms)?;
        let occlusion = OcclusionQuery::new(&device, desc.max_occlusion_queries);
        let timer = desc
            .timing
            .then(|| TimerQuery::new(&device, limits.timestamp_queries, limits.timestamp_period));

        Ok(Self {
            queue: CommandQueue::new(desc.max_frame_latency),
            scratch,
            pipelines: PipelineCache::new(desc.pipeline_cache_capacity),
            bind_groups: BindGroupCache::new(desc.bind_group_cache_capacity),
            samplers: SamplerCache::new(limits.clamp_to_border),
            uniforms,
            clear_quad: Some(clear_quad),
            occlusion,
            occlusion_handles: Pool::new("occlusion query", desc.max_occlusion_queries as usize),
            timer,
            vertex_layouts: Pool::new("vertex layout", MAX_VERTEX_LAYOUTS),
            vertex_buffers: Pool::new("vertex buffer", MAX_BUFFERS),
            index_buffers: Pool::new("index buffer", MAX_BUFFERS),
            shaders: Pool::new("shader", MAX_SHADERS),
            programs: Pool::new("program", MAX_PROGRAMS),
            textures: Pool::new("texture", MAX_TEXTURES),
            frame_buffers: Pool::new("frame buffer", MAX_FRAME_BUFFERS),
            main_frame_buffer: None,
            resolution: Resolution::default(),
            debug: DebugFlags::empty(),
            pending_resets: 0,
            stats: Stats::default(),
            limits,
            device,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Counters of the last submitted frame.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Reports device loss. Nothing is recovered.
    pub fn is_device_removed(&self) -> bool {
        self.device.is_device_lost()
    }

    pub fn frame_in_flight(&self) -> u32 {
        self.queue.frame_in_flight()
    }

    //=========================================================================
    // Buffers
    //=========================================================================

    pub fn create_vertex_layout(&mut self, layout: VertexLayout) -> Result<VertexLayoutHandle, Error> {
        self.vertex_layouts.insert(layout)
    }

    pub fn destroy_vertex_layout(&mut self, handle: VertexLayoutHandle) -> Result<(), Error> {
        self.vertex_layouts.remove(handle).map(|_| ())
    }

    fn create_vertex_buffer_impl(
        &mut self,
        size: u64,
        data: Option<&[u8]>,
        layout: VertexLayoutHandle,
        flags: BufferFlags,
        dynamic: bool,
    ) -> Result<VertexBufferHandle, Error> {
        self.vertex_layouts.get(layout)?;
        let mut buffer = Buffer::create(&self.device, "vertex", size, data, flags, true, dynamic);
        buffer.layout = Some(layout);
        self.vertex_buffers.insert(buffer)
    }

    pub fn create_vertex_buffer(
        &mut self,
        data: &[u8],
        layout: VertexLayoutHandle,
        flags: BufferFlags,
    ) -> Result<VertexBufferHandle, Error> {
        self.create_vertex_buffer_impl(data.len() as u64, Some(data), layout, flags, false)
    }

    pub fn create_dynamic_vertex_buffer(
        &mut self,
        size: u64,
        layout: VertexLayoutHandle,
        flags: BufferFlags,
    ) -> Result<VertexBufferHandle, Error> {
        self.create_vertex_buffer_impl(size, None, layout, flags, true)
    }

    /// Raw buffer usable for compute storage and indirect arguments.
    pub fn create_storage_buffer(
        &mut self,
        size: u64,
        flags: BufferFlags,
    ) -> Result<VertexBufferHandle, Error> {
        let buffer = Buffer::create(&self.device, "storage", size, None, flags, true, true);
        self.vertex_buffers.insert(buffer)
    }

    pub fn update_dynamic_vertex_buffer(
        &mut self,
        handle: VertexBufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let buffer = self.vertex_buffers.get(handle)?;
        if !buffer.dynamic {
            return Err(Error::InvalidHandle("dynamic vertex buffer"));
        }
        buffer.update(&self.device, offset, data);
        Ok(())
    }

    pub fn destroy_vertex_buffer(&mut self, handle: VertexBufferHandle) -> Result<(), Error> {
        self.vertex_buffers.remove(handle)?.destroy(&mut self.queue);
        Ok(())
    }

    pub fn create_index_buffer(
        &mut self,
        data: &[u8],
        flags: BufferFlags,
    ) -> Result<IndexBufferHandle, Error> {
        let buffer = Buffer::create(
            &self.device,
            "index",
            data.len() as u64,
            Some(data),
            flags,
            false,
            false,
        );
        self.index_buffers.insert(buffer)
    }

    pub fn create_dynamic_index_buffer(
        &mut self,
        size: u64,
        flags: BufferFlags,
    ) -> Result<IndexBufferHandle, Error> {
        let buffer = Buffer::create(&self.device, "index", size, None, flags, false, true);
        self.index_buffers.insert(buffer)
    }

    pub fn update_dynamic_index_buffer(
        &mut self,
        handle: IndexBufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        let buffer = self.index_buffers.get(handle)?;
        if !buffer.dynamic {
            return Err(Error::InvalidHandle("dynamic index buffer"));
        }
        buffer.update(&self.device, offset, data);
        Ok(())
    }

    pub fn destroy_index_buffer(&mut self, handle: IndexBufferHandle) -> Result<(), Error> {
        self.index_buffers.remove(handle)?.destroy(&mut self.queue);
        Ok(())
    }

    //=========================================================================
    // Shaders and uniforms
    //=========================================================================

    pub fn create_uniform(
        &mut self,
        name: &str,
        ty: UniformType,
        num: u16,
    ) -> Result<UniformHandle, Error> {
        self.uniforms.create(name, ty, num)
    }

    pub fn destroy_uniform(&mut self, handle: UniformHandle) -> Result<(), Error> {
        self.uniforms.destroy(handle)
    }

    /// Loads a shader binary. Uniforms it references must be created first.
    pub fn create_shader(&mut self, data: &[u8], label: &str) -> Result<ShaderHandle, Error> {
        let shader = Shader::create(&self.device, data, &self.uniforms, label)?;
        self.shaders.insert(shader)
    }

    /// Programs keep their own copy of everything they need; the shaders
    /// may be destroyed once the program exists.
    pub fn destroy_shader(&mut self, handle: ShaderHandle) -> Result<(), Error> {
        self.shaders.remove(handle)?.destroy(&self.device);
        Ok(())
    }

    pub fn create_program(
        &mut self,
        vs: ShaderHandle,
        fs: Option<ShaderHandle>,
    ) -> Result<ProgramHandle, Error> {
        let vs_shader = self.shaders.get(vs)?;
        let fs = match fs {
            Some(handle) => Some((handle, self.shaders.get(handle)?)),
            None => None,
        };
        let program = Program::create(&self.device, vs, vs_shader, fs)?;
        self.programs.insert(program)
    }

    pub fn create_compute_program(&mut self, cs: ShaderHandle) -> Result<ProgramHandle, Error> {
        self.create_program(cs, None)
    }

    pub fn destroy_program(&mut self, handle: ProgramHandle) -> Result<(), Error> {
        self.programs.remove(handle)?.destroy(&mut self.queue);
        Ok(())
    }

    //=========================================================================
    // Textures
    //=========================================================================

    pub fn create_texture(
        &mut self,
        config: TextureConfig,
        data: Option<&[u8]>,
    ) -> Result<TextureHandle, Error> {
        let max = self.limits.max_texture_dimension_2d;
        if config.width > max || config.height > max {
            return Err(Error::Device(format!(
                "texture {}x{} exceeds the device limit of {}",
                config.width, config.height, max
            )));
        }
        let texture = Texture::create(&self.device, "texture", config, data);
        self.textures.insert(texture)
    }

    pub fn update_texture(
        &mut self,
        handle: TextureHandle,
        mip: u8,
        layer: u16,
        origin: [u32; 3],
        size: [u32; 3],
        data: &[u8],
    ) -> Result<(), Error> {
        let texture = self.textures.get(handle)?;
        texture.update(&self.device, mip as u32, layer as u32, origin, size, data);
        Ok(())
    }

    pub fn texture_config(&self, handle: TextureHandle) -> Option<&TextureConfig> {
        self.textures.try_get(handle).map(|texture| &texture.config)
    }

    /// Copies a mip of `handle` back to the CPU, blocking until the GPU
    /// has finished all work recorded so far.
    pub fn read_texture(&mut self, handle: TextureHandle, mip: u8) -> Result<Vec<u8>, Error> {
        profiling::scope!("read_texture");
        let texture = self.textures.get(handle)?;
        let format = texture.format();
        let width = (texture.width() >> mip).max(1);
        let height = (texture.height() >> mip).max(1);
        let block_size = format.block_size();
        let bytes_per_row = padded_bytes_per_row(width, block_size);
        let size = bytes_per_row as u64 * height as u64;
        let aspect = if format.is_depth() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };

        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read texture"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.queue.encoder().push(Command::CopyTextureToBuffer {
            src: TextureRegion {
                texture: texture.raw,
                mip_level: mip as u32,
                origin: wgpu::Origin3d::ZERO,
                aspect,
            },
            dst: buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        });
        self.queue.alloc(&self.device, &mut self.scratch);

        let slot = Arc::new(Mutex::new(None));
        let result = Arc::clone(&slot);
        self.device.map_read(
            buffer,
            0..size,
            Box::new(move |data| {
                *result.lock().unwrap() = Some(data);
            }),
        );
        let data = loop {
            if let Some(data) = slot.lock().unwrap().take() {
                break data;
            }
            if self.device.is_device_lost() {
                break Err("device lost".to_string());
            }
            self.device.poll(true);
        };
        self.device.destroy_buffer(buffer);
        let data = data.map_err(Error::ReadbackFailed)?;
        Ok(unpad_rows(&data, width, height, block_size))
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Result<(), Error> {
        self.textures.remove(handle)?.destroy(&mut self.queue);
        Ok(())
    }

    //=========================================================================
    // Frame buffers
    //=========================================================================

    pub fn create_frame_buffer(
        &mut self,
        attachments: &[Attachment],
    ) -> Result<FrameBufferHandle, Error> {
        let frame_buffer = FrameBuffer::from_attachments(&self.device, &mut self.textures, attachments)?;
        self.frame_buffers.insert(frame_buffer)
    }

    pub fn create_frame_buffer_from_window<W: HasWindowHandle + HasDisplayHandle>(
        &mut self,
        window: &W,
        width: u32,
        height: u32,
        format: TextureFormat,
        depth_format: Option<TextureFormat>,
    ) -> Result<FrameBufferHandle, Error> {
        let swap_chain = SwapChain::create(
            &self.device,
            window,
            width,
            height,
            format,
            depth_format,
            self.resolution.reset,
        )?;
        self.frame_buffers.insert(FrameBuffer::from_swap_chain(swap_chain))
    }

    /// Creates the frame buffer views render into when they name none.
    pub fn set_main_window<W: HasWindowHandle + HasDisplayHandle>(
        &mut self,
        window: &W,
        resolution: Resolution,
        depth_format: Option<TextureFormat>,
    ) -> Result<FrameBufferHandle, Error> {
        if let Some(old) = self.main_frame_buffer.take() {
            self.destroy_frame_buffer(old)?;
        }
        self.resolution = resolution;
        let handle = self.create_frame_buffer_from_window(
            window,
            resolution.width,
            resolution.height,
            TextureFormat::Bgra8Unorm,
            depth_format,
        )?;
        self.main_frame_buffer = Some(handle);
        Ok(handle)
    }

    pub fn main_frame_buffer(&self) -> Option<FrameBufferHandle> {
        self.main_frame_buffer
    }

    /// Resizes a window frame buffer through a pre-reset/post-reset cycle.
    pub fn update_frame_buffer(
        &mut self,
        handle: FrameBufferHandle,
        width: u32,
        height: u32,
    ) -> Result<(), Error> {
        let frame_buffer = self.frame_buffers.get_mut(handle)?;
        if frame_buffer.swap_chain().is_none() {
            return Err(Error::InvalidHandle("window frame buffer"));
        }
        self.queue.wait(&self.device);
        frame_buffer.resize(
            &self.device,
            &mut self.queue,
            width,
            height,
            self.resolution.reset,
        );
        self.pending_resets += 1;
        Ok(())
    }

    pub fn frame_buffer_size(&self, handle: FrameBufferHandle) -> Option<(u32, u32)> {
        self.frame_buffers
            .try_get(handle)
            .map(|frame_buffer| (frame_buffer.width, frame_buffer.height))
    }

    pub fn frame_buffer_format_hash(&self, handle: FrameBufferHandle) -> Option<u32> {
        self.frame_buffers
            .try_get(handle)
            .map(|frame_buffer| frame_buffer.format_hash)
    }

    pub fn destroy_frame_buffer(&mut self, handle: FrameBufferHandle) -> Result<(), Error> {
        let frame_buffer = self.frame_buffers.remove(handle)?;
        if self.main_frame_buffer == Some(handle) {
            self.main_frame_buffer = None;
        }
        self.queue.wait(&self.device);
        frame_buffer.destroy(&self.device, &mut self.queue);
        Ok(())
    }

    //=========================================================================
    // Occlusion queries
    //=========================================================================

    pub fn create_occlusion_query(&mut self) -> Result<OcclusionQueryHandle, Error> {
        self.occlusion_handles.insert(())
    }

    pub fn destroy_occlusion_query(&mut self, handle: OcclusionQueryHandle) -> Result<(), Error> {
        self.occlusion_handles.remove(handle)?;
        self.occlusion.forget(handle);
        Ok(())
    }

    /// Samples that passed when the query was last resolved.
    pub fn occlusion_result(&self, handle: OcclusionQueryHandle) -> Option<u64> {
        self.occlusion.result(handle)
    }

    //=========================================================================
    // Submission
    //=========================================================================

    /// Translates `frame` into GPU work and presents the swap chains it
    /// rendered into. Invalid items are skipped; nothing here fails.
    pub fn submit(&mut self, frame: &Frame) {
        profiling::scope!("submit");
        if !frame.is_sorted() {
            log::warn!("Submitting an unsorted frame");
            debug_assert!(false, "frame items must be sorted");
        }

        self.queue.wait(&self.device);
        self.occlusion.consume();
        if let Some(ref mut timer) = self.timer {
            timer.consume();
        }
        let slot = self.queue.frame_in_flight();
        self.scratch.begin(slot);
        self.pipelines.reset_stats();
        self.bind_groups.reset_stats();
        self.bind_groups.sync(self.queue.token(), &mut self.queue);

        let mut stats = Stats {
            num_pre_resets: self.pending_resets,
            num_post_resets: self.pending_resets,
            ..Stats::default()
        };
        self.pending_resets = 0;

        self.apply_updates(&frame.updates);
        self.apply_resolution(frame.resolution, &mut stats);
        if frame.debug.contains(DebugFlags::WIREFRAME) != self.debug.contains(DebugFlags::WIREFRAME)
        {
            self.pipelines.invalidate(&mut self.queue);
        }
        self.debug = frame.debug;
        for (_, frame_buffer) in self.frame_buffers.iter_mut() {
            if let Some(swap_chain) = frame_buffer.swap_chain_mut() {
                swap_chain.begin_frame();
            }
        }
        if let Some(ref mut timer) = self.timer {
            timer.begin(self.queue.encoder());
        }

        let mut rendered = HashSet::new();
        let mut view: Option<ViewState> = None;
        let mut next_blit = 0;
        for item in frame.items.iter() {
            if view.as_ref().map(|state| state.id) != Some(item.view) {
                if let Some(mut state) = view.take() {
                    self.close_view(&mut state, frame, &mut stats);
                }
                next_blit = self.run_blits(frame, next_blit, Some(item.view), &mut stats);
                let state = self.open_view(frame, item.view, &mut stats);
                if let Some(ref target) = state.target {
                    rendered.insert(target.handle);
                }
                view = Some(state);
            }
            let Some(ref mut state) = view else { continue };
            match item.item {
                RenderItem::Draw(ref draw) => self.draw(frame, item, draw, state, &mut stats),
                RenderItem::Compute(ref compute) => {
                    self.dispatch(frame, item, compute, state, &mut stats)
                }
            }
        }
        if let Some(mut state) = view.take() {
            self.close_view(&mut state, frame, &mut stats);
        }
        self.run_blits(frame, next_blit, None, &mut stats);

        self.occlusion.resolve(self.queue.encoder());
        if let Some(ref mut timer) = self.timer {
            timer.end(&mut self.queue);
        }
        stats.scratch_bytes = self.scratch.used();
        stats.num_scratch_chunks = self.scratch.num_chunks() as u32;
        self.scratch.end(&self.device, slot);
        self.queue.frame(&self.device);
        self.occlusion.request_readback(&self.device, &self.queue);
        if let Some(ref mut timer) = self.timer {
            timer.request_readback(&self.device, &self.queue);
        }

        for (handle, frame_buffer) in self.frame_buffers.iter_mut() {
            if !rendered.contains(&handle) {
                continue;
            }
            if let Some(swap_chain) = frame_buffer.swap_chain_mut() {
                if swap_chain.present(&self.device) {
                    stats.num_presents += 1;
                }
            }
        }

        stats.pipelines = self.pipelines.stats();
        stats.num_bind_groups_created = self.bind_groups.created();
        stats.gpu_time = self.timer.as_ref().and_then(|timer| timer.last());
        self.stats = stats;
    }

    fn apply_updates(&mut self, updates: &[ResourceUpdate]) {
        for update in updates.iter() {
            match *update {
                ResourceUpdate::VertexBuffer {
                    handle,
                    offset,
                    ref data,
                } => match self.vertex_buffers.try_get(handle) {
                    Some(buffer) => buffer.update(&self.device, offset as u64, data),
                    None => log::warn!("Update of a destroyed vertex buffer"),
                },
                ResourceUpdate::IndexBuffer {
                    handle,
                    offset,
                    ref data,
                } => match self.index_buffers.try_get(handle) {
                    Some(buffer) => buffer.update(&self.device, offset as u64, data),
                    None => log::warn!("Update of a destroyed index buffer"),
                },
                ResourceUpdate::Texture {
                    handle,
                    mip,
                    layer,
                    origin,
                    size,
                    ref data,
                } => match self.textures.try_get(handle) {
                    Some(texture) => {
                        texture.update(&self.device, mip as u32, layer as u32, origin, size, data)
                    }
                    None => log::warn!("Update of a destroyed texture"),
                },
            }
        }
    }

    fn apply_resolution(&mut self, resolution: Resolution, stats: &mut Stats) {
        if resolution == self.resolution {
            return;
        }
        log::debug!(
            "Resolution {}x{} -> {}x{}",
            self.resolution.width,
            self.resolution.height,
            resolution.width,
            resolution.height
        );
        self.resolution = resolution;
        let Some(handle) = self.main_frame_buffer else {
            return;
        };
        if let Ok(frame_buffer) = self.frame_buffers.get_mut(handle) {
            frame_buffer.resize(
                &self.device,
                &mut self.queue,
                resolution.width,
                resolution.height,
                resolution.reset,
            );
            stats.num_pre_resets += 1;
            stats.num_post_resets += 1;
        }
    }

    /// Copies the blits declared for views before `until`, or all remaining
    /// ones. Returns the index of the first blit not run.
    fn run_blits(
        &mut self,
        frame: &Frame,
        start: usize,
        until: Option<ViewId>,
        stats: &mut Stats,
    ) -> usize {
        let mut index = start;
        while let Some(blit) = frame.blits.get(index) {
            if until.is_some_and(|view| blit.view > view) {
                break;
            }
            index += 1;
            let (Some(src), Some(dst)) = (
                self.textures.try_get(blit.src),
                self.textures.try_get(blit.dst),
            ) else {
                log::warn!("Blit in view {} refers to a destroyed texture", blit.view);
                stats.num_skipped += 1;
                continue;
            };
            let mip_size = |texture: &Texture, mip: u8, origin: [u32; 3]| {
                [
                    (texture.width() >> mip).max(1).saturating_sub(origin[0]),
                    (texture.height() >> mip).max(1).saturating_sub(origin[1]),
                    texture
                        .config
                        .depth
                        .max(texture.config.num_layers)
                        .max(1)
                        .saturating_sub(origin[2]),
                ]
            };
            let src_room = mip_size(src, blit.src_mip, blit.src_origin);
            let dst_room = mip_size(dst, blit.dst_mip, blit.dst_origin);
            let size: [u32; 3] =
                std::array::from_fn(|i| blit.size[i].max(1).min(src_room[i]).min(dst_room[i]));
            if size.contains(&0) {
                log::warn!("Blit in view {} is empty after clipping", blit.view);
                stats.num_skipped += 1;
                continue;
            }
            let region = |texture: &Texture, mip: u8, origin: [u32; 3]| TextureRegion {
                texture: texture.raw,
                mip_level: mip as u32,
                origin: wgpu::Origin3d {
                    x: origin[0],
                    y: origin[1],
                    z: origin[2],
                },
                aspect: wgpu::TextureAspect::All,
            };
            let command = Command::CopyTextureToTexture {
                src: region(src, blit.src_mip, blit.src_origin),
                dst: region(dst, blit.dst_mip, blit.dst_origin),
                size: wgpu::Extent3d {
                    width: size[0],
                    height: size[1],
                    depth_or_array_layers: size[2],
                },
            };
            let encoder = self.queue.encoder();
            if encoder.end_pass() {
                log::debug!("Blit ended an open pass");
            }
            encoder.push(command);
            stats.num_blits += 1;
        }
        index
    }

    fn open_view(&mut self, frame: &Frame, id: ViewId, stats: &mut Stats) -> ViewState {
        profiling::scope!("open view");
        stats.num_views += 1;
        let default_view = View::default();
        let view = frame.view(id).unwrap_or(&default_view);
        let label = if view.name.is_empty() {
            format!("view {}", id)
        } else {
            view.name.clone()
        };
        let debug_group = !view.name.is_empty();
        if debug_group {
            self.queue
                .encoder()
                .push(Command::PushDebugGroup(view.name.clone()));
        }

        let target = self.resolve_target(id, view);
        let rect = target.as_ref().map_or(view.rect, |target| target.rect);
        ViewState {
            id,
            label,
            debug_group,
            matrices: ViewMatrices::new(view, rect),
            target,
            bound: PassCache::default(),
        }
    }

    fn resolve_target(&mut self, id: ViewId, view: &View) -> Option<ViewTarget> {
        let handle = match view.frame_buffer.or(self.main_frame_buffer) {
            Some(handle) => handle,
            None => {
                log::warn!("View {} has no frame buffer to render into", id);
                return None;
            }
        };
        let Ok(frame_buffer) = self.frame_buffers.get_mut(handle) else {
            log::warn!("View {} targets a destroyed frame buffer", id);
            return None;
        };
        if !frame_buffer.is_valid(&self.textures) {
            log::warn!("View {} targets an invalid frame buffer, skipping its draws", id);
            return None;
        }
        let Some(attachments) = frame_buffer.attachments(&self.device) else {
            log::debug!("View {} has no surface texture this frame", id);
            return None;
        };

        let full = Rect::new(0, 0, frame_buffer.width as u16, frame_buffer.height as u16);
        let rect = if view.rect.is_zero() {
            full
        } else {
            view.rect.intersect(&full)
        };
        if rect.is_zero_area() {
            log::warn!("View {} has an empty viewport", id);
            return None;
        }
        let scissor = if view.scissor.is_zero() {
            rect
        } else {
            view.scissor.intersect(&rect)
        };
        if scissor.is_zero_area() {
            log::warn!("View {} has an empty scissor", id);
            return None;
        }
        Some(ViewTarget {
            handle,
            attachments,
            formats: frame_buffer.formats.clone(),
            rect,
            scissor,
            clear: view.clear,
            full_clear: scissor.contains(&full),
            started: false,
        })
    }

    fn close_view(&mut self, view: &mut ViewState, frame: &Frame, stats: &mut Stats) {
        let needs_clear = view
            .target
            .as_ref()
            .is_some_and(|target| !target.started && !target.clear.flags.is_empty());
        if needs_clear {
            self.ensure_render_pass(view, &frame.color_palette, stats);
        }
        let encoder = self.queue.encoder();
        encoder.end_pass();
        if view.debug_group {
            encoder.push(Command::PopDebugGroup);
        }
    }

    /// Opens the view's render pass unless one is open. The first pass of a
    /// view applies its clear.
    fn ensure_render_pass(
        &mut self,
        view: &mut ViewState,
        palette: &[[f32; 4]; MAX_COLOR_PALETTE],
        stats: &mut Stats,
    ) -> bool {
        match self.queue.encoder().pass() {
            PassKind::Render => return true,
            PassKind::Compute => {
                self.queue.encoder().end_pass();
            }
            PassKind::None => {}
        }
        let Some(ref mut target) = view.target else {
            return false;
        };

        let clear_now = !target.started && !target.clear.flags.is_empty();
        let load_clear = clear_now && target.full_clear;
        let flags = target.clear.flags;
        let colors = target
            .attachments
            .colors
            .iter()
            .enumerate()
            .map(|(index, color)| ColorAttachment {
                view: color.view,
                resolve_target: color.resolve_target,
                ops: wgpu::Operations {
                    load: if load_clear && flags.contains(ClearFlags::COLOR) {
                        wgpu::LoadOp::Clear(to_wgpu_color(target.clear.color_of(index, palette)))
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                },
            })
            .collect();
        let depth_format = target.formats.depth;
        let depth_stencil = target.attachments.depth.map(|depth| DepthStencilAttachment {
            view: depth,
            depth_ops: depth_format
                .is_some_and(|format| format.has_depth_aspect())
                .then(|| wgpu::Operations {
                    load: if load_clear && flags.contains(ClearFlags::DEPTH) {
                        wgpu::LoadOp::Clear(target.clear.depth)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
            stencil_ops: depth_format
                .is_some_and(|format| format.has_stencil_aspect())
                .then(|| wgpu::Operations {
                    load: if load_clear && flags.contains(ClearFlags::STENCIL) {
                        wgpu::LoadOp::Clear(target.clear.stencil as u32)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
        });

        let encoder = self.queue.encoder();
        encoder.begin_render_pass(RenderPassDesc {
            label: view.label.clone(),
            colors,
            depth_stencil,
            occlusion_query_set: Some(self.occlusion.query_set()),
        });
        let rect = target.rect;
        let scissor = target.scissor;
        encoder.push(Command::SetViewport {
            rect: [
                rect.x as f32,
                rect.y as f32,
                rect.width as f32,
                rect.height as f32,
            ],
            depth: 0.0..1.0,
        });
        encoder.push(Command::SetScissor {
            x: scissor.x as u32,
            y: scissor.y as u32,
            width: scissor.width as u32,
            height: scissor.height as u32,
        });
        stats.num_render_passes += 1;
        target.started = true;
        view.bound = PassCache {
            scissor: Some(scissor),
            ..PassCache::default()
        };

        if clear_now && !load_clear {
            if let Some(ref clear_quad) = self.clear_quad {
                let drawn = clear_quad.draw(
                    &self.device,
                    &mut self.queue,
                    &mut self.scratch,
                    &mut self.pipelines,
                    &mut self.bind_groups,
                    &target.formats,
                    &target.clear,
                    palette,
                );
                if !drawn {
                    log::warn!("Partial clear of view {} was not drawn", view.id);
                }
            }
        }
        true
    }

    fn ensure_compute_pass(&mut self, view: &mut ViewState, stats: &mut Stats) {
        let encoder = self.queue.encoder();
        match encoder.pass() {
            PassKind::Compute => return,
            PassKind::Render => {
                encoder.end_pass();
            }
            PassKind::None => {}
        }
        encoder.begin_compute_pass(&view.label);
        stats.num_compute_passes += 1;
        view.bound = PassCache::default();
    }

    fn apply_uniforms(&mut self, frame: &Frame, range: std::ops::Range<u32>) {
        let updates = frame
            .uniforms
            .get(range.start as usize..range.end as usize)
            .unwrap_or_default();
        for update in updates.iter() {
            self.uniforms.update(update.uniform, &update.data);
        }
    }

    /// Assembles and uploads the constant blocks of `program`.
    fn write_constants(
        &mut self,
        program: ProgramHandle,
        matrices: &ViewMatrices,
        models: &[mint::ColumnMatrix4<f32>],
        alpha_ref: f32,
    ) -> Result<Option<ScratchWrite>, ()> {
        let program = self.programs.try_get(program).ok_or(())?;
        if program.num_uniforms == 0 {
            return Ok(None);
        }
        let vs = self.shaders.try_get(program.vs).ok_or(())?;
        let vs_block = if program.vs_gpu_size > 0 {
            assemble_block(vs, &self.uniforms, matrices, models, alpha_ref)
        } else {
            Vec::new()
        };
        let fs_block = match program.fs.and_then(|fs| self.shaders.try_get(fs)) {
            Some(fs) if program.fs_gpu_size > 0 => {
                assemble_block(fs, &self.uniforms, matrices, models, alpha_ref)
            }
            _ => Vec::new(),
        };
        self.scratch
            .write(&self.device, &vs_block, &fs_block)
            .map(Some)
            .ok_or(())
    }

    fn draw(
        &mut self,
        frame: &Frame,
        item: &SubmitItem,
        draw: &RenderDraw,
        view: &mut ViewState,
        stats: &mut Stats,
    ) {
        use slotmap::Key as _;

        if draw.program.is_null() {
            // Touch: the view only needs its clear.
            self.ensure_render_pass(view, &frame.color_palette, stats);
            return;
        }
        match self.programs.try_get(draw.program) {
            Some(program) if program.is_compute => {
                log::warn!("Compute program submitted as a draw in view {}", view.id);
                stats.num_skipped += 1;
                return;
            }
            Some(_) => {}
            None => {
                log::warn!("Draw in view {} uses a destroyed program", view.id);
                stats.num_skipped += 1;
                return;
            }
        }
        if let Some(OcclusionUse::Conditional(query)) = draw.occlusion {
            if !self.occlusion.is_visible(query) {
                stats.num_occlusion_culled += 1;
                return;
            }
        }
        if !self.ensure_render_pass(view, &frame.color_palette, stats) {
            stats.num_skipped += 1;
            return;
        }
        let Some(ref target) = view.target else {
            return;
        };

        let scissor = match draw.scissor {
            Some(index) => match frame.rect_cache.get(index as usize) {
                Some(rect) => rect.intersect(&target.scissor),
                None => target.scissor,
            },
            None => target.scissor,
        };
        if scissor.is_zero_area() {
            stats.num_skipped += 1;
            return;
        }

        self.apply_uniforms(frame, draw.uniforms.clone());
        let models = model_matrices(frame, draw.matrix, draw.num_matrices);
        let alpha_ref = draw.state.alpha_ref_value() as f32 / 255.0;
        let Ok(write) = self.write_constants(draw.program, &view.matrices, models, alpha_ref)
        else {
            stats.num_skipped += 1;
            return;
        };

        // Vertex streams in slot order.
        let mut streams = Vec::with_capacity(MAX_VERTEX_STREAMS);
        for stream in draw.streams.iter().flatten() {
            let Some(buffer) = self.vertex_buffers.try_get(stream.buffer) else {
                log::warn!("Draw in view {} uses a destroyed vertex buffer", view.id);
                stats.num_skipped += 1;
                return;
            };
            let Some(layout) = stream
                .layout
                .or(buffer.layout)
                .and_then(|layout| self.vertex_layouts.try_get(layout))
            else {
                log::warn!("Vertex stream in view {} has no layout", view.id);
                stats.num_skipped += 1;
                return;
            };
            streams.push((buffer, layout, stream.start_vertex));
        }
        let instance = match draw.instance_data {
            Some(data) => match self.vertex_buffers.try_get(data.buffer) {
                Some(buffer) => Some((buffer, data)),
                None => {
                    log::warn!("Draw in view {} uses destroyed instance data", view.id);
                    stats.num_skipped += 1;
                    return;
                }
            },
            None => None,
        };
        let index_buffer = match draw.index_buffer {
            Some(handle) => match self.index_buffers.try_get(handle) {
                Some(buffer) => Some(buffer),
                None => {
                    log::warn!("Draw in view {} uses a destroyed index buffer", view.id);
                    stats.num_skipped += 1;
                    return;
                }
            },
            None => None,
        };
        let indices = match index_buffer {
            Some(buffer) => {
                let index_size = match buffer.index_format() {
                    wgpu::IndexFormat::Uint16 => 2,
                    wgpu::IndexFormat::Uint32 => 4,
                };
                let available = (buffer.size / index_size) as u32;
                let count = if draw.num_indices == u32::MAX {
                    available.saturating_sub(draw.start_index)
                } else {
                    draw.num_indices
                };
                match draw.start_index.checked_add(count) {
                    Some(end) => Some(draw.start_index..end),
                    None => {
                        log::warn!(
                            "Draw in view {} has an index range overflowing u32",
                            view.id
                        );
                        stats.num_skipped += 1;
                        return;
                    }
                }
            }
            None => None,
        };
        let indirect = match draw.indirect {
            Some(indirect) => match self.vertex_buffers.try_get(indirect.buffer) {
                Some(buffer) => match indirect.commands(buffer.size) {
                    Some(commands) => Some((buffer.raw, commands)),
                    None => {
                        log::warn!(
                            "Draw in view {} reads indirect commands {}+{} past its buffer",
                            view.id,
                            indirect.start,
                            indirect.count
                        );
                        stats.num_skipped += 1;
                        return;
                    }
                },
                None => {
                    log::warn!("Draw in view {} uses a destroyed indirect buffer", view.id);
                    stats.num_skipped += 1;
                    return;
                }
            },
            None => None,
        };

        let Some(program) = self.programs.try_get(draw.program) else {
            return;
        };
        let (Some(vs), fs) = (
            self.shaders.try_get(program.vs),
            program.fs.and_then(|fs| self.shaders.try_get(fs)),
        ) else {
            log::warn!("Draw in view {} uses a program whose shader is gone", view.id);
            stats.num_skipped += 1;
            return;
        };

        let layouts: Vec<&VertexLayout> = streams.iter().map(|&(_, layout, _)| layout).collect();
        let request = RenderPipelineRequest {
            program,
            vs,
            fs,
            state: draw.state,
            stencil: draw.stencil,
            rgba: draw.rgba,
            streams: &layouts,
            num_instance_data: instance.map_or(0, |(_, data)| data.stride),
            targets: &target.formats,
            wireframe: self.debug.contains(DebugFlags::WIREFRAME),
            index32: index_buffer.is_some_and(|buffer| buffer.flags.contains(BufferFlags::INDEX32)),
        };
        let Some(pipeline) = self
            .pipelines
            .get_render_pipeline(&self.device, &mut self.queue, &request)
        else {
            stats.num_skipped += 1;
            return;
        };

        let Some(entries) = collect_entries(
            &self.device,
            program,
            &item.bind,
            write.as_ref(),
            &mut BindResources {
                textures: &mut self.textures,
                vertex_buffers: &self.vertex_buffers,
                index_buffers: &self.index_buffers,
                samplers: &mut self.samplers,
            },
        ) else {
            stats.num_skipped += 1;
            return;
        };
        let group = self
            .bind_groups
            .get_or_create(&self.device, &mut self.queue, program, &entries);
        let offsets = dynamic_offsets(program, write.as_ref());

        let bound = &mut view.bound;
        let encoder = self.queue.encoder();
        if bound.scissor != Some(scissor) {
            encoder.push(Command::SetScissor {
                x: scissor.x as u32,
                y: scissor.y as u32,
                width: scissor.width as u32,
                height: scissor.height as u32,
            });
            bound.scissor = Some(scissor);
        }
        if bound.render_pipeline != Some(pipeline) {
            encoder.push(Command::SetRenderPipeline(pipeline));
            bound.render_pipeline = Some(pipeline);
        }
        let group_state = (group.raw, offsets);
        if bound.bind_group.as_ref() != Some(&group_state) {
            encoder.set_bind_group(&group, &group_state.1);
            bound.bind_group = Some(group_state);
        }
        for (slot, &(buffer, layout, start_vertex)) in streams.iter().enumerate() {
            let binding = (buffer.raw, start_vertex as u64 * layout.stride() as u64);
            if bound.vertex_buffers[slot] != Some(binding) {
                encoder.push(Command::SetVertexBuffer {
                    slot: slot as u32,
                    buffer: binding.0,
                    offset: binding.1,
                });
                bound.vertex_buffers[slot] = Some(binding);
            }
        }
        if let Some((buffer, data)) = instance {
            let slot = streams.len();
            let binding = (buffer.raw, data.offset as u64);
            if bound.vertex_buffers[slot] != Some(binding) {
                encoder.push(Command::SetVertexBuffer {
                    slot: slot as u32,
                    buffer: binding.0,
                    offset: binding.1,
                });
                bound.vertex_buffers[slot] = Some(binding);
            }
        }
        if let Some(buffer) = index_buffer {
            let binding = (buffer.raw, buffer.index_format());
            if bound.index_buffer != Some(binding) {
                encoder.push(Command::SetIndexBuffer {
                    buffer: binding.0,
                    format: binding.1,
                    offset: 0,
                });
                bound.index_buffer = Some(binding);
            }
        }
        if draw.stencil.is_enabled() {
            let reference = draw.stencil.reference();
            if bound.stencil_reference != Some(reference) {
                encoder.push(Command::SetStencilReference(reference));
                bound.stencil_reference = Some(reference);
            }
        }
        if draw.state.uses_blend_factor()
            && !draw.state.contains(State::BLEND_INDEPENDENT)
            && bound.blend_constant != Some(draw.rgba)
        {
            encoder.push(Command::SetBlendConstant(to_wgpu_color(unpack_rgba(
                draw.rgba,
            ))));
            bound.blend_constant = Some(draw.rgba);
        }

        let probe = match draw.occlusion {
            Some(OcclusionUse::Probe(query)) if self.occlusion_handles.contains(query) => {
                self.occlusion.begin(query)
            }
            Some(OcclusionUse::Probe(_)) => {
                log::warn!("Draw in view {} probes a destroyed occlusion query", view.id);
                None
            }
            _ => None,
        };
        let encoder = self.queue.encoder();
        if let Some(index) = probe {
            encoder.push(Command::BeginOcclusionQuery(index));
        }

        let primitive = draw.state.primitive();
        let instances = 0..draw.num_instances;
        match (indirect, indices) {
            (Some((buffer, commands)), indexed) => {
                for command in commands {
                    let offset = command as u64 * DRAW_INDIRECT_STRIDE;
                    encoder.push(match indexed {
                        Some(_) => Command::DrawIndexedIndirect { buffer, offset },
                        None => Command::DrawIndirect { buffer, offset },
                    });
                }
            }
            (None, Some(indices)) => {
                let count = indices.end - indices.start;
                encoder.push(Command::DrawIndexed {
                    indices,
                    base_vertex: 0,
                    instances: instances.clone(),
                });
                stats.num_prims +=
                    primitive.primitive_count(count) as u64 * draw.num_instances as u64;
            }
            (None, None) => {
                let count = if draw.num_vertices == u32::MAX {
                    streams.first().map_or(0, |&(buffer, layout, start)| {
                        let stride = layout.stride().max(1) as u64;
                        ((buffer.size / stride) as u32).saturating_sub(start)
                    })
                } else {
                    draw.num_vertices
                };
                encoder.push(Command::Draw {
                    vertices: 0..count,
                    instances: instances.clone(),
                });
                stats.num_prims +=
                    primitive.primitive_count(count) as u64 * draw.num_instances as u64;
            }
        }
        if probe.is_some() {
            encoder.push(Command::EndOcclusionQuery);
        }
        stats.num_draws += 1;
    }

    fn dispatch(
        &mut self,
        frame: &Frame,
        item: &SubmitItem,
        compute: &RenderCompute,
        view: &mut ViewState,
        stats: &mut Stats,
    ) {
        match self.programs.try_get(compute.program) {
            Some(program) if program.is_compute => {}
            Some(_) => {
                log::warn!("Draw program submitted as a dispatch in view {}", view.id);
                stats.num_skipped += 1;
                return;
            }
            None => {
                log::warn!("Dispatch in view {} uses a destroyed program", view.id);
                stats.num_skipped += 1;
                return;
            }
        }
        self.ensure_compute_pass(view, stats);

        self.apply_uniforms(frame, compute.uniforms.clone());
        let models = model_matrices(frame, compute.matrix, compute.num_matrices);
        let Ok(write) = self.write_constants(compute.program, &view.matrices, models, 0.0) else {
            stats.num_skipped += 1;
            return;
        };
        let Some(program) = self.programs.try_get(compute.program) else {
            return;
        };
        let Some(cs) = self.shaders.try_get(program.vs) else {
            log::warn!("Dispatch in view {} uses a program whose shader is gone", view.id);
            stats.num_skipped += 1;
            return;
        };
        let indirect = match compute.dispatch {
            Dispatch::Indirect(indirect) => match self.vertex_buffers.try_get(indirect.buffer) {
                Some(buffer) => match indirect.commands(buffer.size) {
                    Some(commands) => Some((buffer.raw, commands)),
                    None => {
                        log::warn!(
                            "Dispatch in view {} reads indirect commands {}+{} past its buffer",
                            view.id,
                            indirect.start,
                            indirect.count
                        );
                        stats.num_skipped += 1;
                        return;
                    }
                },
                None => {
                    log::warn!("Dispatch in view {} uses a destroyed indirect buffer", view.id);
                    stats.num_skipped += 1;
                    return;
                }
            },
            Dispatch::Direct(_) => None,
        };
        let Some(pipeline) =
            self.pipelines
                .get_compute_pipeline(&self.device, &mut self.queue, program, cs)
        else {
            stats.num_skipped += 1;
            return;
        };
        let Some(entries) = collect_entries(
            &self.device,
            program,
            &item.bind,
            write.as_ref(),
            &mut BindResources {
                textures: &mut self.textures,
                vertex_buffers: &self.vertex_buffers,
                index_buffers: &self.index_buffers,
                samplers: &mut self.samplers,
            },
        ) else {
            stats.num_skipped += 1;
            return;
        };
        let group = self
            .bind_groups
            .get_or_create(&self.device, &mut self.queue, program, &entries);
        let offsets = dynamic_offsets(program, write.as_ref());

        let bound = &mut view.bound;
        let encoder = self.queue.encoder();
        if bound.compute_pipeline != Some(pipeline) {
            encoder.push(Command::SetComputePipeline(pipeline));
            bound.compute_pipeline = Some(pipeline);
        }
        let group_state = (group.raw, offsets);
        if bound.bind_group.as_ref() != Some(&group_state) {
            encoder.set_bind_group(&group, &group_state.1);
            bound.bind_group = Some(group_state);
        }
        match (compute.dispatch, indirect) {
            (_, Some((buffer, commands))) => {
                for command in commands {
                    encoder.push(Command::DispatchIndirect {
                        buffer,
                        offset: command as u64 * DRAW_INDIRECT_STRIDE,
                    });
                }
            }
            (Dispatch::Direct(groups), None) => encoder.push(Command::Dispatch(groups)),
            (Dispatch::Indirect(_), None) => {}
        }
        stats.num_computes += 1;
    }

    //=========================================================================
    // Shutdown
    //=========================================================================

    /// Waits for the GPU, destroys every object and hands back the device.
    pub fn shutdown(mut self) -> D {
        log::info!("Shutting down renderer");
        self.queue.finish(&self.device);
        self.bind_groups.clear(&mut self.queue);
        self.pipelines.invalidate(&mut self.queue);
        if let Some(clear_quad) = self.clear_quad.take() {
            clear_quad.destroy(&self.device, &mut self.queue);
        }
        for (_, frame_buffer) in self.frame_buffers.drain() {
            frame_buffer.destroy(&self.device, &mut self.queue);
        }
        for (_, program) in self.programs.drain() {
            program.destroy(&mut self.queue);
        }
        for (_, shader) in self.shaders.drain() {
            shader.destroy(&self.device);
        }
        for (_, texture) in self.textures.drain() {
            texture.destroy(&mut self.queue);
        }
        for (_, buffer) in self.vertex_buffers.drain() {
            buffer.destroy(&mut self.queue);
        }
        for (_, buffer) in self.index_buffers.drain() {
            buffer.destroy(&mut self.queue);
        }
        self.occlusion.destroy(&mut self.queue);
        if let Some(timer) = self.timer.take() {
            timer.destroy(&mut self.queue);
        }
        self.queue.finish(&self.device);
        self.samplers.destroy(&self.device);
        self.scratch.destroy(&self.device);
        self.device
    }
}

fn model_matrices(frame: &Frame, matrix: u32, count: u16) -> &[mint::ColumnMatrix4<f32>] {
    let start = (matrix as usize).min(frame.matrix_cache.len());
    let end = (start + count as usize).min(frame.matrix_cache.len());
    &frame.matrix_cache[start..end]
}
