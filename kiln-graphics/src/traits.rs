//! Backend seam.
//!
//! The engine talks to native GPU APIs only through [`Device`]. Native
//! objects are referred to by generational slotmap keys, so the engine can
//! hold on to them without borrowing from the backend.

use std::{num::NonZeroU64, ops::Range};

use slotmap::new_key_type;

use crate::{command::Command, AcquireError, Error};

new_key_type! {
    pub struct BufferKey;
    pub struct TextureKey;
    pub struct TextureViewKey;
    pub struct SamplerKey;
    pub struct ShaderModuleKey;
    /// A bind group layout together with the pipeline layout built from it.
    pub struct BindGroupLayoutKey;
    pub struct RenderPipelineKey;
    pub struct ComputePipelineKey;
    pub struct BindGroupKey;
    pub struct QuerySetKey;
    pub struct SurfaceKey;
}

#[derive(Clone, Debug)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u32,
    pub max_texture_dimension_2d: u32,
    /// Timestamps can be written between passes.
    pub timestamp_queries: bool,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period: f32,
    /// Wireframe rasterization is available.
    pub polygon_mode_line: bool,
    /// `ClampToBorder` address mode is available.
    pub clamp_to_border: bool,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: crate::MIN_BUFFER_OFFSET_ALIGNMENT,
            max_texture_dimension_2d: 8192,
            timestamp_queries: false,
            timestamp_period: 1.0,
            polygon_mode_line: false,
            clamp_to_border: false,
        }
    }
}

pub struct ShaderModuleDesc<'a> {
    pub label: &'a str,
    /// WGSL source.
    pub source: &'a str,
}

pub struct BindGroupLayoutDesc<'a> {
    pub label: &'a str,
    pub entries: &'a [wgpu::BindGroupLayoutEntry],
}

#[derive(Clone, Debug, PartialEq)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: Vec<wgpu::VertexAttribute>,
}

pub struct ShaderEntry<'a> {
    pub module: ShaderModuleKey,
    pub entry_point: &'a str,
}

pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub layout: BindGroupLayoutKey,
    pub vertex: ShaderEntry<'a>,
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub fragment: Option<ShaderEntry<'a>>,
    pub color_targets: &'a [Option<wgpu::ColorTargetState>],
    pub primitive: wgpu::PrimitiveState,
    pub depth_stencil: Option<wgpu::DepthStencilState>,
    pub multisample: wgpu::MultisampleState,
}

pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub layout: BindGroupLayoutKey,
    pub compute: ShaderEntry<'a>,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BindingResource {
    Buffer {
        buffer: BufferKey,
        offset: u64,
        size: Option<NonZeroU64>,
    },
    TextureView(TextureViewKey),
    Sampler(SamplerKey),
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

pub struct BindGroupDesc<'a> {
    pub label: &'a str,
    pub layout: BindGroupLayoutKey,
    pub entries: &'a [BindGroupEntry],
}

/// A sub-resource location for texture copies and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRegion {
    pub texture: TextureKey,
    pub mip_level: u32,
    pub origin: wgpu::Origin3d,
    pub aspect: wgpu::TextureAspect,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub formats: Vec<wgpu::TextureFormat>,
    pub present_modes: Vec<wgpu::PresentMode>,
    pub alpha_modes: Vec<wgpu::CompositeAlphaMode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub format: wgpu::TextureFormat,
    pub width: u32,
    pub height: u32,
    pub present_mode: wgpu::PresentMode,
    pub alpha_mode: wgpu::CompositeAlphaMode,
}

pub type WorkDoneCallback = Box<dyn FnOnce() + Send + 'static>;
pub type ReadbackCallback = Box<dyn FnOnce(Result<Vec<u8>, String>) + Send + 'static>;

/// Native GPU API.
///
/// Methods take `&self`; backends keep their objects behind interior
/// locking. Destroying an object that recorded commands still reference is
/// the caller's responsibility to defer until those commands are submitted.
pub trait Device {
    fn limits(&self) -> DeviceLimits;

    fn create_buffer(&self, desc: &wgpu::BufferDescriptor<'_>) -> BufferKey;
    fn destroy_buffer(&self, buffer: BufferKey);
    /// Queued write, executed before the next submission.
    fn write_buffer(&self, buffer: BufferKey, offset: u64, data: &[u8]);

    fn create_texture(&self, desc: &wgpu::TextureDescriptor<'_>) -> TextureKey;
    fn destroy_texture(&self, texture: TextureKey);
    fn write_texture(
        &self,
        region: TextureRegion,
        data: &[u8],
        layout: wgpu::TexelCopyBufferLayout,
        size: wgpu::Extent3d,
    );
    fn create_texture_view(
        &self,
        texture: TextureKey,
        desc: &wgpu::TextureViewDescriptor<'_>,
    ) -> TextureViewKey;
    fn destroy_texture_view(&self, view: TextureViewKey);

    fn create_sampler(&self, desc: &wgpu::SamplerDescriptor<'_>) -> SamplerKey;
    fn destroy_sampler(&self, sampler: SamplerKey);

    fn create_shader_module(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleKey, Error>;
    fn destroy_shader_module(&self, module: ShaderModuleKey);

    fn create_bind_group_layout(&self, desc: &BindGroupLayoutDesc<'_>) -> BindGroupLayoutKey;
    fn destroy_bind_group_layout(&self, layout: BindGroupLayoutKey);

    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<RenderPipelineKey, Error>;
    fn destroy_render_pipeline(&self, pipeline: RenderPipelineKey);
    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<ComputePipelineKey, Error>;
    fn destroy_compute_pipeline(&self, pipeline: ComputePipelineKey);

    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> BindGroupKey;
    fn destroy_bind_group(&self, group: BindGroupKey);

    fn create_query_set(&self, desc: &wgpu::QuerySetDescriptor<'_>) -> QuerySetKey;
    fn destroy_query_set(&self, set: QuerySetKey);

    fn create_surface<W>(&self, window: &W) -> Result<SurfaceKey, Error>
    where
        W: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle;
    fn surface_capabilities(&self, surface: SurfaceKey) -> SurfaceCapabilities;
    fn configure_surface(&self, surface: SurfaceKey, config: &SurfaceConfig);
    /// Acquires the next presentable texture and returns a view of it.
    fn acquire_surface_texture(&self, surface: SurfaceKey) -> Result<TextureViewKey, AcquireError>;
    /// Drops the acquired texture without presenting it.
    fn discard_surface_texture(&self, surface: SurfaceKey);
    fn present_surface(&self, surface: SurfaceKey);
    fn destroy_surface(&self, surface: SurfaceKey);

    /// Replays `commands` into a native command buffer and submits it.
    /// `on_done` runs from [`Device::poll`] once the GPU finished the work.
    fn submit(&self, commands: Vec<Command>, on_done: WorkDoneCallback);
    /// Maps `range` of a `MAP_READ` buffer once pending work completes.
    fn map_read(&self, buffer: BufferKey, range: Range<u64>, callback: ReadbackCallback);
    /// Processes completion callbacks, blocking for outstanding work when
    /// `wait` is set.
    fn poll(&self, wait: bool);
    fn is_device_lost(&self) -> bool;
}
