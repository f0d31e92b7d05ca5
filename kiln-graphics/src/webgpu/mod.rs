//! WebGPU backend over wgpu.
//!
//! Native objects live in a [`Hub`] of slotmaps and are handed out as the
//! generational keys of [`crate::traits`].

mod command;
mod pipeline;
mod platform;
mod resource;
mod surface;

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use slotmap::SlotMap;

use crate::{
    command::Command,
    traits::{
        BindGroupDesc, BindGroupKey, BindGroupLayoutDesc, BindGroupLayoutKey, BufferKey,
        ComputePipelineDesc, ComputePipelineKey, Device, DeviceLimits, QuerySetKey,
        ReadbackCallback, RenderPipelineDesc, RenderPipelineKey, SamplerKey, ShaderModuleDesc,
        ShaderModuleKey, SurfaceCapabilities, SurfaceConfig, SurfaceKey, TextureKey,
        TextureRegion, TextureViewKey, WorkDoneCallback,
    },
    AcquireError, Error,
};

pub use platform::PlatformError;
#[cfg(not(target_arch = "wasm32"))]
pub use platform::create_context;
#[cfg(target_arch = "wasm32")]
pub use platform::create_context_async;

//=============================================================================
// Internal Storage Entry Types
//=============================================================================

/// A bind group layout and the single-group pipeline layout over it.
struct LayoutEntry {
    group: wgpu::BindGroupLayout,
    pipeline: wgpu::PipelineLayout,
}

struct SurfaceEntry {
    raw: wgpu::Surface<'static>,
    /// Acquired texture and the hub view of it, until presented.
    current: Option<(wgpu::SurfaceTexture, TextureViewKey)>,
}

//=============================================================================
// The Hub
//=============================================================================

/// Central storage for all GPU objects.
///
/// Command replay takes `read()` access, creation and destruction take
/// `write()`.
struct Hub {
    buffers: SlotMap<BufferKey, wgpu::Buffer>,
    textures: SlotMap<TextureKey, wgpu::Texture>,
    texture_views: SlotMap<TextureViewKey, wgpu::TextureView>,
    samplers: SlotMap<SamplerKey, wgpu::Sampler>,
    shader_modules: SlotMap<ShaderModuleKey, wgpu::ShaderModule>,
    layouts: SlotMap<BindGroupLayoutKey, LayoutEntry>,
    render_pipelines: SlotMap<RenderPipelineKey, wgpu::RenderPipeline>,
    compute_pipelines: SlotMap<ComputePipelineKey, wgpu::ComputePipeline>,
    bind_groups: SlotMap<BindGroupKey, wgpu::BindGroup>,
    query_sets: SlotMap<QuerySetKey, wgpu::QuerySet>,
    surfaces: SlotMap<SurfaceKey, SurfaceEntry>,
}

impl Hub {
    fn new() -> Self {
        Self {
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            texture_views: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            shader_modules: SlotMap::with_key(),
            layouts: SlotMap::with_key(),
            render_pipelines: SlotMap::with_key(),
            compute_pipelines: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            query_sets: SlotMap::with_key(),
            surfaces: SlotMap::with_key(),
        }
    }
}

//=============================================================================
// Context
//=============================================================================

pub struct Context {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    hub: RwLock<Hub>,
    limits: DeviceLimits,
    /// Wrap object creation into validation error scopes.
    validation: bool,
    lost: Arc<AtomicBool>,
}

impl Context {
    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

impl Device for Context {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn create_buffer(&self, desc: &wgpu::BufferDescriptor<'_>) -> BufferKey {
        let raw = self.device.create_buffer(desc);
        self.hub.write().unwrap().buffers.insert(raw)
    }

    fn destroy_buffer(&self, buffer: BufferKey) {
        if let Some(raw) = self.hub.write().unwrap().buffers.remove(buffer) {
            raw.destroy();
        }
    }

    fn write_buffer(&self, buffer: BufferKey, offset: u64, data: &[u8]) {
        let hub = self.hub.read().unwrap();
        match hub.buffers.get(buffer) {
            Some(raw) => self.queue.write_buffer(raw, offset, data),
            None => log::warn!("Write into a destroyed buffer"),
        }
    }

    fn create_texture(&self, desc: &wgpu::TextureDescriptor<'_>) -> TextureKey {
        let raw = self.device.create_texture(desc);
        self.hub.write().unwrap().textures.insert(raw)
    }

    fn destroy_texture(&self, texture: TextureKey) {
        if let Some(raw) = self.hub.write().unwrap().textures.remove(texture) {
            raw.destroy();
        }
    }

    fn write_texture(
        &self,
        region: TextureRegion,
        data: &[u8],
        layout: wgpu::TexelCopyBufferLayout,
        size: wgpu::Extent3d,
    ) {
        self.write_texture_impl(region, data, layout, size);
    }

    fn create_texture_view(
        &self,
        texture: TextureKey,
        desc: &wgpu::TextureViewDescriptor<'_>,
    ) -> TextureViewKey {
        self.create_texture_view_impl(texture, desc)
    }

    fn destroy_texture_view(&self, view: TextureViewKey) {
        self.hub.write().unwrap().texture_views.remove(view);
    }

    fn create_sampler(&self, desc: &wgpu::SamplerDescriptor<'_>) -> SamplerKey {
        let raw = self.device.create_sampler(desc);
        self.hub.write().unwrap().samplers.insert(raw)
    }

    fn destroy_sampler(&self, sampler: SamplerKey) {
        self.hub.write().unwrap().samplers.remove(sampler);
    }

    fn create_shader_module(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleKey, Error> {
        self.create_shader_module_impl(desc)
    }

    fn destroy_shader_module(&self, module: ShaderModuleKey) {
        self.hub.write().unwrap().shader_modules.remove(module);
    }

    fn create_bind_group_layout(&self, desc: &BindGroupLayoutDesc<'_>) -> BindGroupLayoutKey {
        self.create_bind_group_layout_impl(desc)
    }

    fn destroy_bind_group_layout(&self, layout: BindGroupLayoutKey) {
        self.hub.write().unwrap().layouts.remove(layout);
    }

    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<RenderPipelineKey, Error> {
        self.create_render_pipeline_impl(desc)
    }

    fn destroy_render_pipeline(&self, pipeline: RenderPipelineKey) {
        self.hub.write().unwrap().render_pipelines.remove(pipeline);
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<ComputePipelineKey, Error> {
        self.create_compute_pipeline_impl(desc)
    }

    fn destroy_compute_pipeline(&self, pipeline: ComputePipelineKey) {
        self.hub.write().unwrap().compute_pipelines.remove(pipeline);
    }

    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> BindGroupKey {
        self.create_bind_group_impl(desc)
    }

    fn destroy_bind_group(&self, group: BindGroupKey) {
        self.hub.write().unwrap().bind_groups.remove(group);
    }

    fn create_query_set(&self, desc: &wgpu::QuerySetDescriptor<'_>) -> QuerySetKey {
        let raw = self.device.create_query_set(desc);
        self.hub.write().unwrap().query_sets.insert(raw)
    }

    fn destroy_query_set(&self, set: QuerySetKey) {
        self.hub.write().unwrap().query_sets.remove(set);
    }

    fn create_surface<W>(&self, window: &W) -> Result<SurfaceKey, Error>
    where
        W: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    {
        self.create_surface_impl(window)
    }

    fn surface_capabilities(&self, surface: SurfaceKey) -> SurfaceCapabilities {
        self.surface_capabilities_impl(surface)
    }

    fn configure_surface(&self, surface: SurfaceKey, config: &SurfaceConfig) {
        self.configure_surface_impl(surface, config);
    }

    fn acquire_surface_texture(&self, surface: SurfaceKey) -> Result<TextureViewKey, AcquireError> {
        self.acquire_surface_texture_impl(surface)
    }

    fn discard_surface_texture(&self, surface: SurfaceKey) {
        self.release_surface_texture(surface, false);
    }

    fn present_surface(&self, surface: SurfaceKey) {
        self.release_surface_texture(surface, true);
    }

    fn destroy_surface(&self, surface: SurfaceKey) {
        self.release_surface_texture(surface, false);
        self.hub.write().unwrap().surfaces.remove(surface);
    }

    fn submit(&self, commands: Vec<Command>, on_done: WorkDoneCallback) {
        profiling::scope!("submit");
        let buffer = {
            let hub = self.hub.read().unwrap();
            self.replay(&hub, &commands)
        };
        self.queue.submit(Some(buffer));
        self.queue.on_submitted_work_done(on_done);
    }

    fn map_read(&self, buffer: BufferKey, range: Range<u64>, callback: ReadbackCallback) {
        let raw = match self.hub.read().unwrap().buffers.get(buffer) {
            Some(raw) => raw.clone(),
            None => {
                callback(Err("mapping a destroyed buffer".to_string()));
                return;
            }
        };
        let mapped = raw.clone();
        raw.slice(range.clone())
            .map_async(wgpu::MapMode::Read, move |result| match result {
                Ok(()) => {
                    let data = mapped.slice(range).get_mapped_range().to_vec();
                    mapped.unmap();
                    callback(Ok(data));
                }
                Err(error) => callback(Err(error.to_string())),
            });
    }

    fn poll(&self, wait: bool) {
        let poll_type = if wait {
            wgpu::PollType::wait_indefinitely()
        } else {
            wgpu::PollType::Poll
        };
        if let Err(error) = self.device.poll(poll_type) {
            log::error!("Device poll failed: {}", error);
        }
    }

    fn is_device_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}
