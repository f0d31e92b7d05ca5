//! Device that executes nothing on a GPU.
//!
//! Objects live in slotmaps so that keys stay generational, and buffer
//! contents are kept on the CPU. Submitted command lists are recorded for
//! inspection. Copies and query resolves run at submit, completion
//! callbacks wait for [`Device::poll`].

use std::{
    collections::{HashMap, VecDeque},
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
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

/// Native object kinds tracked by the noop device.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ObjectKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    ShaderModule,
    BindGroupLayout,
    RenderPipeline,
    ComputePipeline,
    BindGroup,
    QuerySet,
    Surface,
}

struct TextureEntry {
    size: wgpu::Extent3d,
    block_size: u32,
    /// Mip 0, layer 0, tightly packed.
    data: Vec<u8>,
}

struct QuerySetEntry {
    ty: wgpu::QueryType,
    count: u32,
}

struct SurfaceEntry {
    config: Option<SurfaceConfig>,
    acquired: Option<TextureViewKey>,
}

#[derive(Default)]
struct Hub {
    buffers: SlotMap<BufferKey, Vec<u8>>,
    textures: SlotMap<TextureKey, TextureEntry>,
    texture_views: SlotMap<TextureViewKey, Option<TextureKey>>,
    samplers: SlotMap<SamplerKey, ()>,
    shader_modules: SlotMap<ShaderModuleKey, ()>,
    bind_group_layouts: SlotMap<BindGroupLayoutKey, usize>,
    render_pipelines: SlotMap<RenderPipelineKey, ()>,
    compute_pipelines: SlotMap<ComputePipelineKey, ()>,
    bind_groups: SlotMap<BindGroupKey, usize>,
    query_sets: SlotMap<QuerySetKey, QuerySetEntry>,
    surfaces: SlotMap<SurfaceKey, SurfaceEntry>,
}

impl Hub {
    fn num_live(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Buffer => self.buffers.len(),
            ObjectKind::Texture => self.textures.len(),
            ObjectKind::TextureView => self.texture_views.len(),
            ObjectKind::Sampler => self.samplers.len(),
            ObjectKind::ShaderModule => self.shader_modules.len(),
            ObjectKind::BindGroupLayout => self.bind_group_layouts.len(),
            ObjectKind::RenderPipeline => self.render_pipelines.len(),
            ObjectKind::ComputePipeline => self.compute_pipelines.len(),
            ObjectKind::BindGroup => self.bind_groups.len(),
            ObjectKind::QuerySet => self.query_sets.len(),
            ObjectKind::Surface => self.surfaces.len(),
        }
    }
}

#[derive(Default)]
struct State {
    hub: Hub,
    created: HashMap<ObjectKind, u32>,
    destroyed: HashMap<ObjectKind, u32>,
    /// Destroying a key that is not alive.
    stale_destroys: u32,
    /// Bind groups whose entry count differs from their layout.
    bad_bind_groups: u32,
    submissions: Vec<Vec<Command>>,
    pending_work: Vec<WorkDoneCallback>,
    pending_maps: Vec<(BufferKey, Range<u64>, ReadbackCallback)>,
    acquire_script: VecDeque<AcquireError>,
    occlusion_samples: HashMap<u32, u64>,
    timestamp: u64,
    num_configures: u32,
    num_presents: u32,
    num_discards: u32,
    fail_pipelines: bool,
}

impl State {
    fn created(&mut self, kind: ObjectKind) {
        *self.created.entry(kind).or_default() += 1;
    }

    fn destroyed(&mut self, kind: ObjectKind, alive: bool) {
        if alive {
            *self.destroyed.entry(kind).or_default() += 1;
        } else {
            log::warn!("Destroying a dead {:?}", kind);
            self.stale_destroys += 1;
        }
    }

    fn execute(&mut self, command: &Command) {
        match *command {
            Command::CopyBufferToBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let Some(data) = self
                    .hub
                    .buffers
                    .get(src)
                    .and_then(|data| data.get(src_offset as usize..(src_offset + size) as usize))
                    .map(|slice| slice.to_vec())
                else {
                    return;
                };
                write_bytes(&mut self.hub.buffers, dst, dst_offset, &data);
            }
            Command::ResolveQuerySet {
                set,
                ref queries,
                destination,
                offset,
            } => {
                let Some(entry) = self.hub.query_sets.get(set) else {
                    return;
                };
                let occlusion = matches!(entry.ty, wgpu::QueryType::Occlusion);
                let mut data = Vec::with_capacity(queries.len() * 8);
                for index in queries.clone() {
                    let value = if occlusion {
                        self.occlusion_samples.get(&index).copied().unwrap_or(1)
                    } else {
                        self.timestamp += 1000;
                        self.timestamp
                    };
                    data.extend_from_slice(&value.to_le_bytes());
                }
                write_bytes(&mut self.hub.buffers, destination, offset, &data);
            }
            Command::CopyTextureToBuffer {
                ref src,
                dst,
                ref layout,
                size,
            } => {
                let Some(texture) = self.hub.textures.get(src.texture) else {
                    return;
                };
                let row = (size.width * texture.block_size) as usize;
                let src_row = (texture.size.width * texture.block_size) as usize;
                let mut rows = Vec::new();
                for y in 0..size.height as usize {
                    let start = y * src_row;
                    let mut line = texture.data.get(start..start + row).unwrap_or(&[]).to_vec();
                    line.resize(row, 0);
                    let pitch = layout.bytes_per_row.unwrap_or(row as u32) as usize;
                    line.resize(pitch, 0);
                    rows.extend_from_slice(&line);
                }
                write_bytes(&mut self.hub.buffers, dst, layout.offset, &rows);
            }
            _ => {}
        }
    }
}

fn write_bytes(buffers: &mut SlotMap<BufferKey, Vec<u8>>, key: BufferKey, offset: u64, data: &[u8]) {
    let Some(buffer) = buffers.get_mut(key) else {
        log::warn!("Write into a destroyed buffer");
        return;
    };
    let start = (offset as usize).min(buffer.len());
    let end = (start + data.len()).min(buffer.len());
    buffer[start..end].copy_from_slice(&data[..end - start]);
}

/// CPU-only [`Device`] for tests and headless runs.
pub struct Context {
    limits: DeviceLimits,
    state: Mutex<State>,
    lost: AtomicBool,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

impl Context {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(State::default()),
            lost: AtomicBool::new(false),
        }
    }

    /// Objects created minus objects destroyed, of one kind.
    pub fn num_live(&self, kind: ObjectKind) -> usize {
        self.state.lock().unwrap().hub.num_live(kind)
    }

    pub fn num_created(&self, kind: ObjectKind) -> u32 {
        let state = self.state.lock().unwrap();
        state.created.get(&kind).copied().unwrap_or_default()
    }

    pub fn num_destroyed(&self, kind: ObjectKind) -> u32 {
        let state = self.state.lock().unwrap();
        state.destroyed.get(&kind).copied().unwrap_or_default()
    }

    /// Total of objects still alive.
    pub fn num_live_objects(&self) -> usize {
        const ALL: [ObjectKind; 11] = [
            ObjectKind::Buffer,
            ObjectKind::Texture,
            ObjectKind::TextureView,
            ObjectKind::Sampler,
            ObjectKind::ShaderModule,
            ObjectKind::BindGroupLayout,
            ObjectKind::RenderPipeline,
            ObjectKind::ComputePipeline,
            ObjectKind::BindGroup,
            ObjectKind::QuerySet,
            ObjectKind::Surface,
        ];
        let state = self.state.lock().unwrap();
        ALL.iter().map(|&kind| state.hub.num_live(kind)).sum()
    }

    pub fn num_stale_destroys(&self) -> u32 {
        self.state.lock().unwrap().stale_destroys
    }

    pub fn num_bad_bind_groups(&self) -> u32 {
        self.state.lock().unwrap().bad_bind_groups
    }

    /// Takes every command list submitted so far.
    pub fn take_submissions(&self) -> Vec<Vec<Command>> {
        std::mem::take(&mut self.state.lock().unwrap().submissions)
    }

    pub fn num_pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.pending_work.len() + state.pending_maps.len()
    }

    /// Contents of a buffer.
    pub fn buffer_data(&self, buffer: BufferKey) -> Option<Vec<u8>> {
        self.state.lock().unwrap().hub.buffers.get(buffer).cloned()
    }

    /// The next acquisitions fail with `errors`, in order.
    pub fn script_acquire(&self, errors: impl IntoIterator<Item = AcquireError>) {
        self.state.lock().unwrap().acquire_script.extend(errors);
    }

    /// Samples reported by occlusion query `index` from now on.
    pub fn set_occlusion_samples(&self, index: u32, samples: u64) {
        self.state
            .lock()
            .unwrap()
            .occlusion_samples
            .insert(index, samples);
    }

    /// Makes pipeline creation fail.
    pub fn fail_pipelines(&self, fail: bool) {
        self.state.lock().unwrap().fail_pipelines = fail;
    }

    pub fn lose(&self) {
        log::warn!("Device lost on request");
        self.lost.store(true, Ordering::Release);
    }

    pub fn num_configures(&self) -> u32 {
        self.state.lock().unwrap().num_configures
    }

    pub fn num_presents(&self) -> u32 {
        self.state.lock().unwrap().num_presents
    }

    pub fn num_discards(&self) -> u32 {
        self.state.lock().unwrap().num_discards
    }

    pub fn surface_config(&self, surface: SurfaceKey) -> Option<SurfaceConfig> {
        let state = self.state.lock().unwrap();
        state.hub.surfaces.get(surface).and_then(|entry| entry.config.clone())
    }
}

impl Device for Context {
    fn limits(&self) -> DeviceLimits {
        self.limits.clone()
    }

    fn create_buffer(&self, desc: &wgpu::BufferDescriptor<'_>) -> BufferKey {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::Buffer);
        state.hub.buffers.insert(vec![0; desc.size as usize])
    }

    fn destroy_buffer(&self, buffer: BufferKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.buffers.remove(buffer).is_some();
        state.destroyed(ObjectKind::Buffer, alive);
    }

    fn write_buffer(&self, buffer: BufferKey, offset: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        write_bytes(&mut state.hub.buffers, buffer, offset, data);
    }

    fn create_texture(&self, desc: &wgpu::TextureDescriptor<'_>) -> TextureKey {
        let block_size = desc.format.block_copy_size(None).unwrap_or(4);
        let len = desc.size.width as usize * desc.size.height as usize * block_size as usize;
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::Texture);
        state.hub.textures.insert(TextureEntry {
            size: desc.size,
            block_size,
            data: vec![0; len],
        })
    }

    fn destroy_texture(&self, texture: TextureKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.textures.remove(texture).is_some();
        state.destroyed(ObjectKind::Texture, alive);
    }

    fn write_texture(
        &self,
        region: TextureRegion,
        data: &[u8],
        layout: wgpu::TexelCopyBufferLayout,
        size: wgpu::Extent3d,
    ) {
        if region.mip_level != 0 || region.origin.z != 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let Some(texture) = state.hub.textures.get_mut(region.texture) else {
            log::warn!("Write into a destroyed texture");
            return;
        };
        let block = texture.block_size as usize;
        let row = size.width as usize * block;
        let pitch = layout.bytes_per_row.map_or(row, |pitch| pitch as usize);
        let dst_pitch = texture.size.width as usize * block;
        for y in 0..size.height as usize {
            let src = layout.offset as usize + y * pitch;
            let dst = (region.origin.y as usize + y) * dst_pitch + region.origin.x as usize * block;
            let (Some(line), true) = (data.get(src..src + row), dst + row <= texture.data.len())
            else {
                break;
            };
            texture.data[dst..dst + row].copy_from_slice(line);
        }
    }

    fn create_texture_view(
        &self,
        texture: TextureKey,
        _desc: &wgpu::TextureViewDescriptor<'_>,
    ) -> TextureViewKey {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::TextureView);
        state.hub.texture_views.insert(Some(texture))
    }

    fn destroy_texture_view(&self, view: TextureViewKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.texture_views.remove(view).is_some();
        state.destroyed(ObjectKind::TextureView, alive);
    }

    fn create_sampler(&self, _desc: &wgpu::SamplerDescriptor<'_>) -> SamplerKey {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::Sampler);
        state.hub.samplers.insert(())
    }

    fn destroy_sampler(&self, sampler: SamplerKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.samplers.remove(sampler).is_some();
        state.destroyed(ObjectKind::Sampler, alive);
    }

    fn create_shader_module(&self, _desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleKey, Error> {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::ShaderModule);
        Ok(state.hub.shader_modules.insert(()))
    }

    fn destroy_shader_module(&self, module: ShaderModuleKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.shader_modules.remove(module).is_some();
        state.destroyed(ObjectKind::ShaderModule, alive);
    }

    fn create_bind_group_layout(&self, desc: &BindGroupLayoutDesc<'_>) -> BindGroupLayoutKey {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::BindGroupLayout);
        state.hub.bind_group_layouts.insert(desc.entries.len())
    }

    fn destroy_bind_group_layout(&self, layout: BindGroupLayoutKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.bind_group_layouts.remove(layout).is_some();
        state.destroyed(ObjectKind::BindGroupLayout, alive);
    }

    fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<RenderPipelineKey, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pipelines {
            return Err(Error::Device(format!("pipeline '{}' rejected", desc.label)));
        }
        state.created(ObjectKind::RenderPipeline);
        Ok(state.hub.render_pipelines.insert(()))
    }

    fn destroy_render_pipeline(&self, pipeline: RenderPipelineKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.render_pipelines.remove(pipeline).is_some();
        state.destroyed(ObjectKind::RenderPipeline, alive);
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<ComputePipelineKey, Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_pipelines {
            return Err(Error::Device(format!("pipeline '{}' rejected", desc.label)));
        }
        state.created(ObjectKind::ComputePipeline);
        Ok(state.hub.compute_pipelines.insert(()))
    }

    fn destroy_compute_pipeline(&self, pipeline: ComputePipelineKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.compute_pipelines.remove(pipeline).is_some();
        state.destroyed(ObjectKind::ComputePipeline, alive);
    }

    fn create_bind_group(&self, desc: &BindGroupDesc<'_>) -> BindGroupKey {
        let mut state = self.state.lock().unwrap();
        match state.hub.bind_group_layouts.get(desc.layout) {
            Some(&num_entries) if num_entries != desc.entries.len() => {
                log::error!(
                    "Bind group '{}' has {} entries, its layout {}",
                    desc.label,
                    desc.entries.len(),
                    num_entries
                );
                state.bad_bind_groups += 1;
            }
            Some(_) => {}
            None => {
                log::error!("Bind group '{}' uses a destroyed layout", desc.label);
                state.bad_bind_groups += 1;
            }
        }
        state.created(ObjectKind::BindGroup);
        state.hub.bind_groups.insert(desc.entries.len())
    }

    fn destroy_bind_group(&self, group: BindGroupKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.bind_groups.remove(group).is_some();
        state.destroyed(ObjectKind::BindGroup, alive);
    }

    fn create_query_set(&self, desc: &wgpu::QuerySetDescriptor<'_>) -> QuerySetKey {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::QuerySet);
        state.hub.query_sets.insert(QuerySetEntry {
            ty: desc.ty,
            count: desc.count,
        })
    }

    fn destroy_query_set(&self, set: QuerySetKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.query_sets.remove(set).is_some();
        state.destroyed(ObjectKind::QuerySet, alive);
    }

    fn create_surface<W>(&self, _window: &W) -> Result<SurfaceKey, Error>
    where
        W: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    {
        let mut state = self.state.lock().unwrap();
        state.created(ObjectKind::Surface);
        Ok(state.hub.surfaces.insert(SurfaceEntry {
            config: None,
            acquired: None,
        }))
    }

    fn surface_capabilities(&self, _surface: SurfaceKey) -> SurfaceCapabilities {
        SurfaceCapabilities {
            formats: vec![
                wgpu::TextureFormat::Bgra8Unorm,
                wgpu::TextureFormat::Bgra8UnormSrgb,
                wgpu::TextureFormat::Rgba8Unorm,
            ],
            present_modes: vec![wgpu::PresentMode::Fifo, wgpu::PresentMode::Immediate],
            alpha_modes: vec![wgpu::CompositeAlphaMode::Opaque],
        }
    }

    fn configure_surface(&self, surface: SurfaceKey, config: &SurfaceConfig) {
        let mut state = self.state.lock().unwrap();
        state.num_configures += 1;
        if let Some(entry) = state.hub.surfaces.get_mut(surface) {
            entry.config = Some(config.clone());
        }
    }

    fn acquire_surface_texture(&self, surface: SurfaceKey) -> Result<TextureViewKey, AcquireError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.acquire_script.pop_front() {
            return Err(error);
        }
        match state.hub.surfaces.get(surface) {
            Some(entry) if entry.config.is_some() => {}
            _ => return Err(AcquireError::Lost),
        }
        state.created(ObjectKind::TextureView);
        let view = state.hub.texture_views.insert(None);
        if let Some(entry) = state.hub.surfaces.get_mut(surface) {
            entry.acquired = Some(view);
        }
        Ok(view)
    }

    fn discard_surface_texture(&self, surface: SurfaceKey) {
        let mut state = self.state.lock().unwrap();
        let acquired = state
            .hub
            .surfaces
            .get_mut(surface)
            .and_then(|entry| entry.acquired.take());
        if let Some(view) = acquired {
            state.num_discards += 1;
            let alive = state.hub.texture_views.remove(view).is_some();
            state.destroyed(ObjectKind::TextureView, alive);
        }
    }

    fn present_surface(&self, surface: SurfaceKey) {
        let mut state = self.state.lock().unwrap();
        let acquired = state
            .hub
            .surfaces
            .get_mut(surface)
            .and_then(|entry| entry.acquired.take());
        if let Some(view) = acquired {
            state.num_presents += 1;
            let alive = state.hub.texture_views.remove(view).is_some();
            state.destroyed(ObjectKind::TextureView, alive);
        }
    }

    fn destroy_surface(&self, surface: SurfaceKey) {
        let mut state = self.state.lock().unwrap();
        let alive = state.hub.surfaces.remove(surface).is_some();
        state.destroyed(ObjectKind::Surface, alive);
    }

    fn submit(&self, commands: Vec<Command>, on_done: WorkDoneCallback) {
        let mut state = self.state.lock().unwrap();
        for command in commands.iter() {
            if let Command::ResolveQuerySet { set, ref queries, .. } = *command {
                if let Some(entry) = state.hub.query_sets.get(set) {
                    debug_assert!(queries.end <= entry.count, "query resolve out of range");
                }
            }
            state.execute(command);
        }
        state.submissions.push(commands);
        state.pending_work.push(on_done);
    }

    fn map_read(&self, buffer: BufferKey, range: Range<u64>, callback: ReadbackCallback) {
        let mut state = self.state.lock().unwrap();
        state.pending_maps.push((buffer, range, callback));
    }

    fn poll(&self, _wait: bool) {
        // Callbacks may re-enter the device, so they run unlocked.
        let (work, maps) = {
            let mut state = self.state.lock().unwrap();
            let work = std::mem::take(&mut state.pending_work);
            let maps = std::mem::take(&mut state.pending_maps)
                .into_iter()
                .map(|(buffer, range, callback)| {
                    let data = state
                        .hub
                        .buffers
                        .get(buffer)
                        .and_then(|data| data.get(range.start as usize..range.end as usize))
                        .map(|slice| slice.to_vec())
                        .ok_or_else(|| "mapped range is out of bounds".to_string());
                    (data, callback)
                })
                .collect::<Vec<_>>();
            (work, maps)
        };
        for callback in work {
            callback();
        }
        for (data, callback) in maps {
            callback(data);
        }
    }

    fn is_device_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}
