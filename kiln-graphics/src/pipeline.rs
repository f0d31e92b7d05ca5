//! Render and compute pipeline caches.
//!
//! Pipelines are keyed by a Murmur2A hash of everything that makes two
//! pipelines incompatible. The stencil reference and blend constant are
//! dynamic state and never reach the key.

use std::hash::Hash as _;

use strum::IntoEnumIterator as _;

use crate::{
    cache::LruCache,
    command::{CommandQueue, Release},
    frame_buffer::TargetFormats,
    hash::Murmur2A,
    program::Program,
    shader::Shader,
    state::{State, Stencil},
    traits::{
        ComputePipelineDesc, ComputePipelineKey, Device, RenderPipelineDesc, RenderPipelineKey,
        ShaderEntry, VertexBufferLayout,
    },
    vertex::{Attrib, VertexLayout},
    MAX_VERTEX_STREAMS,
};

/// Everything a draw contributes to its pipeline.
pub struct RenderPipelineRequest<'a> {
    pub program: &'a Program,
    pub vs: &'a Shader,
    pub fs: Option<&'a Shader>,
    pub state: State,
    pub stencil: Stencil,
    pub rgba: u32,
    /// Layouts of the bound vertex streams, in stream order.
    pub streams: &'a [&'a VertexLayout],
    /// Number of `vec4` instance attributes.
    pub num_instance_data: u16,
    pub targets: &'a TargetFormats,
    pub wireframe: bool,
    pub index32: bool,
}

/// For each attribute the shader consumes, the stream that supplies it.
/// Later streams win.
fn attribute_owners(vs: &Shader, streams: &[&VertexLayout]) -> Vec<(Attrib, Option<usize>)> {
    Attrib::iter()
        .filter(|&attrib| vs.consumes(attrib))
        .map(|attrib| {
            let owner = streams.iter().rposition(|layout| layout.has(attrib));
            (attrib, owner)
        })
        .collect()
}

impl RenderPipelineRequest<'_> {
    pub fn key(&self) -> u32 {
        let mut murmur = Murmur2A::new();
        murmur.add_u32(self.program.vs_hash);
        murmur.add_u32(self.program.fs_hash);
        murmur.add_u32(self.program.layout_hash);

        let state = self.state & State::COMPATIBILITY_MASK;
        murmur.add_u64(state.bits());
        if self.state.contains(State::BLEND_INDEPENDENT) {
            murmur.add_u32(self.rgba);
        }
        murmur.add_u64(self.stencil.without_reference().0);

        let owners = attribute_owners(self.vs, self.streams);
        for (index, layout) in self.streams.iter().enumerate() {
            let masked = layout.masked(|attrib| {
                owners
                    .iter()
                    .any(|&(a, owner)| a == attrib && owner == Some(index))
            });
            murmur.add_u32(masked.hash());
        }
        murmur.add_u8(self.streams.len() as u8);
        murmur.add_u16(self.num_instance_data);

        self.targets.hash(&mut murmur);
        murmur.add_u8(self.wireframe as u8);
        if self.state.is_strip() {
            murmur.add_u8(self.index32 as u8);
        }
        murmur.end()
    }

    /// Vertex buffer layouts as the shader sees them.
    pub fn vertex_buffers(&self) -> Vec<VertexBufferLayout> {
        debug_assert!(self.streams.len() <= MAX_VERTEX_STREAMS);
        let owners = attribute_owners(self.vs, self.streams);
        let mut buffers: Vec<VertexBufferLayout> = self
            .streams
            .iter()
            .map(|layout| VertexBufferLayout {
                array_stride: layout.stride() as u64,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: Vec::new(),
            })
            .collect();

        for (attrib, owner) in owners {
            let Some(location) = self.vs.location(attrib) else {
                continue;
            };
            match owner {
                Some(index) => {
                    if let Some(desc) = self.streams[index].attribute(attrib) {
                        buffers[index].attributes.push(wgpu::VertexAttribute {
                            format: desc.format(),
                            offset: desc.offset as u64,
                            shader_location: location,
                        });
                    }
                }
                None => match buffers.last_mut() {
                    Some(last) => last.attributes.push(wgpu::VertexAttribute {
                        format: wgpu::VertexFormat::Float32x3,
                        offset: 0,
                        shader_location: location,
                    }),
                    None => log::warn!("{:?} is consumed but no vertex stream is bound", attrib),
                },
            }
        }

        if self.num_instance_data > 0 {
            let base = self.vs.attributes.len() as u32;
            buffers.push(VertexBufferLayout {
                array_stride: self.num_instance_data as u64 * 16,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: (0..self.num_instance_data as u32)
                    .map(|index| wgpu::VertexAttribute {
                        format: wgpu::VertexFormat::Float32x4,
                        offset: index as u64 * 16,
                        shader_location: base + index,
                    })
                    .collect(),
            });
        }
        buffers
    }

    fn color_targets(&self) -> Vec<Option<wgpu::ColorTargetState>> {
        let independent = self.state.contains(State::BLEND_INDEPENDENT);
        self.targets
            .colors
            .iter()
            .enumerate()
            .map(|(index, &format)| {
                let blendable = matches!(
                    format.sample_type(None, None),
                    Some(wgpu::TextureSampleType::Float { filterable: true })
                );
                let blend = if blendable {
                    self.state.blend(self.rgba, if independent { index } else { 0 })
                } else {
                    None
                };
                Some(wgpu::ColorTargetState {
                    format,
                    blend,
                    write_mask: self.state.color_writes(),
                })
            })
            .collect()
    }

    fn depth_stencil(&self) -> Option<wgpu::DepthStencilState> {
        let format = self.targets.depth?;
        Some(wgpu::DepthStencilState {
            format,
            depth_write_enabled: self.state.contains(State::WRITE_Z),
            depth_compare: self
                .state
                .depth_compare()
                .unwrap_or(wgpu::CompareFunction::Always),
            stencil: if format.has_stencil_aspect() && self.stencil.is_enabled() {
                self.stencil.state()
            } else {
                wgpu::StencilState::default()
            },
            bias: wgpu::DepthBiasState::default(),
        })
    }

    fn primitive(&self, polygon_mode_line: bool) -> wgpu::PrimitiveState {
        wgpu::PrimitiveState {
            topology: self.state.topology(),
            strip_index_format: if self.state.is_strip() {
                Some(if self.index32 {
                    wgpu::IndexFormat::Uint32
                } else {
                    wgpu::IndexFormat::Uint16
                })
            } else {
                None
            },
            front_face: self.state.front_face(),
            cull_mode: self.state.cull_mode(),
            unclipped_depth: false,
            polygon_mode: if self.wireframe && polygon_mode_line {
                wgpu::PolygonMode::Line
            } else {
                wgpu::PolygonMode::Fill
            },
            conservative: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub hits: u32,
    pub misses: u32,
    pub evictions: u32,
}

/// Lazily built pipelines, keyed by compatibility hash.
pub struct PipelineCache {
    render: LruCache<RenderPipelineKey>,
    compute: LruCache<ComputePipelineKey>,
    stats: PipelineStats,
}

impl PipelineCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            render: LruCache::new(capacity.max(1)),
            compute: LruCache::new(capacity.max(1)),
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = PipelineStats::default();
    }

    pub fn len(&self) -> usize {
        self.render.len() + self.compute.len()
    }

    pub fn get_render_pipeline<D: Device>(
        &mut self,
        device: &D,
        queue: &mut CommandQueue,
        request: &RenderPipelineRequest<'_>,
    ) -> Option<RenderPipelineKey> {
        let key = request.key();
        if let Some(&raw) = self.render.get(key) {
            self.stats.hits += 1;
            return Some(raw);
        }
        profiling::scope!("create render pipeline");
        self.stats.misses += 1;

        let vertex_buffers = request.vertex_buffers();
        let color_targets = request.color_targets();
        let limits = device.limits();
        let desc = RenderPipelineDesc {
            label: "render",
            layout: request.program.layout,
            vertex: ShaderEntry {
                module: request.vs.module,
                entry_point: &request.vs.entry_point,
            },
            vertex_buffers: &vertex_buffers,
            fragment: request.fs.map(|fs| ShaderEntry {
                module: fs.module,
                entry_point: &fs.entry_point,
            }),
            color_targets: &color_targets,
            primitive: request.primitive(limits.polygon_mode_line),
            depth_stencil: request.depth_stencil(),
            multisample: wgpu::MultisampleState {
                count: request.targets.sample_count.max(1),
                mask: !0,
                alpha_to_coverage_enabled: request.state.contains(State::BLEND_ALPHA_TO_COVERAGE),
            },
        };
        match device.create_render_pipeline(&desc) {
            Ok(raw) => {
                log::debug!("Created render pipeline {:08x}", key);
                if let Some((_, evicted)) = self.render.insert(key, raw) {
                    self.stats.evictions += 1;
                    queue.release(Release::RenderPipeline(evicted));
                }
                Some(raw)
            }
            Err(error) => {
                log::error!("Render pipeline {:08x} creation failed: {}", key, error);
                debug_assert!(false, "render pipeline creation failed: {}", error);
                None
            }
        }
    }

    pub fn get_compute_pipeline<D: Device>(
        &mut self,
        device: &D,
        queue: &mut CommandQueue,
        program: &Program,
        cs: &Shader,
    ) -> Option<ComputePipelineKey> {
        let mut murmur = Murmur2A::new();
        murmur.add_u32(program.vs_hash);
        murmur.add_u32(program.layout_hash);
        let key = murmur.end();
        if let Some(&raw) = self.compute.get(key) {
            self.stats.hits += 1;
            return Some(raw);
        }
        self.stats.misses += 1;
        let desc = ComputePipelineDesc {
            label: "compute",
            layout: program.layout,
            compute: ShaderEntry {
                module: cs.module,
                entry_point: &cs.entry_point,
            },
        };
        match device.create_compute_pipeline(&desc) {
            Ok(raw) => {
                log::debug!("Created compute pipeline {:08x}", key);
                if let Some((_, evicted)) = self.compute.insert(key, raw) {
                    self.stats.evictions += 1;
                    queue.release(Release::ComputePipeline(evicted));
                }
                Some(raw)
            }
            Err(error) => {
                log::error!("Compute pipeline {:08x} creation failed: {}", key, error);
                debug_assert!(false, "compute pipeline creation failed: {}", error);
                None
            }
        }
    }

    /// Drops every pipeline, e.g. when wireframe mode toggles.
    pub fn invalidate(&mut self, queue: &mut CommandQueue) {
        let count = self.len();
        for (_, raw) in self.render.drain() {
            queue.release(Release::RenderPipeline(raw));
        }
        for (_, raw) in self.compute.drain() {
            queue.release(Release::ComputePipeline(raw));
        }
        if count > 0 {
            log::debug!("Invalidated {} pipelines", count);
        }
    }
}
