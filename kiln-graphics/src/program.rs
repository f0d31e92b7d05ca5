//! Programs: a vertex or compute shader with an optional fragment shader.

use std::hash::Hash as _;

use crate::{
    command::{CommandQueue, Release},
    hash::Murmur2A,
    shader::{
        BindInfo, BindKind, Shader, ShaderStage, FRAGMENT_UNIFORM_BINDING, VERTEX_UNIFORM_BINDING,
    },
    traits::{BindGroupLayoutDesc, BindGroupLayoutKey, Device},
    Error, ShaderHandle, MAX_TEXTURE_SAMPLERS,
};

/// Merged binding table and bind group layout of a shader pair.
///
/// Entries are laid out as the constant blocks first, then one texture and
/// sampler pair per sampled slot, then storage buffers and images.
pub struct Program {
    pub vs: ShaderHandle,
    pub fs: Option<ShaderHandle>,
    pub vs_hash: u32,
    pub fs_hash: u32,
    pub is_compute: bool,
    pub bindings: [Option<BindInfo>; MAX_TEXTURE_SAMPLERS],
    pub layout_entries: Vec<wgpu::BindGroupLayoutEntry>,
    pub layout_hash: u32,
    pub layout: BindGroupLayoutKey,
    pub num_uniforms: u32,
    pub num_samplers: u32,
    pub num_buffers: u32,
    /// Aligned constant block sizes, zero when a stage has none.
    pub vs_gpu_size: u32,
    pub fs_gpu_size: u32,
}

impl Program {
    pub fn create<D: Device>(
        device: &D,
        vs_handle: ShaderHandle,
        vs: &Shader,
        fs: Option<(ShaderHandle, &Shader)>,
    ) -> Result<Self, Error> {
        let is_compute = match vs.stage {
            ShaderStage::Vertex => false,
            ShaderStage::Compute => true,
            ShaderStage::Fragment => return Err(Error::MissingVertexShader),
        };
        let fs = match fs {
            Some((_, shader)) if shader.stage != ShaderStage::Fragment => {
                log::warn!("Second program shader is not a fragment shader, ignoring it");
                None
            }
            Some(_) if is_compute => {
                log::warn!("Compute programs take no fragment shader, ignoring it");
                None
            }
            other => other,
        };
        let fs_shader = fs.map(|(_, shader)| shader);

        let bindings = merge_bindings(vs, fs_shader);
        let mut entries = Vec::new();

        let vs_gpu_size = if vs.size > 0 { vs.gpu_size } else { 0 };
        let fs_gpu_size = fs_shader
            .filter(|shader| shader.size > 0)
            .map_or(0, |shader| shader.gpu_size);
        if vs_gpu_size > 0 {
            entries.push(uniform_entry(VERTEX_UNIFORM_BINDING, vs.stage.visibility()));
        }
        if fs_gpu_size > 0 {
            entries.push(uniform_entry(
                FRAGMENT_UNIFORM_BINDING,
                wgpu::ShaderStages::FRAGMENT,
            ));
        }
        let num_uniforms = entries.len() as u32;

        let mut num_samplers = 0;
        for info in bindings.iter().flatten() {
            if let BindKind::Texture {
                dimension,
                sample_type,
                compare,
            } = info.kind
            {
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: info.binding,
                    visibility: info.visibility,
                    ty: wgpu::BindingType::Texture {
                        sample_type,
                        view_dimension: dimension,
                        multisampled: false,
                    },
                    count: None,
                });
                let sampler = if compare {
                    wgpu::SamplerBindingType::Comparison
                } else if is_filterable(sample_type) {
                    wgpu::SamplerBindingType::Filtering
                } else {
                    wgpu::SamplerBindingType::NonFiltering
                };
                entries.push(wgpu::BindGroupLayoutEntry {
                    binding: info.binding + crate::shader::SAMPLER_SHIFT,
                    visibility: info.visibility,
                    ty: wgpu::BindingType::Sampler(sampler),
                    count: None,
                });
                num_samplers += 1;
            }
        }

        let mut num_buffers = 0;
        for info in bindings.iter().flatten() {
            let ty = match info.kind {
                BindKind::Texture { .. } => continue,
                BindKind::Buffer { read_only } => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindKind::Image {
                    read_only,
                    format,
                    dimension,
                } => wgpu::BindingType::StorageTexture {
                    access: if read_only {
                        wgpu::StorageTextureAccess::ReadOnly
                    } else {
                        wgpu::StorageTextureAccess::WriteOnly
                    },
                    format,
                    view_dimension: dimension,
                },
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: info.binding,
                visibility: info.visibility,
                ty,
                count: None,
            });
            num_buffers += 1;
        }

        debug_assert_eq!(
            (num_uniforms + num_samplers * 2 + num_buffers) as usize,
            entries.len()
        );

        let mut murmur = Murmur2A::new();
        entries.hash(&mut murmur);
        let layout_hash = murmur.end();

        let layout = device.create_bind_group_layout(&BindGroupLayoutDesc {
            label: "program",
            entries: &entries,
        });

        Ok(Self {
            vs: vs_handle,
            fs: fs.map(|(handle, _)| handle),
            vs_hash: vs.hash,
            fs_hash: fs_shader.map_or(0, |shader| shader.hash),
            is_compute,
            bindings,
            layout_entries: entries,
            layout_hash,
            layout,
            num_uniforms,
            num_samplers,
            num_buffers,
            vs_gpu_size,
            fs_gpu_size,
        })
    }

    /// Constant block bytes this program needs per draw.
    pub fn gpu_size(&self) -> u32 {
        self.vs_gpu_size + self.fs_gpu_size
    }

    pub fn destroy(self, queue: &mut CommandQueue) {
        queue.release(Release::BindGroupLayout(self.layout));
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn is_filterable(sample_type: wgpu::TextureSampleType) -> bool {
    matches!(
        sample_type,
        wgpu::TextureSampleType::Float { filterable: true }
    )
}

/// Vertex stage entries win; a slot both stages declare at the same binding
/// becomes visible to both.
fn merge_bindings(
    vs: &Shader,
    fs: Option<&Shader>,
) -> [Option<BindInfo>; MAX_TEXTURE_SAMPLERS] {
    let mut bindings = vs.bindings;
    if let Some(fs) = fs {
        for (slot, fs_info) in bindings.iter_mut().zip(fs.bindings.iter()) {
            match (slot.as_mut(), fs_info) {
                (None, Some(info)) => *slot = Some(*info),
                (Some(vs_info), Some(info)) => {
                    if vs_info.binding == info.binding && vs_info.kind == info.kind {
                        vs_info.visibility |= info.visibility;
                    } else {
                        log::warn!(
                            "Bind slot at binding {} declared differently per stage",
                            info.binding
                        );
                    }
                }
                _ => {}
            }
        }
    }
    bindings
}
