//! Bind group creation and the per-encoder bind group cache.

use std::{collections::HashMap, hash::Hash as _, num::NonZeroU64};

use crate::{
    cache::LruCache,
    command::{CommandQueue, EncoderToken, Release},
    frame::{Binding, RenderBind},
    hash::Murmur2A,
    pool::Pool,
    program::{is_filterable, Program},
    resource::{Buffer, Texture},
    scratch::ScratchWrite,
    shader::{BindKind, FRAGMENT_UNIFORM_BINDING, VERTEX_UNIFORM_BINDING},
    state::SamplerFlags,
    traits::{
        BindGroupDesc, BindGroupEntry, BindGroupKey, BindingResource, Device, SamplerKey,
    },
    IndexBufferHandle, TextureHandle, VertexBufferHandle,
};

/// A bind group usable only with the encoder it was created against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindGroup {
    pub raw: BindGroupKey,
    pub token: EncoderToken,
    pub num_entries: u32,
}

//=============================================================================
// Samplers
//=============================================================================

/// Native samplers keyed by their masked flags.
pub struct SamplerCache {
    samplers: HashMap<u32, SamplerKey>,
    clamp_to_border: bool,
}

impl SamplerCache {
    pub fn new(clamp_to_border: bool) -> Self {
        Self {
            samplers: HashMap::new(),
            clamp_to_border,
        }
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn get<D: Device>(&mut self, device: &D, flags: SamplerFlags) -> SamplerKey {
        let flags = flags.masked();
        if let Some(&sampler) = self.samplers.get(&flags.bits()) {
            return sampler;
        }
        let mut address = flags.address_modes();
        let border = address.contains(&wgpu::AddressMode::ClampToBorder);
        if border && !self.clamp_to_border {
            for mode in address.iter_mut() {
                if *mode == wgpu::AddressMode::ClampToBorder {
                    *mode = wgpu::AddressMode::ClampToEdge;
                }
            }
        }
        let (min_filter, mag_filter, mipmap_filter) = flags.filters();
        let all_linear = min_filter == wgpu::FilterMode::Linear
            && mag_filter == wgpu::FilterMode::Linear
            && mipmap_filter == wgpu::MipmapFilterMode::Linear;
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("sampler"),
            address_mode_u: address[0],
            address_mode_v: address[1],
            address_mode_w: address[2],
            mag_filter,
            min_filter,
            mipmap_filter,
            lod_min_clamp: 0.0,
            lod_max_clamp: 32.0,
            compare: flags.compare(),
            anisotropy_clamp: if flags.is_anisotropic() && all_linear { 8 } else { 1 },
            border_color: if border && self.clamp_to_border {
                Some(wgpu::SamplerBorderColor::TransparentBlack)
            } else {
                None
            },
        });
        self.samplers.insert(flags.bits(), sampler);
        sampler
    }

    pub fn destroy<D: Device>(&mut self, device: &D) {
        for (_, sampler) in self.samplers.drain() {
            device.destroy_sampler(sampler);
        }
    }
}

//=============================================================================
// Entry collection
//=============================================================================

/// Resource pools a bind group resolves handles against.
pub(crate) struct BindResources<'a> {
    pub textures: &'a mut Pool<TextureHandle, Texture>,
    pub vertex_buffers: &'a Pool<VertexBufferHandle, Buffer>,
    pub index_buffers: &'a Pool<IndexBufferHandle, Buffer>,
    pub samplers: &'a mut SamplerCache,
}

/// Resolves the entries of `program`'s layout. Returns `None` and logs when
/// a slot the program declares is unbound or bound to the wrong kind.
pub(crate) fn collect_entries<D: Device>(
    device: &D,
    program: &Program,
    bind: &RenderBind,
    scratch: Option<&ScratchWrite>,
    resources: &mut BindResources<'_>,
) -> Option<Vec<BindGroupEntry>> {
    let mut entries = Vec::with_capacity(program.layout_entries.len());
    if program.num_uniforms > 0 {
        let Some(scratch) = scratch else {
            log::warn!("Program has constants but no scratch space was written");
            return None;
        };
        entries.extend(uniform_entries(program, scratch));
    }

    // Sampled textures first, then storage, matching the layout order.
    for pass in 0..2 {
        for (stage, info) in program.bindings.iter().enumerate() {
            let Some(info) = info else { continue };
            let is_texture = matches!(info.kind, BindKind::Texture { .. });
            if is_texture != (pass == 0) {
                continue;
            }
            let Some(binding) = bind.slots[stage] else {
                log::warn!("Bind slot {} is declared by the program but unbound", stage);
                return None;
            };
            match (info.kind, binding) {
                (
                    BindKind::Texture {
                        dimension,
                        sample_type,
                        compare,
                    },
                    Binding::Texture { texture, sampler },
                ) => {
                    let texture = resolve(resources.textures.get_mut(texture).ok(), stage)?;
                    let mut flags = if sampler.contains(SamplerFlags::INTERNAL_DEFAULT) {
                        texture.config.sampler
                    } else {
                        sampler
                    };
                    if compare && flags.compare().is_none() {
                        flags |= SamplerFlags::COMPARE_LEQUAL;
                    }
                    if !compare {
                        flags &= !SamplerFlags::COMPARE_MASK;
                    }
                    if !compare && !is_filterable(sample_type) {
                        flags = (flags & !(SamplerFlags::MIN_MASK | SamplerFlags::MAG_MASK))
                            | SamplerFlags::POINT;
                    }
                    let view = texture.sampled_view(device, dimension);
                    let sampler = resources.samplers.get(device, flags);
                    entries.push(BindGroupEntry {
                        binding: info.binding,
                        resource: BindingResource::TextureView(view),
                    });
                    entries.push(BindGroupEntry {
                        binding: info.binding + crate::shader::SAMPLER_SHIFT,
                        resource: BindingResource::Sampler(sampler),
                    });
                }
                (BindKind::Image { .. }, Binding::Image { texture, mip, .. }) => {
                    let texture = resolve(resources.textures.get_mut(texture).ok(), stage)?;
                    let view = texture.mip_view(device, mip as u32);
                    entries.push(BindGroupEntry {
                        binding: info.binding,
                        resource: BindingResource::TextureView(view),
                    });
                }
                (BindKind::Image { .. }, Binding::Texture { texture, .. }) => {
                    let texture = resolve(resources.textures.get_mut(texture).ok(), stage)?;
                    let view = texture.mip_view(device, 0);
                    entries.push(BindGroupEntry {
                        binding: info.binding,
                        resource: BindingResource::TextureView(view),
                    });
                }
                (BindKind::Buffer { .. }, Binding::VertexBuffer { buffer, .. }) => {
                    let buffer = resolve(resources.vertex_buffers.try_get(buffer), stage)?;
                    entries.push(storage_entry(info.binding, buffer));
                }
                (BindKind::Buffer { .. }, Binding::IndexBuffer { buffer, .. }) => {
                    let buffer = resolve(resources.index_buffers.try_get(buffer), stage)?;
                    entries.push(storage_entry(info.binding, buffer));
                }
                (kind, binding) => {
                    log::warn!(
                        "Bind slot {} expects {:?} but got {:?}",
                        stage,
                        kind,
                        binding
                    );
                    return None;
                }
            }
        }
    }

    if entries.len() > program.layout_entries.len() {
        log::error!(
            "Bind group has {} entries, layout declares {}",
            entries.len(),
            program.layout_entries.len()
        );
        debug_assert!(false, "bind group entry overrun");
        entries.truncate(program.layout_entries.len());
    }
    Some(entries)
}

/// Constant block entries of `program`, bound to the scratch chunk that
/// holds this draw's data.
pub(crate) fn uniform_entries(program: &Program, scratch: &ScratchWrite) -> Vec<BindGroupEntry> {
    let blocks = [
        (VERTEX_UNIFORM_BINDING, program.vs_gpu_size),
        (FRAGMENT_UNIFORM_BINDING, program.fs_gpu_size),
    ];
    blocks
        .into_iter()
        .filter(|&(_, size)| size > 0)
        .map(|(binding, size)| BindGroupEntry {
            binding,
            resource: BindingResource::Buffer {
                buffer: scratch.buffer,
                offset: 0,
                size: NonZeroU64::new(size as u64),
            },
        })
        .collect()
}

fn resolve<T>(value: Option<T>, stage: usize) -> Option<T> {
    if value.is_none() {
        log::warn!("Bind slot {} refers to a destroyed resource", stage);
    }
    value
}

fn storage_entry(binding: u32, buffer: &Buffer) -> BindGroupEntry {
    BindGroupEntry {
        binding,
        resource: BindingResource::Buffer {
            buffer: buffer.raw,
            offset: 0,
            size: None,
        },
    }
}

/// Dynamic offsets in binding order for the constant blocks of `program`.
pub fn dynamic_offsets(program: &Program, scratch: Option<&ScratchWrite>) -> Vec<u32> {
    let Some(scratch) = scratch else {
        return Vec::new();
    };
    let mut offsets = Vec::with_capacity(2);
    if program.vs_gpu_size > 0 {
        offsets.push(scratch.offsets[0]);
    }
    if program.fs_gpu_size > 0 {
        offsets.push(scratch.offsets[1]);
    }
    offsets
}

//=============================================================================
// Cache
//=============================================================================

/// Small LRU of bind groups, valid for one encoder.
///
/// The key covers the layout and the bound values, including the scratch
/// chunk, but not the dynamic offsets, so back-to-back draws with identical
/// resources share one bind group.
pub struct BindGroupCache {
    lru: LruCache<BindGroup>,
    token: Option<EncoderToken>,
    created: u32,
}

impl BindGroupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            lru: LruCache::new(capacity.max(1)),
            token: None,
            created: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    /// Bind groups created since the last [`Self::reset_stats`].
    pub fn created(&self) -> u32 {
        self.created
    }

    pub fn reset_stats(&mut self) {
        self.created = 0;
    }

    pub fn key(program: &Program, entries: &[BindGroupEntry]) -> u32 {
        let mut murmur = Murmur2A::new();
        murmur.add_u32(program.layout_hash);
        program.layout.hash(&mut murmur);
        entries.hash(&mut murmur);
        murmur.end()
    }

    /// Forgets every cached group when `token` differs from the last one.
    pub fn sync(&mut self, token: EncoderToken, queue: &mut CommandQueue) {
        if self.token == Some(token) {
            return;
        }
        for (_, group) in self.lru.drain() {
            queue.release(Release::BindGroup(group.raw));
        }
        self.token = Some(token);
    }

    pub fn get_or_create<D: Device>(
        &mut self,
        device: &D,
        queue: &mut CommandQueue,
        program: &Program,
        entries: &[BindGroupEntry],
    ) -> BindGroup {
        let token = queue.token();
        self.sync(token, queue);

        let key = Self::key(program, entries);
        if let Some(&group) = self.lru.get(key) {
            return group;
        }
        let raw = device.create_bind_group(&BindGroupDesc {
            label: "bind group",
            layout: program.layout,
            entries,
        });
        self.created += 1;
        let group = BindGroup {
            raw,
            token,
            num_entries: entries.len() as u32,
        };
        if let Some((_, evicted)) = self.lru.insert(key, group) {
            queue.release(Release::BindGroup(evicted.raw));
        }
        group
    }

    pub fn clear(&mut self, queue: &mut CommandQueue) {
        for (_, group) in self.lru.drain() {
            queue.release(Release::BindGroup(group.raw));
        }
        self.token = None;
    }
}
