//! Resource creation for the WebGPU backend.

use super::*;

use crate::traits::BindingResource;

impl Context {
    pub(super) fn write_texture_impl(
        &self,
        region: TextureRegion,
        data: &[u8],
        layout: wgpu::TexelCopyBufferLayout,
        size: wgpu::Extent3d,
    ) {
        let hub = self.hub.read().unwrap();
        let Some(texture) = hub.textures.get(region.texture) else {
            log::warn!("Write into a destroyed texture");
            return;
        };
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: region.mip_level,
                origin: region.origin,
                aspect: region.aspect,
            },
            data,
            layout,
            size,
        );
    }

    pub(super) fn create_texture_view_impl(
        &self,
        texture: TextureKey,
        desc: &wgpu::TextureViewDescriptor<'_>,
    ) -> TextureViewKey {
        let mut hub = self.hub.write().unwrap();
        let Some(raw) = hub.textures.get(texture) else {
            log::error!("View of a destroyed texture");
            return TextureViewKey::default();
        };
        let view = raw.create_view(desc);
        hub.texture_views.insert(view)
    }

    pub(super) fn create_bind_group_layout_impl(
        &self,
        desc: &BindGroupLayoutDesc<'_>,
    ) -> BindGroupLayoutKey {
        let group = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: desc.entries,
            });
        let pipeline = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&group],
                immediate_size: 0,
            });
        self.hub
            .write()
            .unwrap()
            .layouts
            .insert(LayoutEntry { group, pipeline })
    }

    pub(super) fn create_bind_group_impl(&self, desc: &BindGroupDesc<'_>) -> BindGroupKey {
        let raw = {
            let hub = self.hub.read().unwrap();
            let Some(layout) = hub.layouts.get(desc.layout) else {
                log::error!("Bind group '{}' uses a destroyed layout", desc.label);
                return BindGroupKey::default();
            };
            let mut entries = Vec::with_capacity(desc.entries.len());
            for entry in desc.entries.iter() {
                let resource = match entry.resource {
                    BindingResource::Buffer {
                        buffer,
                        offset,
                        size,
                    } => hub.buffers.get(buffer).map(|buffer| {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer,
                            offset,
                            size,
                        })
                    }),
                    BindingResource::TextureView(view) => hub
                        .texture_views
                        .get(view)
                        .map(wgpu::BindingResource::TextureView),
                    BindingResource::Sampler(sampler) => hub
                        .samplers
                        .get(sampler)
                        .map(wgpu::BindingResource::Sampler),
                };
                let Some(resource) = resource else {
                    log::error!(
                        "Bind group '{}' binding {} refers to a destroyed object",
                        desc.label,
                        entry.binding
                    );
                    return BindGroupKey::default();
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: entry.binding,
                    resource,
                });
            }
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(desc.label),
                layout: &layout.group,
                entries: &entries,
            })
        };
        self.hub.write().unwrap().bind_groups.insert(raw)
    }
}
