//! Command replay for WebGPU backend
//!
//! Recorded commands are replayed into a native encoder at submit time,
//! resolving hub keys under a single read lock.

use super::*;

use crate::command::RenderPassDesc;

enum Pass {
    None,
    Render(wgpu::RenderPass<'static>),
    Compute(wgpu::ComputePass<'static>),
    /// The pass refers to destroyed objects, its commands are dropped.
    Skip,
}

fn texel_copy<'a>(hub: &'a Hub, region: &TextureRegion) -> Option<wgpu::TexelCopyTextureInfo<'a>> {
    hub.textures
        .get(region.texture)
        .map(|texture| wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: region.mip_level,
            origin: region.origin,
            aspect: region.aspect,
        })
}

fn begin_render_pass(
    hub: &Hub,
    encoder: &mut wgpu::CommandEncoder,
    desc: &RenderPassDesc,
) -> Pass {
    let mut colors = Vec::with_capacity(desc.colors.len());
    for color in desc.colors.iter() {
        let Some(view) = hub.texture_views.get(color.view) else {
            log::warn!("Render pass '{}' targets a destroyed view", desc.label);
            return Pass::Skip;
        };
        let resolve_target = color
            .resolve_target
            .and_then(|key| hub.texture_views.get(key));
        colors.push(Some(wgpu::RenderPassColorAttachment {
            view,
            depth_slice: None,
            resolve_target,
            ops: color.ops,
        }));
    }
    let depth_stencil_attachment = match desc.depth_stencil {
        Some(ref ds) => match hub.texture_views.get(ds.view) {
            Some(view) => Some(wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: ds.depth_ops,
                stencil_ops: ds.stencil_ops,
            }),
            None => {
                log::warn!("Render pass '{}' has a destroyed depth view", desc.label);
                return Pass::Skip;
            }
        },
        None => None,
    };
    let occlusion_query_set = desc
        .occlusion_query_set
        .and_then(|key| hub.query_sets.get(key));

    let pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(&desc.label),
        color_attachments: &colors,
        depth_stencil_attachment,
        occlusion_query_set,
        ..Default::default()
    });
    Pass::Render(pass.forget_lifetime())
}

impl Context {
    pub(super) fn replay(&self, hub: &Hub, commands: &[Command]) -> wgpu::CommandBuffer {
        profiling::scope!("replay");
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kiln frame"),
            });
        let mut pass = Pass::None;

        for command in commands {
            match *command {
                Command::BeginRenderPass(ref desc) => {
                    // An unterminated pass must end before the encoder is reused.
                    drop(std::mem::replace(&mut pass, Pass::None));
                    pass = begin_render_pass(hub, &mut encoder, desc);
                }
                Command::BeginComputePass { ref label } => {
                    drop(std::mem::replace(&mut pass, Pass::None));
                    let raw = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(label),
                        timestamp_writes: None,
                    });
                    pass = Pass::Compute(raw.forget_lifetime());
                }
                Command::EndRenderPass | Command::EndComputePass => {
                    pass = Pass::None;
                }
                Command::PushDebugGroup(ref name) => match pass {
                    Pass::Render(ref mut rp) => rp.push_debug_group(name),
                    Pass::Compute(ref mut cp) => cp.push_debug_group(name),
                    Pass::None => encoder.push_debug_group(name),
                    Pass::Skip => {}
                },
                Command::PopDebugGroup => match pass {
                    Pass::Render(ref mut rp) => rp.pop_debug_group(),
                    Pass::Compute(ref mut cp) => cp.pop_debug_group(),
                    Pass::None => encoder.pop_debug_group(),
                    Pass::Skip => {}
                },
                Command::ResolveQuerySet {
                    set,
                    ref queries,
                    destination,
                    offset,
                } => {
                    if let (Some(set), Some(dst)) =
                        (hub.query_sets.get(set), hub.buffers.get(destination))
                    {
                        encoder.resolve_query_set(set, queries.clone(), dst, offset);
                    }
                }
                Command::WriteTimestamp { set, index } => {
                    if let Some(set) = hub.query_sets.get(set) {
                        encoder.write_timestamp(set, index);
                    }
                }
                Command::CopyBufferToBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    if let (Some(src), Some(dst)) = (hub.buffers.get(src), hub.buffers.get(dst)) {
                        encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
                    }
                }
                Command::CopyTextureToTexture {
                    ref src,
                    ref dst,
                    size,
                } => {
                    if let (Some(src), Some(dst)) = (texel_copy(hub, src), texel_copy(hub, dst)) {
                        encoder.copy_texture_to_texture(src, dst, size);
                    }
                }
                Command::CopyTextureToBuffer {
                    ref src,
                    dst,
                    layout,
                    size,
                } => {
                    if let (Some(src), Some(buffer)) = (texel_copy(hub, src), hub.buffers.get(dst))
                    {
                        encoder.copy_texture_to_buffer(
                            src,
                            wgpu::TexelCopyBufferInfo { buffer, layout },
                            size,
                        );
                    }
                }
                _ => match pass {
                    Pass::Render(ref mut rp) => replay_render(hub, rp, command),
                    Pass::Compute(ref mut cp) => replay_compute(hub, cp, command),
                    Pass::Skip => {}
                    Pass::None => log::warn!("Pass command outside of a pass: {:?}", command),
                },
            }
        }
        drop(pass);
        encoder.finish()
    }
}

fn replay_render(hub: &Hub, pass: &mut wgpu::RenderPass<'static>, command: &Command) {
    match *command {
        Command::SetRenderPipeline(key) => {
            if let Some(pipeline) = hub.render_pipelines.get(key) {
                pass.set_pipeline(pipeline);
            }
        }
        Command::SetBindGroup {
            group,
            ref dynamic_offsets,
        } => {
            if let Some(group) = hub.bind_groups.get(group) {
                pass.set_bind_group(0, group, dynamic_offsets);
            }
        }
        Command::SetVertexBuffer {
            slot,
            buffer,
            offset,
        } => {
            if let Some(buffer) = hub.buffers.get(buffer) {
                pass.set_vertex_buffer(slot, buffer.slice(offset..));
            }
        }
        Command::SetIndexBuffer {
            buffer,
            format,
            offset,
        } => {
            if let Some(buffer) = hub.buffers.get(buffer) {
                pass.set_index_buffer(buffer.slice(offset..), format);
            }
        }
        Command::SetViewport { rect, ref depth } => {
            pass.set_viewport(rect[0], rect[1], rect[2], rect[3], depth.start, depth.end);
        }
        Command::SetScissor {
            x,
            y,
            width,
            height,
        } => pass.set_scissor_rect(x, y, width, height),
        Command::SetStencilReference(reference) => pass.set_stencil_reference(reference),
        Command::SetBlendConstant(color) => pass.set_blend_constant(color),
        Command::Draw {
            ref vertices,
            ref instances,
        } => pass.draw(vertices.clone(), instances.clone()),
        Command::DrawIndexed {
            ref indices,
            base_vertex,
            ref instances,
        } => pass.draw_indexed(indices.clone(), base_vertex, instances.clone()),
        Command::DrawIndirect { buffer, offset } => {
            if let Some(buffer) = hub.buffers.get(buffer) {
                pass.draw_indirect(buffer, offset);
            }
        }
        Command::DrawIndexedIndirect { buffer, offset } => {
            if let Some(buffer) = hub.buffers.get(buffer) {
                pass.draw_indexed_indirect(buffer, offset);
            }
        }
        Command::BeginOcclusionQuery(index) => pass.begin_occlusion_query(index),
        Command::EndOcclusionQuery => pass.end_occlusion_query(),
        _ => log::warn!("Command not valid in a render pass: {:?}", command),
    }
}

fn replay_compute(hub: &Hub, pass: &mut wgpu::ComputePass<'static>, command: &Command) {
    match *command {
        Command::SetComputePipeline(key) => {
            if let Some(pipeline) = hub.compute_pipelines.get(key) {
                pass.set_pipeline(pipeline);
            }
        }
        Command::SetBindGroup {
            group,
            ref dynamic_offsets,
        } => {
            if let Some(group) = hub.bind_groups.get(group) {
                pass.set_bind_group(0, group, dynamic_offsets);
            }
        }
        Command::Dispatch([x, y, z]) => pass.dispatch_workgroups(x, y, z),
        Command::DispatchIndirect { buffer, offset } => {
            if let Some(buffer) = hub.buffers.get(buffer) {
                pass.dispatch_workgroups_indirect(buffer, offset);
            }
        }
        _ => log::warn!("Command not valid in a compute pass: {:?}", command),
    }
}
