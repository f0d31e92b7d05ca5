//! Shader modules, layouts and pipelines for the WebGPU backend.

use std::borrow::Cow;

use super::*;

/// Runs `f` inside a validation error scope and turns a captured error into
/// [`Error::Device`].
#[cfg(not(target_arch = "wasm32"))]
fn with_error_scope<T, F: FnOnce() -> T>(
    device: &wgpu::Device,
    enabled: bool,
    name: &str,
    f: F,
) -> Result<T, Error> {
    if !enabled {
        return Ok(f());
    }
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let result = f();
    match pollster::block_on(scope.pop()) {
        Some(e) => {
            log::error!("WebGPU '{}' validation error: {}", name, e);
            Err(Error::Device(format!("{}: {}", name, e)))
        }
        None => Ok(result),
    }
}

/// On WASM, skip error scopes entirely to avoid ordering issues.
/// wgpu requires error scopes to be popped in reverse order, but async futures
/// don't guarantee execution order. Use browser DevTools for error debugging.
#[cfg(target_arch = "wasm32")]
fn with_error_scope<T, F: FnOnce() -> T>(
    _device: &wgpu::Device,
    _enabled: bool,
    _name: &str,
    f: F,
) -> Result<T, Error> {
    Ok(f())
}

impl Context {
    pub(super) fn create_shader_module_impl(
        &self,
        desc: &ShaderModuleDesc<'_>,
    ) -> Result<ShaderModuleKey, Error> {
        let raw = with_error_scope(&self.device, self.validation, desc.label, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(desc.label),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(desc.source)),
                })
        })?;
        Ok(self.hub.write().unwrap().shader_modules.insert(raw))
    }

    pub(super) fn create_render_pipeline_impl(
        &self,
        desc: &RenderPipelineDesc<'_>,
    ) -> Result<RenderPipelineKey, Error> {
        let raw = {
            let hub = self.hub.read().unwrap();
            let layout = hub
                .layouts
                .get(desc.layout)
                .ok_or(Error::InvalidHandle("bind group layout"))?;
            let vertex_module = hub
                .shader_modules
                .get(desc.vertex.module)
                .ok_or(Error::InvalidHandle("shader module"))?;
            let fragment_module = match desc.fragment {
                Some(ref fragment) => Some(
                    hub.shader_modules
                        .get(fragment.module)
                        .ok_or(Error::InvalidHandle("shader module"))?,
                ),
                None => None,
            };

            let vertex_buffers = desc
                .vertex_buffers
                .iter()
                .map(|vb| wgpu::VertexBufferLayout {
                    array_stride: vb.array_stride,
                    step_mode: vb.step_mode,
                    attributes: &vb.attributes,
                })
                .collect::<Vec<_>>();

            let fragment = match (desc.fragment.as_ref(), fragment_module) {
                (Some(entry), Some(module)) => Some(wgpu::FragmentState {
                    module,
                    entry_point: Some(entry.entry_point),
                    compilation_options: Default::default(),
                    targets: desc.color_targets,
                }),
                _ => None,
            };

            with_error_scope(&self.device, self.validation, desc.label, || {
                self.device
                    .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                        label: Some(desc.label),
                        layout: Some(&layout.pipeline),
                        vertex: wgpu::VertexState {
                            module: vertex_module,
                            entry_point: Some(desc.vertex.entry_point),
                            compilation_options: Default::default(),
                            buffers: &vertex_buffers,
                        },
                        primitive: desc.primitive,
                        depth_stencil: desc.depth_stencil.clone(),
                        multisample: desc.multisample,
                        fragment,
                        multiview_mask: None,
                        cache: None,
                    })
            })?
        };
        Ok(self.hub.write().unwrap().render_pipelines.insert(raw))
    }

    pub(super) fn create_compute_pipeline_impl(
        &self,
        desc: &ComputePipelineDesc<'_>,
    ) -> Result<ComputePipelineKey, Error> {
        let raw = {
            let hub = self.hub.read().unwrap();
            let layout = hub
                .layouts
                .get(desc.layout)
                .ok_or(Error::InvalidHandle("bind group layout"))?;
            let module = hub
                .shader_modules
                .get(desc.compute.module)
                .ok_or(Error::InvalidHandle("shader module"))?;
            with_error_scope(&self.device, self.validation, desc.label, || {
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(desc.label),
                        layout: Some(&layout.pipeline),
                        module,
                        entry_point: Some(desc.compute.entry_point),
                        compilation_options: Default::default(),
                        cache: None,
                    })
            })?
        };
        Ok(self.hub.write().unwrap().compute_pipelines.insert(raw))
    }
}
