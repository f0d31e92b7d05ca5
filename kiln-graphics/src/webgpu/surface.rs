//! Surface creation and management for WebGPU backend

use super::*;

fn map_surface_error(error: wgpu::SurfaceError) -> AcquireError {
    match error {
        wgpu::SurfaceError::Timeout => AcquireError::Timeout,
        wgpu::SurfaceError::Outdated => AcquireError::Outdated,
        wgpu::SurfaceError::Lost => AcquireError::Lost,
        wgpu::SurfaceError::OutOfMemory => AcquireError::OutOfMemory,
        #[allow(unreachable_patterns)]
        _ => AcquireError::Other,
    }
}

impl Context {
    /// Create a surface from a window handle.
    ///
    /// On WASM the window handle must refer to a canvas element.
    pub(super) fn create_surface_impl<W>(&self, window: &W) -> Result<SurfaceKey, Error>
    where
        W: raw_window_handle::HasWindowHandle + raw_window_handle::HasDisplayHandle,
    {
        // SAFETY: the caller keeps the window alive until the surface is
        // destroyed.
        let target = unsafe { wgpu::SurfaceTargetUnsafe::from_window(window) }
            .map_err(|e| Error::Device(format!("window handle: {}", e)))?;
        let raw = unsafe { self.instance.create_surface_unsafe(target) }.map_err(|e| {
            log::error!("Failed to create surface: {}", e);
            Error::Device(e.to_string())
        })?;
        Ok(self
            .hub
            .write()
            .unwrap()
            .surfaces
            .insert(SurfaceEntry { raw, current: None }))
    }

    pub(super) fn surface_capabilities_impl(&self, surface: SurfaceKey) -> SurfaceCapabilities {
        let hub = self.hub.read().unwrap();
        match hub.surfaces.get(surface) {
            Some(entry) => {
                let caps = entry.raw.get_capabilities(&self.adapter);
                SurfaceCapabilities {
                    formats: caps.formats,
                    present_modes: caps.present_modes,
                    alpha_modes: caps.alpha_modes,
                }
            }
            None => SurfaceCapabilities {
                formats: Vec::new(),
                present_modes: Vec::new(),
                alpha_modes: Vec::new(),
            },
        }
    }

    pub(super) fn configure_surface_impl(&self, surface: SurfaceKey, config: &SurfaceConfig) {
        let hub = self.hub.read().unwrap();
        let Some(entry) = hub.surfaces.get(surface) else {
            log::warn!("Configuring a destroyed surface");
            return;
        };
        entry.raw.configure(
            &self.device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format: config.format,
                width: config.width.max(1),
                height: config.height.max(1),
                present_mode: config.present_mode,
                desired_maximum_frame_latency: 2,
                alpha_mode: config.alpha_mode,
                view_formats: vec![],
            },
        );
    }

    /// The view is stored in the hub so render passes can look it up by key.
    /// It is removed again when the texture is presented or discarded.
    pub(super) fn acquire_surface_texture_impl(
        &self,
        surface: SurfaceKey,
    ) -> Result<TextureViewKey, AcquireError> {
        self.release_surface_texture(surface, false);
        let mut hub = self.hub.write().unwrap();
        let texture = match hub.surfaces.get(surface) {
            Some(entry) => entry.raw.get_current_texture().map_err(map_surface_error)?,
            None => return Err(AcquireError::Lost),
        };
        let view = texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let view_key = hub.texture_views.insert(view);
        if let Some(entry) = hub.surfaces.get_mut(surface) {
            entry.current = Some((texture, view_key));
        }
        Ok(view_key)
    }

    pub(super) fn release_surface_texture(&self, surface: SurfaceKey, present: bool) {
        let mut hub = self.hub.write().unwrap();
        let Some((texture, view_key)) = hub
            .surfaces
            .get_mut(surface)
            .and_then(|entry| entry.current.take())
        else {
            return;
        };
        hub.texture_views.remove(view_key);
        if present {
            texture.present();
        }
    }
}
