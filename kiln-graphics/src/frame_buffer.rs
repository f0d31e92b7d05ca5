//! Render targets: window swap chains and offscreen attachment sets.
//!
//! Both kinds answer [`FrameBuffer::attachments`] the same way, so the
//! submit loop only distinguishes them when presenting.

use std::hash::Hash as _;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    command::{CommandQueue, Release},
    frame::ResetFlags,
    hash::Murmur2A,
    pool::Pool,
    resource::{Texture, TextureFormat},
    traits::{Device, SurfaceConfig, SurfaceKey, TextureKey, TextureViewKey},
    AcquireError, Error, TextureHandle, MAX_COLOR_ATTACHMENTS,
};

/// Formats and sample count a pipeline must be compatible with.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct TargetFormats {
    pub colors: Vec<wgpu::TextureFormat>,
    pub depth: Option<wgpu::TextureFormat>,
    pub sample_count: u32,
}

/// Hash of the attachment formats and sample count.
pub fn pixel_format_hash(formats: &TargetFormats) -> u32 {
    let mut murmur = Murmur2A::new();
    formats.colors.hash(&mut murmur);
    formats.depth.hash(&mut murmur);
    murmur.add_u32(formats.sample_count);
    murmur.end()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColorTarget {
    pub view: TextureViewKey,
    pub resolve_target: Option<TextureViewKey>,
}

/// Views to render the next pass into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachments {
    pub colors: Vec<ColorTarget>,
    pub depth: Option<TextureViewKey>,
}

//=============================================================================
// Swap chain
//=============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapChainState {
    Uncreated,
    Configured,
    PreReset,
    Unconfigured,
}

/// Picks `requested` if supported, else its RGBA/BGRA counterpart, else
/// the first supported format.
pub fn negotiate_format(
    requested: wgpu::TextureFormat,
    supported: &[wgpu::TextureFormat],
) -> wgpu::TextureFormat {
    use wgpu::TextureFormat as Tf;
    if supported.contains(&requested) {
        return requested;
    }
    let remap = match requested {
        Tf::Rgba8Unorm => Some(Tf::Bgra8Unorm),
        Tf::Bgra8Unorm => Some(Tf::Rgba8Unorm),
        Tf::Rgba8UnormSrgb => Some(Tf::Bgra8UnormSrgb),
        Tf::Bgra8UnormSrgb => Some(Tf::Rgba8UnormSrgb),
        _ => None,
    };
    if let Some(format) = remap.filter(|format| supported.contains(format)) {
        log::warn!("Surface format {:?} unsupported, using {:?}", requested, format);
        return format;
    }
    debug_assert!(
        !supported.is_empty(),
        "surface reports no formats, cannot match {:?}",
        requested
    );
    let fallback = supported.first().copied().unwrap_or(requested);
    log::warn!(
        "Surface format {:?} has no supported remap, falling back to {:?}",
        requested,
        fallback
    );
    fallback
}

struct Companion {
    texture: TextureKey,
    view: TextureViewKey,
}

impl Companion {
    fn create<D: Device>(
        device: &D,
        label: &str,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        sample_count: u32,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = device.create_texture_view(texture, &wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }

    fn release(self, queue: &mut CommandQueue) {
        queue.release(Release::TextureView(self.view));
        queue.release(Release::Texture(self.texture));
    }
}

pub struct SwapChain {
    surface: SurfaceKey,
    state: SwapChainState,
    config: SurfaceConfig,
    requested: wgpu::TextureFormat,
    depth_format: Option<TextureFormat>,
    sample_count: u32,
    current: Option<TextureViewKey>,
    msaa: Option<Companion>,
    depth: Option<Companion>,
    skip_frame: bool,
    num_reconfigures: u32,
}

impl SwapChain {
    pub fn create<D: Device, W: HasWindowHandle + HasDisplayHandle>(
        device: &D,
        window: &W,
        width: u32,
        height: u32,
        format: TextureFormat,
        depth_format: Option<TextureFormat>,
        reset: ResetFlags,
    ) -> Result<Self, Error> {
        let surface = device.create_surface(window)?;
        let caps = device.surface_capabilities(surface);
        let mut requested = format.to_wgpu();
        if reset.contains(ResetFlags::SRGB_BACKBUFFER) {
            requested = requested.add_srgb_suffix();
        }
        let format = negotiate_format(requested, &caps.formats);
        let present_mode = if reset.contains(ResetFlags::VSYNC) {
            wgpu::PresentMode::Fifo
        } else if caps.present_modes.contains(&wgpu::PresentMode::Immediate) {
            wgpu::PresentMode::Immediate
        } else if caps.present_modes.contains(&wgpu::PresentMode::Mailbox) {
            wgpu::PresentMode::Mailbox
        } else {
            wgpu::PresentMode::Fifo
        };
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Opaque);

        let mut swap_chain = Self {
            surface,
            state: SwapChainState::Uncreated,
            config: SurfaceConfig {
                format,
                width: width.max(1),
                height: height.max(1),
                present_mode,
                alpha_mode,
            },
            requested,
            depth_format,
            sample_count: reset.sample_count(),
            current: None,
            msaa: None,
            depth: None,
            skip_frame: false,
            num_reconfigures: 0,
        };
        swap_chain.configure(device);
        swap_chain.acquire(device);
        Ok(swap_chain)
    }

    fn configure<D: Device>(&mut self, device: &D) {
        log::debug!(
            "Configuring surface {}x{} {:?} {:?}",
            self.config.width,
            self.config.height,
            self.config.format,
            self.config.present_mode
        );
        device.configure_surface(self.surface, &self.config);
        if self.sample_count > 1 {
            self.msaa = Some(Companion::create(
                device,
                "swap chain msaa",
                self.config.format,
                self.config.width,
                self.config.height,
                self.sample_count,
            ));
        }
        if let Some(depth) = self.depth_format {
            self.depth = Some(Companion::create(
                device,
                "swap chain depth",
                depth.to_wgpu(),
                self.config.width,
                self.config.height,
                self.sample_count,
            ));
        }
        self.state = SwapChainState::Configured;
    }

    pub fn state(&self) -> SwapChainState {
        self.state
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    pub fn requested_format(&self) -> wgpu::TextureFormat {
        self.requested
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn current_view(&self) -> Option<TextureViewKey> {
        self.current
    }

    /// True once acquisition failed for the rest of this frame.
    pub fn is_skipping(&self) -> bool {
        self.skip_frame
    }

    /// Number of reconfigurations triggered by acquire failures.
    pub fn num_reconfigures(&self) -> u32 {
        self.num_reconfigures
    }

    pub fn formats(&self) -> TargetFormats {
        TargetFormats {
            colors: vec![self.config.format],
            depth: self.depth_format.map(TextureFormat::to_wgpu),
            sample_count: self.sample_count,
        }
    }

    /// Ensures a surface texture is held.
    ///
    /// `Outdated` and `Lost` reconfigure the surface and retry once. Any
    /// other failure, or a failed retry, skips the swap chain until the
    /// next frame.
    pub fn acquire<D: Device>(&mut self, device: &D) -> Option<TextureViewKey> {
        if self.current.is_some() || self.skip_frame {
            return self.current;
        }
        if self.state != SwapChainState::Configured {
            return None;
        }
        let result = match device.acquire_surface_texture(self.surface) {
            Err(error @ (AcquireError::Outdated | AcquireError::Lost)) => {
                log::debug!("Surface {}, reconfiguring", error);
                self.num_reconfigures += 1;
                device.configure_surface(self.surface, &self.config);
                device.acquire_surface_texture(self.surface)
            }
            other => other,
        };
        match result {
            Ok(view) => self.current = Some(view),
            Err(AcquireError::Timeout) => {
                log::warn!("Surface acquire timed out, skipping frame");
                self.skip_frame = true;
            }
            Err(error @ (AcquireError::Outdated | AcquireError::Lost)) => {
                log::warn!("Surface still {} after reconfigure, skipping frame", error);
                self.skip_frame = true;
            }
            Err(error) => {
                log::error!("Surface acquire failed: {}", error);
                self.skip_frame = true;
            }
        }
        self.current
    }

    /// Clears the skip state so the next frame tries again.
    pub fn begin_frame(&mut self) {
        self.skip_frame = false;
    }

    /// Presents the held texture, if any, and eagerly acquires the next.
    /// Returns whether a texture was presented.
    pub fn present<D: Device>(&mut self, device: &D) -> bool {
        let presented = match self.current.take() {
            Some(_) => {
                device.present_surface(self.surface);
                true
            }
            None => false,
        };
        self.skip_frame = false;
        self.acquire(device);
        // A failed eager acquire must not skip the next frame outright.
        self.skip_frame = false;
        presented
    }

    pub fn pre_reset<D: Device>(&mut self, device: &D, queue: &mut CommandQueue) {
        if self.current.take().is_some() {
            device.discard_surface_texture(self.surface);
        }
        if let Some(msaa) = self.msaa.take() {
            msaa.release(queue);
        }
        if let Some(depth) = self.depth.take() {
            depth.release(queue);
        }
        self.state = SwapChainState::PreReset;
    }

    pub fn post_reset<D: Device>(&mut self, device: &D, width: u32, height: u32, reset: ResetFlags) {
        debug_assert_eq!(self.state, SwapChainState::PreReset);
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.config.present_mode = if reset.contains(ResetFlags::VSYNC) {
            wgpu::PresentMode::Fifo
        } else {
            self.config.present_mode
        };
        self.sample_count = reset.sample_count();
        self.skip_frame = false;
        self.configure(device);
        self.acquire(device);
    }

    pub fn destroy<D: Device>(mut self, device: &D, queue: &mut CommandQueue) {
        self.pre_reset(device, queue);
        device.destroy_surface(self.surface);
        self.state = SwapChainState::Unconfigured;
    }

    fn attachments<D: Device>(&mut self, device: &D) -> Option<Attachments> {
        let view = self.acquire(device)?;
        let color = match self.msaa {
            Some(ref msaa) => ColorTarget {
                view: msaa.view,
                resolve_target: Some(view),
            },
            None => ColorTarget {
                view,
                resolve_target: None,
            },
        };
        Some(Attachments {
            colors: vec![color],
            depth: self.depth.as_ref().map(|depth| depth.view),
        })
    }
}

//=============================================================================
// Frame buffer
//=============================================================================

/// One texture attachment of an offscreen frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub texture: TextureHandle,
    pub mip: u16,
    pub layer: u16,
}

impl Attachment {
    pub fn new(texture: TextureHandle) -> Self {
        Self {
            texture,
            mip: 0,
            layer: 0,
        }
    }
}

pub enum FrameBufferKind {
    Window(SwapChain),
    Offscreen {
        attachments: Vec<Attachment>,
        resolved: Attachments,
    },
}

pub struct FrameBuffer {
    pub kind: FrameBufferKind,
    pub width: u32,
    pub height: u32,
    pub formats: TargetFormats,
    pub format_hash: u32,
    /// Number of pre-reset / post-reset cycles run on this frame buffer.
    pub num_resets: u32,
}

impl FrameBuffer {
    pub fn from_attachments<D: Device>(
        device: &D,
        textures: &mut Pool<TextureHandle, Texture>,
        attachments: &[Attachment],
    ) -> Result<Self, Error> {
        let mut colors = Vec::new();
        let mut color_formats = Vec::new();
        let mut depth = None;
        let mut depth_format = None;
        let mut size = None;
        let mut sample_count = 1;

        for attachment in attachments.iter() {
            let texture = textures.get_mut(attachment.texture)?;
            let mip = attachment.mip as u32;
            let width = (texture.width() >> mip).max(1);
            let height = (texture.height() >> mip).max(1);
            size.get_or_insert((width, height));
            sample_count = texture.sample_count();

            let view = texture.attachment_view(device, mip, attachment.layer as u32);
            if texture.format().is_depth() {
                if depth.is_some() {
                    log::warn!("Frame buffer has more than one depth attachment");
                }
                depth = Some(view);
                depth_format = Some(texture.format().to_wgpu());
            } else if colors.len() < MAX_COLOR_ATTACHMENTS {
                let color = match texture.msaa_view(device) {
                    Some(msaa) => ColorTarget {
                        view: msaa,
                        resolve_target: Some(view),
                    },
                    None => ColorTarget {
                        view,
                        resolve_target: None,
                    },
                };
                colors.push(color);
                color_formats.push(texture.format().to_wgpu());
            }
        }

        let (width, height) = size.ok_or(Error::InvalidHandle("frame buffer attachment"))?;
        let formats = TargetFormats {
            colors: color_formats,
            depth: depth_format,
            sample_count,
        };
        Ok(Self {
            kind: FrameBufferKind::Offscreen {
                attachments: attachments.to_vec(),
                resolved: Attachments { colors, depth },
            },
            width,
            height,
            format_hash: pixel_format_hash(&formats),
            formats,
            num_resets: 0,
        })
    }

    pub fn from_swap_chain(swap_chain: SwapChain) -> Self {
        let formats = swap_chain.formats();
        Self {
            width: swap_chain.width(),
            height: swap_chain.height(),
            format_hash: pixel_format_hash(&formats),
            formats,
            kind: FrameBufferKind::Window(swap_chain),
            num_resets: 0,
        }
    }

    pub fn swap_chain(&self) -> Option<&SwapChain> {
        match self.kind {
            FrameBufferKind::Window(ref swap_chain) => Some(swap_chain),
            FrameBufferKind::Offscreen { .. } => None,
        }
    }

    pub fn swap_chain_mut(&mut self) -> Option<&mut SwapChain> {
        match self.kind {
            FrameBufferKind::Window(ref mut swap_chain) => Some(swap_chain),
            FrameBufferKind::Offscreen { .. } => None,
        }
    }

    /// False when an attachment texture has been destroyed.
    pub fn is_valid(&self, textures: &Pool<TextureHandle, Texture>) -> bool {
        match self.kind {
            FrameBufferKind::Window(ref swap_chain) => {
                swap_chain.state() == SwapChainState::Configured
            }
            FrameBufferKind::Offscreen {
                ref attachments, ..
            } => attachments.iter().all(|a| textures.contains(a.texture)),
        }
    }

    /// Current attachment views, or `None` when the target is unavailable
    /// this frame.
    pub fn attachments<D: Device>(&mut self, device: &D) -> Option<Attachments> {
        match self.kind {
            FrameBufferKind::Window(ref mut swap_chain) => swap_chain.attachments(device),
            FrameBufferKind::Offscreen { ref resolved, .. } => Some(resolved.clone()),
        }
    }

    /// Runs the pre-reset / post-reset cycle of a window frame buffer.
    pub fn resize<D: Device>(
        &mut self,
        device: &D,
        queue: &mut CommandQueue,
        width: u32,
        height: u32,
        reset: ResetFlags,
    ) {
        if let FrameBufferKind::Window(ref mut swap_chain) = self.kind {
            swap_chain.pre_reset(device, queue);
            swap_chain.post_reset(device, width, height, reset);
            self.width = swap_chain.width();
            self.height = swap_chain.height();
            self.formats = swap_chain.formats();
            self.format_hash = pixel_format_hash(&self.formats);
            self.num_resets += 1;
        } else {
            log::warn!("Offscreen frame buffers follow their textures, resize ignored");
        }
    }

    pub fn destroy<D: Device>(self, device: &D, queue: &mut CommandQueue) {
        if let FrameBufferKind::Window(swap_chain) = self.kind {
            swap_chain.destroy(device, queue);
        }
    }
}
