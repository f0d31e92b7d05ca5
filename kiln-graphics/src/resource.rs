//! Buffer and texture wrappers.

use std::collections::HashMap;

use crate::{
    command::{CommandQueue, Release},
    state::SamplerFlags,
    traits::{BufferKey, Device, TextureKey, TextureRegion, TextureViewKey},
    VertexLayoutHandle,
};

//=============================================================================
// Formats
//=============================================================================

/// Texture formats with stable ids, as stored in shader binaries.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum TextureFormat {
    R8Unorm = 0,
    R8Snorm = 1,
    R8Uint = 2,
    R8Sint = 3,
    R16Uint = 4,
    R16Sint = 5,
    R16Float = 6,
    Rg8Unorm = 7,
    R32Uint = 8,
    R32Sint = 9,
    R32Float = 10,
    Rg16Float = 11,
    Rgba8Unorm = 12,
    Rgba8UnormSrgb = 13,
    Bgra8Unorm = 14,
    Bgra8UnormSrgb = 15,
    Rgba8Snorm = 16,
    Rgba8Uint = 17,
    Rgb10a2Unorm = 18,
    Rg11b10Float = 19,
    Rg32Float = 20,
    Rgba16Float = 21,
    Rgba16Uint = 22,
    Rgba32Float = 23,
    Rgba32Uint = 24,
    Depth16Unorm = 25,
    Depth24Plus = 26,
    Depth24PlusStencil8 = 27,
    Depth32Float = 28,
    Depth32FloatStencil8 = 29,
}

impl TextureFormat {
    const ALL: [Self; 30] = [
        Self::R8Unorm,
        Self::R8Snorm,
        Self::R8Uint,
        Self::R8Sint,
        Self::R16Uint,
        Self::R16Sint,
        Self::R16Float,
        Self::Rg8Unorm,
        Self::R32Uint,
        Self::R32Sint,
        Self::R32Float,
        Self::Rg16Float,
        Self::Rgba8Unorm,
        Self::Rgba8UnormSrgb,
        Self::Bgra8Unorm,
        Self::Bgra8UnormSrgb,
        Self::Rgba8Snorm,
        Self::Rgba8Uint,
        Self::Rgb10a2Unorm,
        Self::Rg11b10Float,
        Self::Rg32Float,
        Self::Rgba16Float,
        Self::Rgba16Uint,
        Self::Rgba32Float,
        Self::Rgba32Uint,
        Self::Depth16Unorm,
        Self::Depth24Plus,
        Self::Depth24PlusStencil8,
        Self::Depth32Float,
        Self::Depth32FloatStencil8,
    ];

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn from_wgpu(format: wgpu::TextureFormat) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.to_wgpu() == format)
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        use wgpu::TextureFormat as Tf;
        match self {
            Self::R8Unorm => Tf::R8Unorm,
            Self::R8Snorm => Tf::R8Snorm,
            Self::R8Uint => Tf::R8Uint,
            Self::R8Sint => Tf::R8Sint,
            Self::R16Uint => Tf::R16Uint,
            Self::R16Sint => Tf::R16Sint,
            Self::R16Float => Tf::R16Float,
            Self::Rg8Unorm => Tf::Rg8Unorm,
            Self::R32Uint => Tf::R32Uint,
            Self::R32Sint => Tf::R32Sint,
            Self::R32Float => Tf::R32Float,
            Self::Rg16Float => Tf::Rg16Float,
            Self::Rgba8Unorm => Tf::Rgba8Unorm,
            Self::Rgba8UnormSrgb => Tf::Rgba8UnormSrgb,
            Self::Bgra8Unorm => Tf::Bgra8Unorm,
            Self::Bgra8UnormSrgb => Tf::Bgra8UnormSrgb,
            Self::Rgba8Snorm => Tf::Rgba8Snorm,
            Self::Rgba8Uint => Tf::Rgba8Uint,
            Self::Rgb10a2Unorm => Tf::Rgb10a2Unorm,
            Self::Rg11b10Float => Tf::Rg11b10Ufloat,
            Self::Rg32Float => Tf::Rg32Float,
            Self::Rgba16Float => Tf::Rgba16Float,
            Self::Rgba16Uint => Tf::Rgba16Uint,
            Self::Rgba32Float => Tf::Rgba32Float,
            Self::Rgba32Uint => Tf::Rgba32Uint,
            Self::Depth16Unorm => Tf::Depth16Unorm,
            Self::Depth24Plus => Tf::Depth24Plus,
            Self::Depth24PlusStencil8 => Tf::Depth24PlusStencil8,
            Self::Depth32Float => Tf::Depth32Float,
            Self::Depth32FloatStencil8 => Tf::Depth32FloatStencil8,
        }
    }

    pub fn is_depth(self) -> bool {
        self >= Self::Depth16Unorm
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }

    /// Bytes per texel; depth formats report their copyable size.
    pub fn block_size(self) -> u32 {
        match self {
            Self::R8Unorm | Self::R8Snorm | Self::R8Uint | Self::R8Sint => 1,
            Self::R16Uint | Self::R16Sint | Self::R16Float | Self::Rg8Unorm => 2,
            Self::Depth16Unorm => 2,
            Self::Rg32Float | Self::Rgba16Float | Self::Rgba16Uint => 8,
            Self::Depth32FloatStencil8 => 8,
            Self::Rgba32Float | Self::Rgba32Uint => 16,
            _ => 4,
        }
    }
}

//=============================================================================
// Buffers
//=============================================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct BufferFlags: u16 {
        const COMPUTE_READ = 0x0100;
        const COMPUTE_WRITE = 0x0200;
        const DRAW_INDIRECT = 0x0400;
        const ALLOW_RESIZE = 0x0800;
        const INDEX32 = 0x1000;
        const COMPUTE_READ_WRITE = Self::COMPUTE_READ.bits() | Self::COMPUTE_WRITE.bits();
    }
}

/// A vertex or index buffer.
#[derive(Debug)]
pub struct Buffer {
    pub raw: BufferKey,
    /// Requested size. The native buffer is padded to the copy alignment.
    pub size: u64,
    pub flags: BufferFlags,
    pub dynamic: bool,
    /// Layout of vertex buffers created with one.
    pub layout: Option<VertexLayoutHandle>,
}

impl Buffer {
    pub fn usage(flags: BufferFlags, vertex: bool) -> wgpu::BufferUsages {
        let mut usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
        usage |= if vertex {
            wgpu::BufferUsages::VERTEX
        } else {
            wgpu::BufferUsages::INDEX
        };
        if flags.intersects(BufferFlags::COMPUTE_READ_WRITE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        if flags.contains(BufferFlags::DRAW_INDIRECT) {
            usage |= wgpu::BufferUsages::INDIRECT | wgpu::BufferUsages::STORAGE;
        }
        usage
    }

    pub fn create<D: Device>(
        device: &D,
        label: &str,
        size: u64,
        data: Option<&[u8]>,
        flags: BufferFlags,
        vertex: bool,
        dynamic: bool,
    ) -> Self {
        let raw = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: size.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: Self::usage(flags, vertex),
            mapped_at_creation: false,
        });
        let buffer = Self {
            raw,
            size,
            flags,
            dynamic,
            layout: None,
        };
        if let Some(data) = data {
            buffer.update(device, 0, data);
        }
        buffer
    }

    /// Queues a write at `offset`; data is padded to the copy alignment and
    /// clipped to the buffer.
    pub fn update<D: Device>(&self, device: &D, offset: u64, data: &[u8]) {
        if offset >= self.size || data.is_empty() {
            return;
        }
        let len = (data.len() as u64).min(self.size - offset) as usize;
        if len as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            device.write_buffer(self.raw, offset, &data[..len]);
        } else {
            let mut padded = data[..len].to_vec();
            padded.resize(len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
            device.write_buffer(self.raw, offset, &padded);
        }
    }

    pub fn index_format(&self) -> wgpu::IndexFormat {
        if self.flags.contains(BufferFlags::INDEX32) {
            wgpu::IndexFormat::Uint32
        } else {
            wgpu::IndexFormat::Uint16
        }
    }

    pub fn destroy(self, queue: &mut CommandQueue) {
        queue.release(Release::Buffer(self.raw));
    }
}

//=============================================================================
// Textures
//=============================================================================

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct TextureFlags: u32 {
        /// Usable as a frame buffer attachment.
        const RT = 0x1;
        const RT_MSAA_X2 = 0x2;
        const RT_MSAA_X4 = 0x4;
        const RT_MSAA_X8 = 0x8;
        const RT_MSAA_X16 = 0x10;
        const RT_MSAA_MASK = 0x1e;
        /// Attachment that is never sampled.
        const RT_WRITE_ONLY = 0x20;
        const COMPUTE_WRITE = 0x40;
        const BLIT_DST = 0x80;
        const READ_BACK = 0x100;
    }
}

impl TextureFlags {
    pub fn sample_count(self) -> u32 {
        if self.contains(Self::RT_MSAA_X16) {
            16
        } else if self.contains(Self::RT_MSAA_X8) {
            8
        } else if self.contains(Self::RT_MSAA_X4) {
            4
        } else if self.contains(Self::RT_MSAA_X2) {
            2
        } else {
            1
        }
    }
}

/// Creation parameters of an engine texture.
#[derive(Clone, Debug, PartialEq)]
pub struct TextureConfig {
    pub width: u32,
    pub height: u32,
    /// Depth of 3D textures; 1 otherwise.
    pub depth: u32,
    /// Array layers; cube maps count faces per layer.
    pub num_layers: u32,
    pub cube_map: bool,
    pub num_mips: u32,
    pub format: TextureFormat,
    pub flags: TextureFlags,
    /// Sampler state used when a binding asks for the texture's own.
    pub sampler: SamplerFlags,
}

impl TextureConfig {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            num_layers: 1,
            cube_map: false,
            num_mips: 1,
            format,
            flags: TextureFlags::empty(),
            sampler: SamplerFlags::empty(),
        }
    }

    pub fn render_target(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            flags: TextureFlags::RT,
            ..Self::new_2d(width, height, format)
        }
    }

    fn dimension(&self) -> wgpu::TextureDimension {
        if self.depth > 1 {
            wgpu::TextureDimension::D3
        } else {
            wgpu::TextureDimension::D2
        }
    }

    fn array_layers(&self) -> u32 {
        if self.depth > 1 {
            1
        } else {
            self.num_layers.max(1) * if self.cube_map { 6 } else { 1 }
        }
    }

    /// View dimension of the whole resource.
    pub fn view_dimension(&self) -> wgpu::TextureViewDimension {
        if self.depth > 1 {
            wgpu::TextureViewDimension::D3
        } else if self.cube_map {
            if self.num_layers > 1 {
                wgpu::TextureViewDimension::CubeArray
            } else {
                wgpu::TextureViewDimension::Cube
            }
        } else if self.num_layers > 1 {
            wgpu::TextureViewDimension::D2Array
        } else {
            wgpu::TextureViewDimension::D2
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ViewRequest {
    pub dimension: wgpu::TextureViewDimension,
    pub base_mip: u32,
    pub mip_count: Option<u32>,
    pub base_layer: u32,
    pub layer_count: Option<u32>,
    pub aspect: wgpu::TextureAspect,
}

impl ViewRequest {
    fn label(&self) -> &'static str {
        if self.mip_count == Some(1) {
            "mip view"
        } else {
            "view"
        }
    }
}

#[derive(Debug)]
pub struct Texture {
    pub raw: TextureKey,
    /// Multisampled companion that resolves into `raw`.
    pub msaa: Option<TextureKey>,
    pub config: TextureConfig,
    views: HashMap<ViewRequest, TextureViewKey>,
    msaa_view: Option<TextureViewKey>,
}

impl Texture {
    pub fn create<D: Device>(
        device: &D,
        label: &str,
        config: TextureConfig,
        data: Option<&[u8]>,
    ) -> Self {
        let format = config.format.to_wgpu();
        let samples = config.flags.sample_count();
        let is_rt = config.flags.contains(TextureFlags::RT);

        let mut usage = wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC;
        if !config.flags.contains(TextureFlags::RT_WRITE_ONLY) {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if is_rt {
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        if config.flags.contains(TextureFlags::COMPUTE_WRITE) {
            usage |= wgpu::TextureUsages::STORAGE_BINDING;
        }

        // Multisampled depth is rendered to directly; color resolves.
        let direct_msaa = is_rt && samples > 1 && config.format.is_depth();
        if direct_msaa {
            usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        let size = wgpu::Extent3d {
            width: config.width.max(1),
            height: config.height.max(1),
            depth_or_array_layers: if config.depth > 1 {
                config.depth
            } else {
                config.array_layers()
            },
        };
        let raw = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: config.num_mips.max(1),
            sample_count: if direct_msaa { samples } else { 1 },
            dimension: config.dimension(),
            format,
            usage,
            view_formats: &[],
        });
        let msaa = if is_rt && samples > 1 && !direct_msaa {
            Some(device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    depth_or_array_layers: 1,
                    ..size
                },
                mip_level_count: 1,
                sample_count: samples,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            }))
        } else {
            None
        };

        let texture = Self {
            raw,
            msaa,
            config,
            views: HashMap::new(),
            msaa_view: None,
        };
        if let Some(data) = data {
            texture.update(device, 0, 0, [0; 3], [texture.config.width, texture.config.height, 1], data);
        }
        texture
    }

    pub fn width(&self) -> u32 {
        self.config.width
    }

    pub fn height(&self) -> u32 {
        self.config.height
    }

    pub fn format(&self) -> TextureFormat {
        self.config.format
    }

    pub fn sample_count(&self) -> u32 {
        self.config.flags.sample_count()
    }

    fn aspect(&self) -> wgpu::TextureAspect {
        if self.config.format.is_depth() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        }
    }

    /// Returns a cached view, creating it on first use.
    pub fn view<D: Device>(&mut self, device: &D, request: ViewRequest) -> TextureViewKey {
        if let Some(&view) = self.views.get(&request) {
            return view;
        }
        let view = device.create_texture_view(
            self.raw,
            &wgpu::TextureViewDescriptor {
                label: Some(request.label()),
                dimension: Some(request.dimension),
                aspect: request.aspect,
                base_mip_level: request.base_mip,
                mip_level_count: request.mip_count,
                base_array_layer: request.base_layer,
                array_layer_count: request.layer_count,
                ..Default::default()
            },
        );
        self.views.insert(request, view);
        view
    }

    /// Whole-resource view for sampling.
    pub fn sampled_view<D: Device>(
        &mut self,
        device: &D,
        dimension: wgpu::TextureViewDimension,
    ) -> TextureViewKey {
        let aspect = self.aspect();
        self.view(
            device,
            ViewRequest {
                dimension,
                base_mip: 0,
                mip_count: None,
                base_layer: 0,
                layer_count: None,
                aspect,
            },
        )
    }

    /// Single-mip view for storage access.
    pub fn mip_view<D: Device>(&mut self, device: &D, mip: u32) -> TextureViewKey {
        let mip = mip.min(self.config.num_mips.max(1) - 1);
        let dimension = self.config.view_dimension();
        self.view(
            device,
            ViewRequest {
                dimension,
                base_mip: mip,
                mip_count: Some(1),
                base_layer: 0,
                layer_count: None,
                aspect: wgpu::TextureAspect::All,
            },
        )
    }

    /// View used as a render pass attachment.
    pub fn attachment_view<D: Device>(&mut self, device: &D, mip: u32, layer: u32) -> TextureViewKey {
        self.view(
            device,
            ViewRequest {
                dimension: wgpu::TextureViewDimension::D2,
                base_mip: mip,
                mip_count: Some(1),
                base_layer: layer,
                layer_count: Some(1),
                aspect: wgpu::TextureAspect::All,
            },
        )
    }

    pub fn msaa_view<D: Device>(&mut self, device: &D) -> Option<TextureViewKey> {
        let msaa = self.msaa?;
        if self.msaa_view.is_none() {
            self.msaa_view = Some(device.create_texture_view(
                msaa,
                &wgpu::TextureViewDescriptor {
                    label: Some("msaa view"),
                    ..Default::default()
                },
            ));
        }
        self.msaa_view
    }

    /// Queues a write of a sub-region of `mip`.
    pub fn update<D: Device>(
        &self,
        device: &D,
        mip: u32,
        layer: u32,
        origin: [u32; 3],
        size: [u32; 3],
        data: &[u8],
    ) {
        let bytes_per_row = size[0] * self.config.format.block_size();
        let rows = size[1].max(1);
        let expected = bytes_per_row as usize * rows as usize * size[2].max(1) as usize;
        if data.len() < expected {
            log::warn!(
                "Texture update needs {} bytes, got {}",
                expected,
                data.len()
            );
            return;
        }
        device.write_texture(
            TextureRegion {
                texture: self.raw,
                mip_level: mip,
                origin: wgpu::Origin3d {
                    x: origin[0],
                    y: origin[1],
                    z: origin[2] + layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            &data[..expected],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(rows),
            },
            wgpu::Extent3d {
                width: size[0],
                height: size[1].max(1),
                depth_or_array_layers: size[2].max(1),
            },
        );
    }

    /// Defers destruction of the texture and every view of it.
    pub fn destroy(self, queue: &mut CommandQueue) {
        for (_, view) in self.views {
            queue.release(Release::TextureView(view));
        }
        if let Some(view) = self.msaa_view {
            queue.release(Release::TextureView(view));
        }
        if let Some(msaa) = self.msaa {
            queue.release(Release::Texture(msaa));
        }
        queue.release(Release::Texture(self.raw));
    }
}

/// Row pitch of a texture-to-buffer copy.
pub fn padded_bytes_per_row(width: u32, block_size: u32) -> u32 {
    (width * block_size).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Strips the row padding of a readback.
pub fn unpad_rows(data: &[u8], width: u32, height: u32, block_size: u32) -> Vec<u8> {
    let row = (width * block_size) as usize;
    let pitch = padded_bytes_per_row(width, block_size) as usize;
    let mut out = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * pitch;
        if let Some(slice) = data.get(start..start + row) {
            out.extend_from_slice(slice);
        }
    }
    out
}
