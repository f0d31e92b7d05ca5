//! Frame submission engine over WebGPU.
//!
//! A [`Frame`] describes one frame worth of sorted draw and compute items.
//! [`RendererContext::submit`] translates it into native GPU work through a
//! [`traits::Device`] backend, caching pipelines, samplers and bind groups,
//! staging per-draw uniforms in a chunked scratch ring, and harvesting
//! occlusion/timer query results one frame later.

#![allow(clippy::too_many_arguments, clippy::new_without_default)]

pub mod bind_group;
pub mod cache;
mod clear;
pub mod command;
pub mod frame;
pub mod frame_buffer;
pub mod hash;
pub mod noop;
pub mod pipeline;
mod pool;
pub mod program;
pub mod query;
mod renderer;
pub mod resource;
pub mod ring;
pub mod scratch;
pub mod shader;
pub mod state;
pub mod traits;
pub mod vertex;
pub mod webgpu;

pub use frame::{
    Access, Binding, BlitItem, Clear, ClearColor, ClearFlags, DebugFlags, Dispatch, Frame,
    IndirectBuffer, InstanceData, OcclusionUse, Rect, RenderBind, RenderCompute, RenderDraw,
    RenderItem, ResetFlags, Resolution, ResourceUpdate, SortKey, VertexStream, View, ViewId,
    ViewMode,
};
pub use frame_buffer::Attachment;
pub use renderer::{RendererContext, Stats};
pub use resource::{BufferFlags, TextureConfig, TextureFlags, TextureFormat};
pub use state::{SamplerFlags, State, Stencil};
pub use vertex::{Attrib, AttribType, VertexLayout};

use slotmap::new_key_type;

/// Maximum number of views per frame.
pub const MAX_VIEWS: usize = 256;
/// Maximum number of vertex streams per draw.
pub const MAX_VERTEX_STREAMS: usize = 4;
/// Number of binding slots in a [`RenderBind`].
pub const MAX_TEXTURE_SAMPLERS: usize = 16;
/// Maximum number of color attachments of a frame buffer.
pub const MAX_COLOR_ATTACHMENTS: usize = 8;
/// Upper bound of frames in flight.
pub const MAX_FRAME_LATENCY: usize = 3;
/// Maximum number of `vec4` instance data attributes.
pub const MAX_INSTANCE_DATA: usize = 5;
/// Number of entries in the clear color palette.
pub const MAX_COLOR_PALETTE: usize = 16;
/// Dynamic uniform offsets must be aligned to this many bytes.
pub const MIN_BUFFER_OFFSET_ALIGNMENT: u32 = 256;

new_key_type! {
    /// Handle of a vertex buffer; also used for instance and indirect data.
    pub struct VertexBufferHandle;
    /// Handle of an index buffer.
    pub struct IndexBufferHandle;
    /// Handle of a registered [`VertexLayout`].
    pub struct VertexLayoutHandle;
    pub struct ShaderHandle;
    pub struct ProgramHandle;
    pub struct TextureHandle;
    pub struct FrameBufferHandle;
    /// Handle of a named uniform in the uniform registry.
    pub struct UniformHandle;
    pub struct OcclusionQueryHandle;
}

/// Engine configuration, fixed for the lifetime of a [`RendererContext`].
#[derive(Clone, Debug)]
pub struct ContextDesc {
    /// Number of frames the CPU may run ahead of the GPU.
    pub max_frame_latency: u32,
    /// Size of one scratch chunk, rounded up to 1 MiB.
    pub scratch_chunk_size: u32,
    /// Number of scratch chunks allocated up front.
    pub scratch_chunks: u32,
    pub pipeline_cache_capacity: usize,
    pub bind_group_cache_capacity: usize,
    pub max_occlusion_queries: u32,
    /// Wrap pipeline creation into validation error scopes.
    pub validation: bool,
    /// Enable GPU frame timing.
    pub timing: bool,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            max_frame_latency: MAX_FRAME_LATENCY as u32,
            scratch_chunk_size: 1 << 20,
            scratch_chunks: 2,
            pipeline_cache_capacity: 1024,
            bind_group_cache_capacity: 32,
            max_occlusion_queries: 256,
            validation: cfg!(debug_assertions),
            timing: true,
        }
    }
}

/// Type of a registered uniform.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum UniformType {
    Sampler,
    Vec4,
    Mat3,
    Mat4,
}

impl UniformType {
    /// Size of one element in the constant block, in bytes.
    pub fn size(self) -> u32 {
        match self {
            Self::Sampler => 4,
            Self::Vec4 => 16,
            Self::Mat3 => 48,
            Self::Mat4 => 64,
        }
    }
}

/// Reasons a shader blob cannot be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ShaderParseError {
    #[error("unknown shader magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("shader binary version {0} is not supported")]
    UnsupportedVersion(u8),
    #[error("shader blob is truncated at byte {0}")]
    Truncated(usize),
    #[error("shader code is not valid UTF-8")]
    NotUtf8,
    #[error("storage binding register {0} is out of range")]
    BadRegister(u16),
    #[error("WGSL: {0}")]
    Wgsl(String),
    #[error("shader has no {0} entry point")]
    MissingEntryPoint(&'static str),
}

/// Status of a failed surface texture acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("acquire timed out")]
    Timeout,
    #[error("surface is outdated")]
    Outdated,
    #[error("surface is lost")]
    Lost,
    #[error("out of memory")]
    OutOfMemory,
    #[error("surface error")]
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid shader: {0}")]
    InvalidShader(#[from] ShaderParseError),
    #[error("program requires a vertex or compute shader")]
    MissingVertexShader,
    #[error("{0} pool is exhausted")]
    PoolExhausted(&'static str),
    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),
    #[error("device error: {0}")]
    Device(String),
    #[error("readback failed: {0}")]
    ReadbackFailed(String),
    #[error("surface: {0}")]
    Surface(#[from] AcquireError),
}
