//! Helpers shared by the integration tests.

#![allow(dead_code)]

use kiln_graphics::{
    noop,
    shader::{ShaderBinary, ShaderStage, TextureComponent},
    traits::Device,
    Attachment, Attrib, AttribType, BufferFlags, ContextDesc, FrameBufferHandle, ProgramHandle,
    RendererContext, TextureConfig, TextureFormat, TextureHandle, UniformType,
    VertexBufferHandle, VertexLayout,
};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, RawWindowHandle,
    WebWindowHandle, WindowHandle,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Window that only exists as a handle; the noop device never reads it.
pub struct TestWindow;

impl HasWindowHandle for TestWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        let raw = RawWindowHandle::Web(WebWindowHandle::new(1));
        // SAFETY: the handle is never dereferenced.
        Ok(unsafe { WindowHandle::borrow_raw(raw) })
    }
}

impl HasDisplayHandle for TestWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Ok(DisplayHandle::web())
    }
}

pub const VS_POSITION: &str = "
struct Uniforms {
    mvp: mat4x4<f32>,
}
@group(0) @binding(0) var<uniform> u: Uniforms;

@vertex
fn vs_main(@location(0) pos: vec3<f32>) -> @builtin(position) vec4<f32> {
    return u.mvp * vec4<f32>(pos, 1.0);
}
";

pub const FS_SOLID: &str = "
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
";

pub const FS_TEXTURED: &str = "
@group(0) @binding(2) var t_color: texture_2d<f32>;
@group(0) @binding(18) var s_color: sampler;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return textureSample(t_color, s_color, vec2<f32>(0.5, 0.5));
}
";

pub const CS_FILL: &str = "
@group(0) @binding(2) var<storage, read_write> values: array<u32>;

@compute @workgroup_size(64)
fn cs_main(@builtin(global_invocation_id) id: vec3<u32>) {
    values[id.x] = id.x;
}
";

pub fn vs_position_blob() -> Vec<u8> {
    ShaderBinary::builder(ShaderStage::Vertex, VS_POSITION)
        .hashes(0x1234, 0x5678)
        .uniform("u_modelViewProj", UniformType::Mat4, 1, 0)
        .attribute(Attrib::Position)
        .to_bytes()
}

pub fn fs_solid_blob() -> Vec<u8> {
    ShaderBinary::builder(ShaderStage::Fragment, FS_SOLID)
        .hashes(0x5678, 0)
        .to_bytes()
}

pub fn fs_textured_blob() -> Vec<u8> {
    ShaderBinary::builder(ShaderStage::Fragment, FS_TEXTURED)
        .hashes(0x5678, 0)
        .sampler(
            "s_color",
            0,
            wgpu::TextureViewDimension::D2,
            TextureComponent::Float,
            false,
        )
        .to_bytes()
}

pub fn cs_fill_blob() -> Vec<u8> {
    ShaderBinary::builder(ShaderStage::Compute, CS_FILL)
        .storage_buffer("values", 0, false)
        .to_bytes()
}

pub fn renderer() -> RendererContext<noop::Context> {
    init_logger();
    RendererContext::new(noop::Context::default(), ContextDesc::default())
        .expect("Failed to create renderer")
}

pub fn position_layout() -> VertexLayout {
    VertexLayout::builder()
        .add(Attrib::Position, 3, AttribType::Float)
        .end()
}

/// A triangle that covers the whole viewport.
pub const FULLSCREEN_TRIANGLE: [[f32; 3]; 3] =
    [[-1.0, -1.0, 0.0], [3.0, -1.0, 0.0], [-1.0, 3.0, 0.0]];

pub fn triangle_buffer<D: Device>(renderer: &mut RendererContext<D>) -> VertexBufferHandle {
    let layout = renderer
        .create_vertex_layout(position_layout())
        .expect("Failed to create vertex layout");
    renderer
        .create_vertex_buffer(
            bytemuck::cast_slice(&FULLSCREEN_TRIANGLE),
            layout,
            BufferFlags::empty(),
        )
        .expect("Failed to create vertex buffer")
}

pub fn solid_program<D: Device>(renderer: &mut RendererContext<D>) -> ProgramHandle {
    let vs = renderer
        .create_shader(&vs_position_blob(), "vs_position")
        .expect("Failed to create vertex shader");
    let fs = renderer
        .create_shader(&fs_solid_blob(), "fs_solid")
        .expect("Failed to create fragment shader");
    renderer
        .create_program(vs, Some(fs))
        .expect("Failed to create program")
}

pub fn textured_program<D: Device>(renderer: &mut RendererContext<D>) -> ProgramHandle {
    let vs = renderer
        .create_shader(&vs_position_blob(), "vs_position")
        .expect("Failed to create vertex shader");
    let fs = renderer
        .create_shader(&fs_textured_blob(), "fs_textured")
        .expect("Failed to create fragment shader");
    renderer
        .create_program(vs, Some(fs))
        .expect("Failed to create program")
}

pub fn compute_program<D: Device>(renderer: &mut RendererContext<D>) -> ProgramHandle {
    let cs = renderer
        .create_shader(&cs_fill_blob(), "cs_fill")
        .expect("Failed to create compute shader");
    renderer
        .create_compute_program(cs)
        .expect("Failed to create compute program")
}

/// Offscreen RGBA8 frame buffer with its color texture.
pub fn offscreen<D: Device>(
    renderer: &mut RendererContext<D>,
    width: u32,
    height: u32,
) -> (FrameBufferHandle, TextureHandle) {
    let texture = renderer
        .create_texture(
            TextureConfig::render_target(width, height, TextureFormat::Rgba8Unorm),
            None,
        )
        .expect("Failed to create render target");
    let frame_buffer = renderer
        .create_frame_buffer(&[Attachment::new(texture)])
        .expect("Failed to create frame buffer");
    (frame_buffer, texture)
}
