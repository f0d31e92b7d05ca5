//! Partial-area clears drawn as a full-viewport quad.
//!
//! Load operations can only clear whole attachments. When a view's clear
//! rectangle covers less than its target, the renderer draws this quad under
//! a scissor instead. One program exists per color attachment count.

use crate::{
    bind_group::{dynamic_offsets, uniform_entries, BindGroupCache},
    command::{Command, CommandQueue},
    frame::{Clear, ClearFlags},
    frame_buffer::TargetFormats,
    pipeline::{PipelineCache, RenderPipelineRequest},
    program::Program,
    scratch::ChunkedScratchBuffer,
    shader::{Shader, ShaderBinary, ShaderStage, UniformRegistry},
    state::{State, Stencil, StencilOp, StencilTest},
    traits::Device,
    Error, ShaderHandle, UniformType, MAX_COLOR_ATTACHMENTS, MAX_COLOR_PALETTE,
};

const CLEAR_COLOR: &str = "u_clearColor";
const CLEAR_DEPTH: &str = "u_clearDepth";

const VS_SOURCE: &str = "
struct ClearDepth {
    depth: vec4<f32>,
}
@group(0) @binding(0) var<uniform> u_clearDepth: ClearDepth;

@vertex
fn vs_clear(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32(index & 1u), f32(index >> 1u));
    return vec4<f32>(uv * 2.0 - 1.0, u_clearDepth.depth.x, 1.0);
}
";

fn fragment_source(num_colors: usize) -> String {
    let mut outputs = String::new();
    let mut writes = String::new();
    for index in 0..num_colors {
        outputs += &format!("    @location({index}) color{index}: vec4<f32>,\n");
        writes += &format!("    out.color{index} = u_clearColor.color[{index}];\n");
    }
    format!(
        "
struct ClearColor {{
    color: array<vec4<f32>, {MAX_COLOR_ATTACHMENTS}>,
}}
@group(0) @binding(1) var<uniform> u_clearColor: ClearColor;

struct Output {{
{outputs}}}

@fragment
fn fs_clear() -> Output {{
    var out: Output;
{writes}    return out;
}}
"
    )
}

pub(crate) struct ClearQuad {
    vs: Shader,
    /// Fragment shader per color attachment count, starting at one.
    fs: Vec<Shader>,
    /// Program per color attachment count, starting at zero.
    programs: Vec<Program>,
}

impl ClearQuad {
    pub fn new<D: Device>(device: &D, registry: &mut UniformRegistry) -> Result<Self, Error> {
        registry.create(CLEAR_COLOR, UniformType::Vec4, MAX_COLOR_ATTACHMENTS as u16)?;
        registry.create(CLEAR_DEPTH, UniformType::Vec4, 1)?;

        let vs_blob = ShaderBinary::builder(ShaderStage::Vertex, VS_SOURCE)
            .uniform(CLEAR_DEPTH, UniformType::Vec4, 1, 0)
            .to_bytes();
        let vs = Shader::create(device, &vs_blob, registry, "clear vs")?;

        let mut fs = Vec::with_capacity(MAX_COLOR_ATTACHMENTS);
        for num_colors in 1..=MAX_COLOR_ATTACHMENTS {
            let blob = ShaderBinary::builder(ShaderStage::Fragment, &fragment_source(num_colors))
                .uniform(
                    CLEAR_COLOR,
                    UniformType::Vec4,
                    MAX_COLOR_ATTACHMENTS as u8,
                    0,
                )
                .to_bytes();
            fs.push(Shader::create(device, &blob, registry, "clear fs")?);
        }

        let mut programs = Vec::with_capacity(MAX_COLOR_ATTACHMENTS + 1);
        programs.push(Program::create(device, ShaderHandle::default(), &vs, None)?);
        for shader in fs.iter() {
            programs.push(Program::create(
                device,
                ShaderHandle::default(),
                &vs,
                Some((ShaderHandle::default(), shader)),
            )?);
        }
        Ok(Self { vs, fs, programs })
    }

    pub fn state(flags: ClearFlags) -> (State, Stencil) {
        let mut state = State::PT_TRISTRIP;
        if flags.contains(ClearFlags::COLOR) {
            state |= State::WRITE_RGB | State::WRITE_A;
        }
        if flags.contains(ClearFlags::DEPTH) {
            state |= State::WRITE_Z | State::DEPTH_TEST_ALWAYS;
        }
        let stencil = if flags.contains(ClearFlags::STENCIL) {
            let face = Stencil::face(
                StencilTest::Always,
                0,
                0xff,
                StencilOp::Replace,
                StencilOp::Replace,
                StencilOp::Replace,
            );
            Stencil::new(face, 0)
        } else {
            Stencil::NONE
        };
        (state, stencil)
    }

    /// Records the clear draw into the open render pass. The caller's
    /// viewport and scissor select the cleared area. Returns false when the
    /// clear could not be drawn.
    pub fn draw<D: Device>(
        &self,
        device: &D,
        queue: &mut CommandQueue,
        scratch: &mut ChunkedScratchBuffer,
        pipelines: &mut PipelineCache,
        bind_groups: &mut BindGroupCache,
        targets: &TargetFormats,
        clear: &Clear,
        palette: &[[f32; 4]; MAX_COLOR_PALETTE],
    ) -> bool {
        let num_colors = targets.colors.len().min(MAX_COLOR_ATTACHMENTS);
        let float_targets = targets.colors.iter().all(|format| {
            matches!(
                format.sample_type(None, None),
                Some(wgpu::TextureSampleType::Float { .. })
            )
        });
        if clear.flags.contains(ClearFlags::COLOR) && !float_targets {
            log::warn!("Clear quad cannot write integer color targets");
            return false;
        }

        let program = &self.programs[num_colors];
        let fs = num_colors.checked_sub(1).map(|index| &self.fs[index]);
        let (state, stencil) = Self::state(clear.flags);
        let request = RenderPipelineRequest {
            program,
            vs: &self.vs,
            fs,
            state,
            stencil,
            rgba: 0,
            streams: &[],
            num_instance_data: 0,
            targets,
            wireframe: false,
            index32: false,
        };
        let Some(pipeline) = pipelines.get_render_pipeline(device, queue, &request) else {
            return false;
        };

        let vs_block = bytemuck::cast_slice::<f32, u8>(&[clear.depth, 0.0, 0.0, 0.0]).to_vec();
        let mut colors = [[0.0f32; 4]; MAX_COLOR_ATTACHMENTS];
        for (index, color) in colors.iter_mut().enumerate().take(num_colors) {
            *color = clear.color_of(index, palette);
        }
        let fs_block = if program.fs_gpu_size > 0 {
            bytemuck::cast_slice::<[f32; 4], u8>(&colors).to_vec()
        } else {
            Vec::new()
        };
        let Some(write) = scratch.write(device, &vs_block, &fs_block) else {
            return false;
        };

        let entries = uniform_entries(program, &write);
        let group = bind_groups.get_or_create(device, queue, program, &entries);
        let offsets = dynamic_offsets(program, Some(&write));
        let encoder = queue.encoder();
        encoder.push(Command::SetRenderPipeline(pipeline));
        encoder.set_bind_group(&group, &offsets);
        if stencil.is_enabled() {
            encoder.push(Command::SetStencilReference(clear.stencil as u32));
        }
        encoder.push(Command::Draw {
            vertices: 0..4,
            instances: 0..1,
        });
        true
    }

    pub fn destroy<D: Device>(self, device: &D, queue: &mut CommandQueue) {
        for program in self.programs {
            program.destroy(queue);
        }
        for shader in self.fs {
            shader.destroy(device);
        }
        self.vs.destroy(device);
    }
}
