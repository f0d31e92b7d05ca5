//! Pipeline and bind group caching.

mod common;

use kiln_graphics::{
    command::CommandQueue,
    frame_buffer::TargetFormats,
    noop,
    pipeline::{PipelineCache, RenderPipelineRequest},
    program::Program,
    shader::{Shader, UniformRegistry},
    state::{StencilOp, StencilTest},
    DebugFlags, Frame, RenderBind, RenderDraw, ShaderHandle, State, Stencil, VertexStream,
};

struct Fixture {
    device: noop::Context,
    vs: Shader,
    fs: Shader,
    program: Program,
    layout: kiln_graphics::VertexLayout,
}

fn fixture() -> Fixture {
    common::init_logger();
    let device = noop::Context::default();
    let registry = UniformRegistry::new(8);
    let vs = Shader::create(&device, &common::vs_position_blob(), &registry, "vs")
        .expect("Failed to create vertex shader");
    let fs = Shader::create(&device, &common::fs_solid_blob(), &registry, "fs")
        .expect("Failed to create fragment shader");
    let program = Program::create(
        &device,
        ShaderHandle::default(),
        &vs,
        Some((ShaderHandle::default(), &fs)),
    )
    .expect("Failed to create program");
    Fixture {
        device,
        vs,
        fs,
        program,
        layout: common::position_layout(),
    }
}

fn rgba8_targets() -> TargetFormats {
    TargetFormats {
        colors: vec![wgpu::TextureFormat::Rgba8Unorm],
        depth: None,
        sample_count: 1,
    }
}

impl Fixture {
    fn request<'a>(
        &'a self,
        streams: &'a [&'a kiln_graphics::VertexLayout],
        targets: &'a TargetFormats,
        state: State,
        stencil: Stencil,
    ) -> RenderPipelineRequest<'a> {
        RenderPipelineRequest {
            program: &self.program,
            vs: &self.vs,
            fs: Some(&self.fs),
            state,
            stencil,
            rgba: 0,
            streams,
            num_instance_data: 0,
            targets,
            wireframe: false,
            index32: false,
        }
    }
}

/// Identical requests share a pipeline, incompatible ones do not
#[test]
fn test_pipeline_cache_keys() {
    let fixture = fixture();
    let mut queue = CommandQueue::new(2);
    let mut cache = PipelineCache::new(16);
    let streams = [&fixture.layout];
    let targets = rgba8_targets();

    let base = fixture.request(&streams, &targets, State::DEFAULT, Stencil::NONE);
    let first = cache
        .get_render_pipeline(&fixture.device, &mut queue, &base)
        .expect("Failed to create pipeline");
    let again = cache
        .get_render_pipeline(&fixture.device, &mut queue, &base)
        .expect("Failed to fetch pipeline");
    assert_eq!(first, again);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 1);

    let blended = fixture.request(
        &streams,
        &targets,
        State::DEFAULT | State::BLEND_ALPHA,
        Stencil::NONE,
    );
    assert_ne!(base.key(), blended.key());

    let bgra = TargetFormats {
        colors: vec![wgpu::TextureFormat::Bgra8Unorm],
        ..rgba8_targets()
    };
    assert_ne!(
        base.key(),
        fixture
            .request(&streams, &bgra, State::DEFAULT, Stencil::NONE)
            .key()
    );
    let msaa = TargetFormats {
        sample_count: 4,
        ..rgba8_targets()
    };
    assert_ne!(
        base.key(),
        fixture
            .request(&streams, &msaa, State::DEFAULT, Stencil::NONE)
            .key()
    );
}

/// Programs with matching shaders but different layouts get distinct pipelines
#[test]
fn test_pipeline_key_covers_layout() {
    let mut fixture = fixture();
    let streams = [&fixture.layout];
    let targets = rgba8_targets();
    let before = fixture
        .request(&streams, &targets, State::DEFAULT, Stencil::NONE)
        .key();

    fixture.program.layout_hash ^= 1;
    let streams = [&fixture.layout];
    let after = fixture
        .request(&streams, &targets, State::DEFAULT, Stencil::NONE)
        .key();
    assert_ne!(before, after);
}

/// The stencil reference is dynamic state and stays out of the key
#[test]
fn test_pipeline_key_ignores_stencil_reference() {
    let fixture = fixture();
    let streams = [&fixture.layout];
    let targets = rgba8_targets();
    let face = |reference| {
        Stencil::face(
            StencilTest::Equal,
            reference,
            0xff,
            StencilOp::Keep,
            StencilOp::Keep,
            StencilOp::Replace,
        )
    };

    let one = fixture.request(&streams, &targets, State::DEFAULT, Stencil::new(face(1), 0));
    let two = fixture.request(&streams, &targets, State::DEFAULT, Stencil::new(face(2), 0));
    let other_test = Stencil::new(
        Stencil::face(
            StencilTest::Less,
            1,
            0xff,
            StencilOp::Keep,
            StencilOp::Keep,
            StencilOp::Replace,
        ),
        0,
    );
    assert_eq!(one.key(), two.key());
    assert_ne!(
        one.key(),
        fixture
            .request(&streams, &targets, State::DEFAULT, other_test)
            .key()
    );
}

/// Invalidation releases every cached pipeline
#[test]
fn test_pipeline_cache_invalidate() {
    let fixture = fixture();
    let mut queue = CommandQueue::new(2);
    let mut cache = PipelineCache::new(16);
    let streams = [&fixture.layout];
    let targets = rgba8_targets();
    for state in [State::DEFAULT, State::DEFAULT | State::BLEND_ADD] {
        let request = fixture.request(&streams, &targets, state, Stencil::NONE);
        cache.get_render_pipeline(&fixture.device, &mut queue, &request);
    }
    assert_eq!(cache.len(), 2);

    cache.invalidate(&mut queue);
    assert_eq!(cache.len(), 0);
    queue.finish(&fixture.device);
    assert_eq!(fixture.device.num_live(noop::ObjectKind::RenderPipeline), 0);
}

/// A full cache evicts its least recently used pipeline
#[test]
fn test_pipeline_cache_evicts() {
    let fixture = fixture();
    let mut queue = CommandQueue::new(2);
    let mut cache = PipelineCache::new(2);
    let streams = [&fixture.layout];
    let targets = rgba8_targets();
    for state in [
        State::DEFAULT,
        State::DEFAULT | State::BLEND_ADD,
        State::DEFAULT | State::BLEND_ALPHA,
    ] {
        let request = fixture.request(&streams, &targets, state, Stencil::NONE);
        cache.get_render_pipeline(&fixture.device, &mut queue, &request);
    }
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.stats().evictions, 1);
}

fn triangle_frame(
    renderer: &mut kiln_graphics::RendererContext<noop::Context>,
) -> (Frame, kiln_graphics::FrameBufferHandle) {
    let program = common::solid_program(renderer);
    let buffer = common::triangle_buffer(renderer);
    let (frame_buffer, _) = common::offscreen(renderer, 4, 4);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    let mut draw = RenderDraw::new(program);
    draw.state = State::WRITE_RGB | State::WRITE_A;
    draw.streams[0] = Some(VertexStream::new(buffer));
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    (frame, frame_buffer)
}

/// Pipelines persist across frames while bind groups are rebuilt
#[test]
fn test_caches_across_frames() {
    let mut renderer = common::renderer();
    let (frame, _) = triangle_frame(&mut renderer);

    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.misses, 1);
    assert_eq!(renderer.stats().num_bind_groups_created, 1);

    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.misses, 0);
    assert_eq!(renderer.stats().pipelines.hits, 1);
    assert_eq!(renderer.stats().num_bind_groups_created, 1);
}

/// Toggling wireframe drops the cached pipelines
#[test]
fn test_wireframe_toggle_invalidates() {
    let mut renderer = common::renderer();
    let (mut frame, _) = triangle_frame(&mut renderer);

    renderer.submit(&frame);
    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.hits, 1);

    frame.debug = DebugFlags::WIREFRAME;
    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.misses, 1);
    assert_eq!(renderer.stats().pipelines.hits, 0);

    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.hits, 1);
}
