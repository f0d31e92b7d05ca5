//! Frame submission into recorded passes.

mod common;

use kiln_graphics::{
    command::Command,
    frame::DRAW_INDIRECT_STRIDE,
    noop::{self, ObjectKind},
    Access, Binding, BlitItem, BufferFlags, ClearColor, ClearFlags, Dispatch, Frame,
    IndirectBuffer, OcclusionUse, Rect, RenderBind, RenderCompute, RenderDraw, RendererContext,
    SamplerFlags, State, TextureConfig, TextureFormat, VertexStream,
};

/// Pass structure of the recorded commands, one letter per command.
fn pass_outline(commands: &[Command]) -> Vec<&'static str> {
    commands
        .iter()
        .filter_map(|command| match *command {
            Command::BeginRenderPass(_) => Some("begin render"),
            Command::EndRenderPass => Some("end render"),
            Command::BeginComputePass { .. } => Some("begin compute"),
            Command::EndComputePass => Some("end compute"),
            Command::Draw { .. } => Some("draw"),
            Command::Dispatch(_) => Some("dispatch"),
            Command::CopyTextureToTexture { .. } => Some("copy"),
            _ => None,
        })
        .collect()
}

fn submitted(renderer: &RendererContext<noop::Context>) -> Vec<Command> {
    renderer
        .device()
        .take_submissions()
        .into_iter()
        .flatten()
        .collect()
}

fn triangle_draw(
    renderer: &mut RendererContext<noop::Context>,
) -> RenderDraw {
    let program = common::solid_program(renderer);
    let buffer = common::triangle_buffer(renderer);
    let mut draw = RenderDraw::new(program);
    draw.state = State::WRITE_RGB | State::WRITE_A;
    draw.streams[0] = Some(VertexStream::new(buffer));
    draw
}

/// A touched view with a full clear becomes a clearing pass
#[test]
fn test_touch_full_clear() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let mut frame = Frame::new();
    let view = frame.view_mut(0);
    view.frame_buffer = Some(frame_buffer);
    view.clear.flags = ClearFlags::COLOR;
    view.clear.color = ClearColor::Rgba(0xff00_00ff);
    frame.touch(0);
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    assert_eq!(pass_outline(&commands), vec!["begin render", "end render"]);
    let desc = commands
        .iter()
        .find_map(|command| match *command {
            Command::BeginRenderPass(ref desc) => Some(desc),
            _ => None,
        })
        .expect("No render pass recorded");
    assert_eq!(desc.colors.len(), 1);
    assert_eq!(
        desc.colors[0].ops.load,
        wgpu::LoadOp::Clear(wgpu::Color {
            r: 1.0,
            g: 0.0,
            b: 0.0,
            a: 1.0
        })
    );
    assert_eq!(renderer.stats().num_render_passes, 1);
    assert_eq!(renderer.stats().num_draws, 0);
}

/// A view without items or clear records nothing
#[test]
fn test_empty_view_records_nothing() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.sort();
    renderer.submit(&frame);
    assert!(pass_outline(&submitted(&renderer)).is_empty());
    assert_eq!(renderer.stats().num_views, 0);
}

/// A clear rectangle smaller than the target is drawn as a quad
#[test]
fn test_partial_clear_draws_quad() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let mut frame = Frame::new();
    let view = frame.view_mut(0);
    view.frame_buffer = Some(frame_buffer);
    view.rect = Rect::new(0, 0, 2, 2);
    view.clear.flags = ClearFlags::COLOR;
    frame.touch(0);
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    assert_eq!(
        pass_outline(&commands),
        vec!["begin render", "draw", "end render"]
    );
    let load = commands.iter().find_map(|command| match *command {
        Command::BeginRenderPass(ref desc) => Some(desc.colors[0].ops.load),
        _ => None,
    });
    assert_eq!(load, Some(wgpu::LoadOp::Load));
    assert!(commands.iter().any(|command| matches!(
        *command,
        Command::Draw { ref vertices, .. } if *vertices == (0..4)
    )));
    assert_eq!(renderer.stats().pipelines.misses, 1);
    assert_eq!(renderer.stats().num_draws, 0, "the clear is not a user draw");
}

/// One triangle into an offscreen target
#[test]
fn test_draw_triangle() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();

    renderer.submit(&frame);
    let stats = renderer.stats();
    assert_eq!(stats.num_render_passes, 1);
    assert_eq!(stats.num_draws, 1);
    assert_eq!(stats.num_prims, 1);
    assert_eq!(stats.pipelines.misses, 1);
    assert_eq!(stats.num_bind_groups_created, 1);
    assert!(stats.scratch_bytes >= 64);

    let commands = submitted(&renderer);
    assert_eq!(
        pass_outline(&commands),
        vec!["begin render", "draw", "end render"]
    );
    assert!(commands.iter().any(|command| matches!(
        *command,
        Command::Draw { ref vertices, ref instances } if *vertices == (0..3) && *instances == (0..1)
    )));
    assert!(commands
        .iter()
        .any(|command| matches!(*command, Command::SetBindGroup { ref dynamic_offsets, .. } if dynamic_offsets.len() == 1)));

    renderer.submit(&frame);
    assert_eq!(renderer.stats().pipelines.hits, 1);
    assert_eq!(renderer.stats().pipelines.misses, 0);
}

/// Identical consecutive draws bind their state once
#[test]
fn test_redundant_state_skipped() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw.clone(), RenderBind::default(), 0.0);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    let count = |f: fn(&Command) -> bool| commands.iter().filter(|c| f(c)).count();
    assert_eq!(count(|c| matches!(c, Command::Draw { .. })), 2);
    assert_eq!(count(|c| matches!(c, Command::SetRenderPipeline(_))), 1);
    assert_eq!(count(|c| matches!(c, Command::SetVertexBuffer { .. })), 1);
    assert_eq!(renderer.stats().num_bind_groups_created, 1);
}

/// Compute work closes into its own pass before the view's draws
#[test]
fn test_compute_then_draw() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    let compute = common::compute_program(&mut renderer);
    let values = renderer
        .create_storage_buffer(256, kiln_graphics::BufferFlags::COMPUTE_READ_WRITE)
        .expect("Failed to create storage buffer");

    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.dispatch(
        0,
        RenderCompute::new(compute, [1, 1, 1]),
        RenderBind::default().with(
            0,
            Binding::VertexBuffer {
                buffer: values,
                access: Access::ReadWrite,
            },
        ),
    );
    frame.sort();
    renderer.submit(&frame);

    assert_eq!(
        pass_outline(&submitted(&renderer)),
        vec![
            "begin compute",
            "dispatch",
            "end compute",
            "begin render",
            "draw",
            "end render",
        ]
    );
    let stats = renderer.stats();
    assert_eq!(stats.num_compute_passes, 1);
    assert_eq!(stats.num_render_passes, 1);
    assert_eq!(stats.num_computes, 1);
    assert_eq!(stats.num_draws, 1);
}

/// A dispatch missing its storage binding is skipped
#[test]
fn test_dispatch_missing_binding_skipped() {
    let mut renderer = common::renderer();
    let compute = common::compute_program(&mut renderer);
    let mut frame = Frame::new();
    frame.dispatch(
        0,
        RenderCompute::new(compute, [1, 1, 1]),
        RenderBind::default(),
    );
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_computes, 0);
    assert_eq!(renderer.stats().num_skipped, 1);
}

/// Indirect draws issue one command per slot at the slot stride
#[test]
fn test_indirect_draw_commands() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let args = renderer
        .create_storage_buffer(4 * DRAW_INDIRECT_STRIDE, BufferFlags::DRAW_INDIRECT)
        .expect("Failed to create indirect buffer");
    let mut draw = triangle_draw(&mut renderer);
    draw.indirect = Some(IndirectBuffer {
        buffer: args,
        start: 1,
        count: 2,
    });
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);

    let offsets: Vec<u64> = submitted(&renderer)
        .iter()
        .filter_map(|command| match *command {
            Command::DrawIndirect { offset, .. } => Some(offset),
            _ => None,
        })
        .collect();
    assert_eq!(offsets, vec![DRAW_INDIRECT_STRIDE, 2 * DRAW_INDIRECT_STRIDE]);
}

/// Command ranges that overflow or leave the buffer skip the item
#[test]
fn test_out_of_range_draws_skipped() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let args = renderer
        .create_storage_buffer(4 * DRAW_INDIRECT_STRIDE, BufferFlags::DRAW_INDIRECT)
        .expect("Failed to create indirect buffer");
    let indices = renderer
        .create_index_buffer(bytemuck::cast_slice(&[0u16, 1, 2, 0]), BufferFlags::empty())
        .expect("Failed to create index buffer");
    let draw = triangle_draw(&mut renderer);

    let mut overflowing = draw.clone();
    overflowing.indirect = Some(IndirectBuffer {
        buffer: args,
        start: u32::MAX,
        count: 2,
    });
    let mut past_end = draw.clone();
    past_end.indirect = Some(IndirectBuffer {
        buffer: args,
        start: 3,
        count: 2,
    });
    let mut indexed = draw;
    indexed.index_buffer = Some(indices);
    indexed.start_index = u32::MAX - 1;
    indexed.num_indices = 3;

    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    for draw in [overflowing, past_end, indexed] {
        frame.submit(0, draw, RenderBind::default(), 0.0);
    }
    frame.sort();
    renderer.submit(&frame);

    let stats = renderer.stats();
    assert_eq!(stats.num_draws, 0);
    assert_eq!(stats.num_skipped, 3);
    assert!(!submitted(&renderer).iter().any(|command| matches!(
        *command,
        Command::DrawIndirect { .. } | Command::DrawIndexed { .. }
    )));
}

/// An indirect dispatch past the end of its buffer is skipped
#[test]
fn test_indirect_dispatch_out_of_range_skipped() {
    let mut renderer = common::renderer();
    let compute = common::compute_program(&mut renderer);
    let values = renderer
        .create_storage_buffer(256, BufferFlags::COMPUTE_READ_WRITE)
        .expect("Failed to create storage buffer");
    let args = renderer
        .create_storage_buffer(DRAW_INDIRECT_STRIDE, BufferFlags::DRAW_INDIRECT)
        .expect("Failed to create indirect buffer");
    let bind = RenderBind::default().with(
        0,
        Binding::VertexBuffer {
            buffer: values,
            access: Access::ReadWrite,
        },
    );

    let mut frame = Frame::new();
    for (start, count) in [(0, 1), (u32::MAX, 1), (0, 2)] {
        let mut dispatch = RenderCompute::new(compute, [1, 1, 1]);
        dispatch.dispatch = Dispatch::Indirect(IndirectBuffer {
            buffer: args,
            start,
            count,
        });
        frame.dispatch(0, dispatch, bind.clone());
    }
    frame.sort();
    renderer.submit(&frame);

    let stats = renderer.stats();
    assert_eq!(stats.num_computes, 1);
    assert_eq!(stats.num_skipped, 2);
    let dispatches = submitted(&renderer)
        .iter()
        .filter(|command| matches!(**command, Command::DispatchIndirect { .. }))
        .count();
    assert_eq!(dispatches, 1);
}

/// Every view opens and closes its own pass
#[test]
fn test_views_get_own_passes() {
    let mut renderer = common::renderer();
    let (first, _) = common::offscreen(&mut renderer, 4, 4);
    let (second, _) = common::offscreen(&mut renderer, 8, 8);
    let draw = triangle_draw(&mut renderer);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(first);
    frame.view_mut(1).frame_buffer = Some(second);
    frame.submit(1, draw.clone(), RenderBind::default(), 0.0);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    assert_eq!(
        pass_outline(&commands),
        vec![
            "begin render",
            "draw",
            "end render",
            "begin render",
            "draw",
            "end render",
        ]
    );
    let viewports: Vec<[f32; 4]> = commands
        .iter()
        .filter_map(|command| match *command {
            Command::SetViewport { rect, .. } => Some(rect),
            _ => None,
        })
        .collect();
    assert_eq!(viewports, vec![[0.0, 0.0, 4.0, 4.0], [0.0, 0.0, 8.0, 8.0]]);
    assert_eq!(renderer.stats().num_views, 2);
    assert_eq!(
        renderer.stats().num_bind_groups_created,
        1,
        "both views share the bind group"
    );
}

/// Named views wrap their passes in a debug group
#[test]
fn test_named_view_debug_group() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let mut frame = Frame::new();
    let view = frame.view_mut(0);
    view.frame_buffer = Some(frame_buffer);
    view.clear.flags = ClearFlags::COLOR;
    view.name = "shadow".to_string();
    frame.touch(0);
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    let push = commands
        .iter()
        .position(|command| *command == Command::PushDebugGroup("shadow".to_string()))
        .expect("No debug group pushed");
    let begin = commands
        .iter()
        .position(|command| matches!(*command, Command::BeginRenderPass(ref desc) if desc.label == "shadow"))
        .expect("No render pass recorded");
    let end = commands
        .iter()
        .position(|command| *command == Command::EndRenderPass)
        .expect("Render pass not ended");
    let pop = commands
        .iter()
        .position(|command| *command == Command::PopDebugGroup)
        .expect("No debug group popped");
    assert!(push < begin && begin < end && end < pop);
}

/// Draws into a destroyed frame buffer are dropped
#[test]
fn test_destroyed_frame_buffer_skips() {
    let mut renderer = common::renderer();
    let (frame_buffer, texture) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    renderer
        .destroy_texture(texture)
        .expect("Failed to destroy texture");

    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 0);
    assert_eq!(renderer.stats().num_skipped, 1);
    assert!(pass_outline(&submitted(&renderer)).is_empty());

    renderer
        .destroy_frame_buffer(frame_buffer)
        .expect("Failed to destroy frame buffer");
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_skipped, 1);
}

/// A draw scissor that misses the view is dropped
#[test]
fn test_empty_scissor_skips() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let mut draw = triangle_draw(&mut renderer);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    draw.scissor = Some(frame.add_scissor(Rect::new(16, 16, 4, 4)));
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 0);
    assert_eq!(renderer.stats().num_skipped, 1);
}

/// A sampled texture gets a sampler and a bind group entry
#[test]
fn test_textured_draw_binds_sampler() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let program = common::textured_program(&mut renderer);
    let buffer = common::triangle_buffer(&mut renderer);
    let texture = renderer
        .create_texture(
            TextureConfig::new_2d(1, 1, TextureFormat::Rgba8Unorm),
            Some(&[0, 255, 0, 255]),
        )
        .expect("Failed to create texture");

    let mut draw = RenderDraw::new(program);
    draw.state = State::WRITE_RGB | State::WRITE_A;
    draw.streams[0] = Some(VertexStream::new(buffer));
    let bind = RenderBind::default().with(
        0,
        Binding::Texture {
            texture,
            sampler: SamplerFlags::POINT,
        },
    );
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw.clone(), bind.clone(), 0.0);
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 1);
    assert_eq!(renderer.device().num_live(ObjectKind::Sampler), 1);
    assert_eq!(renderer.device().num_bad_bind_groups(), 0);

    // Without the texture the draw cannot be bound.
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 0);
    assert_eq!(renderer.stats().num_skipped, 1);
}

/// Blits run before the view they are declared for
#[test]
fn test_blit_before_view() {
    let mut renderer = common::renderer();
    let (frame_buffer, target) = common::offscreen(&mut renderer, 4, 4);
    let source = renderer
        .create_texture(TextureConfig::new_2d(4, 4, TextureFormat::Rgba8Unorm), None)
        .expect("Failed to create texture");
    let draw = triangle_draw(&mut renderer);

    let mut frame = Frame::new();
    frame.view_mut(1).frame_buffer = Some(frame_buffer);
    frame.submit(1, draw, RenderBind::default(), 0.0);
    frame.blit(BlitItem {
        view: 1,
        src: source,
        src_mip: 0,
        src_origin: [0; 3],
        dst: target,
        dst_mip: 0,
        dst_origin: [2, 2, 0],
        size: [4, 4, 1],
    });
    frame.sort();
    renderer.submit(&frame);

    let commands = submitted(&renderer);
    assert_eq!(
        pass_outline(&commands),
        vec!["copy", "begin render", "draw", "end render"]
    );
    let size = commands.iter().find_map(|command| match *command {
        Command::CopyTextureToTexture { size, .. } => Some(size),
        _ => None,
    });
    assert_eq!(
        size,
        Some(wgpu::Extent3d {
            width: 2,
            height: 2,
            depth_or_array_layers: 1,
        }),
        "the copy is clipped to the destination"
    );
    assert_eq!(renderer.stats().num_blits, 1);
}

/// Probed results arrive a frame later and gate conditional draws
#[test]
fn test_occlusion_query() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    let query = renderer
        .create_occlusion_query()
        .expect("Failed to create occlusion query");

    let mut probe = draw.clone();
    probe.occlusion = Some(OcclusionUse::Probe(query));
    let mut conditional = draw;
    conditional.occlusion = Some(OcclusionUse::Conditional(query));

    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.view_mut(0).mode = kiln_graphics::ViewMode::Sequential;
    frame.submit(0, probe, RenderBind::default(), 0.0);
    frame.submit(0, conditional, RenderBind::default(), 0.0);
    frame.sort();

    assert_eq!(renderer.occlusion_result(query), None);
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 2, "unknown results count as visible");
    let commands = submitted(&renderer);
    assert!(commands.contains(&Command::BeginOcclusionQuery(0)));
    assert!(commands
        .iter()
        .any(|command| matches!(*command, Command::ResolveQuerySet { .. })));

    // Results land when the next frame starts.
    renderer.device().set_occlusion_samples(0, 0);
    renderer.submit(&frame);
    assert_eq!(renderer.occlusion_result(query), Some(1));
    assert_eq!(renderer.stats().num_draws, 2);

    renderer.submit(&frame);
    assert_eq!(renderer.occlusion_result(query), Some(0));
    assert_eq!(renderer.stats().num_occlusion_culled, 1);
    assert_eq!(renderer.stats().num_draws, 1);
}

/// Shutdown destroys everything the renderer created
#[test]
fn test_shutdown_releases_objects() {
    let mut renderer = common::renderer();
    let (frame_buffer, _) = common::offscreen(&mut renderer, 4, 4);
    let draw = triangle_draw(&mut renderer);
    let mut frame = Frame::new();
    frame.view_mut(0).frame_buffer = Some(frame_buffer);
    frame.submit(0, draw, RenderBind::default(), 0.0);
    frame.sort();
    renderer.submit(&frame);
    renderer.submit(&frame);

    let device = renderer.shutdown();
    assert_eq!(device.num_live_objects(), 0);
    assert_eq!(device.num_stale_destroys(), 0);
}

/// A lost device is reported and submission keeps going
#[test]
fn test_device_loss_reported() {
    let mut renderer = common::renderer();
    assert!(!renderer.is_device_removed());
    renderer.device().lose();
    assert!(renderer.is_device_removed());
    let mut frame = Frame::new();
    frame.sort();
    renderer.submit(&frame);
}
