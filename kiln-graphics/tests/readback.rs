//! Texture readback, on the noop device and on a real adapter when present.

mod common;

use kiln_graphics::{
    webgpu, Binding, ContextDesc, Frame, RenderBind, RenderDraw, RendererContext, SamplerFlags,
    State, TextureConfig, TextureFormat, VertexStream,
};

/// Uploaded texels read back unpadded
#[test]
fn test_read_texture_noop() {
    let mut renderer = common::renderer();
    let texels: Vec<u8> = (0..3 * 2 * 4).map(|i| i as u8).collect();
    let texture = renderer
        .create_texture(
            TextureConfig::new_2d(3, 2, TextureFormat::Rgba8Unorm),
            Some(&texels),
        )
        .expect("Failed to create texture");
    let data = renderer
        .read_texture(texture, 0)
        .expect("Failed to read texture");
    assert_eq!(data, texels);
}

/// A partial update is visible to the next readback
#[test]
fn test_update_then_read_noop() {
    let mut renderer = common::renderer();
    let texture = renderer
        .create_texture(TextureConfig::new_2d(2, 2, TextureFormat::Rgba8Unorm), None)
        .expect("Failed to create texture");
    renderer
        .update_texture(texture, 0, 0, [1, 1, 0], [1, 1, 1], &[9, 8, 7, 6])
        .expect("Failed to update texture");
    let data = renderer
        .read_texture(texture, 0)
        .expect("Failed to read texture");
    assert_eq!(&data[12..16], &[9, 8, 7, 6]);
    assert!(data[..12].iter().all(|&byte| byte == 0));
}

/// Reading a destroyed texture fails
#[test]
fn test_read_destroyed_texture() {
    let mut renderer = common::renderer();
    let texture = renderer
        .create_texture(TextureConfig::new_2d(1, 1, TextureFormat::Rgba8Unorm), None)
        .expect("Failed to create texture");
    renderer
        .destroy_texture(texture)
        .expect("Failed to destroy texture");
    assert!(renderer.read_texture(texture, 0).is_err());
}

/// A textured fullscreen triangle fills the target with the texel color
#[test]
fn test_textured_triangle_webgpu() {
    common::init_logger();
    let device = match webgpu::create_context(&ContextDesc::default()) {
        Ok(device) => device,
        Err(error) => {
            log::warn!("Skipping, no adapter: {}", error);
            return;
        }
    };
    let mut renderer =
        RendererContext::new(device, ContextDesc::default()).expect("Failed to create renderer");

    let program = common::textured_program(&mut renderer);
    let buffer = common::triangle_buffer(&mut renderer);
    let (frame_buffer, target) = common::offscreen(&mut renderer, 4, 4);
    let color = [32u8, 96, 160, 255];
    let texture = renderer
        .create_texture(
            TextureConfig::new_2d(1, 1, TextureFormat::Rgba8Unorm),
            Some(&color),
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
    frame.submit(0, draw, bind, 0.0);
    frame.sort();
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_draws, 1);

    let pixels = renderer
        .read_texture(target, 0)
        .expect("Failed to read render target");
    assert_eq!(pixels.len(), 4 * 4 * 4);
    for pixel in pixels.chunks_exact(4) {
        assert_eq!(pixel, &color[..]);
    }

    let device = renderer.shutdown();
    drop(device);
}
