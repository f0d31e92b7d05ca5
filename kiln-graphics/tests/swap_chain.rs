//! Surface acquisition, reset cycles and window frame buffers.

mod common;

use common::TestWindow;
use kiln_graphics::{
    command::{Command, CommandQueue},
    frame_buffer::{negotiate_format, SwapChain, SwapChainState},
    noop::{self, ObjectKind},
    AcquireError, ClearFlags, Frame, ResetFlags, Resolution, TextureFormat,
};

fn swap_chain(device: &noop::Context, reset: ResetFlags) -> SwapChain {
    common::init_logger();
    SwapChain::create(
        device,
        &TestWindow,
        320,
        240,
        TextureFormat::Bgra8Unorm,
        None,
        reset,
    )
    .expect("Failed to create swap chain")
}

/// Creation configures the surface and holds a texture right away
#[test]
fn test_swap_chain_create() {
    let device = noop::Context::default();
    let swap_chain = swap_chain(&device, ResetFlags::VSYNC);
    assert_eq!(swap_chain.state(), SwapChainState::Configured);
    assert_eq!((swap_chain.width(), swap_chain.height()), (320, 240));
    assert_eq!(swap_chain.format(), wgpu::TextureFormat::Bgra8Unorm);
    assert!(swap_chain.current_view().is_some());
    assert!(!swap_chain.is_skipping());
    assert_eq!(device.num_configures(), 1);
}

/// An outdated surface is reconfigured and acquired again
#[test]
fn test_swap_chain_outdated_retries() {
    let device = noop::Context::default();
    device.script_acquire([AcquireError::Outdated]);
    let swap_chain = swap_chain(&device, ResetFlags::VSYNC);
    assert!(swap_chain.current_view().is_some());
    assert_eq!(swap_chain.num_reconfigures(), 1);
    assert_eq!(device.num_configures(), 2);
}

/// A timeout skips the frame without reconfiguring
#[test]
fn test_swap_chain_timeout_skips() {
    let device = noop::Context::default();
    device.script_acquire([AcquireError::Timeout]);
    let mut swap_chain = swap_chain(&device, ResetFlags::VSYNC);
    assert!(swap_chain.is_skipping());
    assert!(swap_chain.current_view().is_none());
    assert_eq!(swap_chain.num_reconfigures(), 0);

    // Skipping sticks until the next frame begins.
    assert!(swap_chain.acquire(&device).is_none());
    swap_chain.begin_frame();
    assert!(swap_chain.acquire(&device).is_some());
}

/// A surface that stays lost after reconfiguring is skipped
#[test]
fn test_swap_chain_lost_twice_skips() {
    let device = noop::Context::default();
    device.script_acquire([AcquireError::Lost, AcquireError::Lost]);
    let swap_chain = swap_chain(&device, ResetFlags::VSYNC);
    assert!(swap_chain.is_skipping());
    assert!(swap_chain.current_view().is_none());
    assert_eq!(swap_chain.num_reconfigures(), 1);
}

/// Present hands the texture over and acquires the next one
#[test]
fn test_swap_chain_present() {
    let device = noop::Context::default();
    let mut swap_chain = swap_chain(&device, ResetFlags::VSYNC);
    let first = swap_chain.current_view();
    assert!(swap_chain.present(&device));
    assert_eq!(device.num_presents(), 1);
    assert!(swap_chain.current_view().is_some());
    assert_ne!(swap_chain.current_view(), first);

    // A failed eager acquire leaves nothing to present but does not skip.
    device.script_acquire([AcquireError::Timeout]);
    assert!(swap_chain.present(&device));
    assert!(swap_chain.current_view().is_none());
    assert!(!swap_chain.is_skipping());
    assert!(swap_chain.acquire(&device).is_some());
}

/// Pre-reset drops the held texture and companions, post-reset rebuilds
#[test]
fn test_swap_chain_reset_cycle() {
    let device = noop::Context::default();
    let mut queue = CommandQueue::new(2);
    let mut swap_chain = swap_chain(&device, ResetFlags::VSYNC | ResetFlags::MSAA_X4);
    assert_eq!(swap_chain.sample_count(), 4);
    assert_eq!(device.num_live(ObjectKind::Texture), 1, "msaa companion");

    swap_chain.pre_reset(&device, &mut queue);
    assert_eq!(swap_chain.state(), SwapChainState::PreReset);
    assert!(swap_chain.current_view().is_none());
    assert_eq!(device.num_discards(), 1);
    assert!(swap_chain.acquire(&device).is_none());

    swap_chain.post_reset(&device, 640, 480, ResetFlags::VSYNC);
    assert_eq!(swap_chain.state(), SwapChainState::Configured);
    assert_eq!((swap_chain.width(), swap_chain.height()), (640, 480));
    assert_eq!(swap_chain.sample_count(), 1);
    assert!(swap_chain.current_view().is_some());

    queue.finish(&device);
    assert_eq!(device.num_live(ObjectKind::Texture), 0);

    swap_chain.destroy(&device, &mut queue);
    queue.finish(&device);
    assert_eq!(device.num_live(ObjectKind::Surface), 0);
    assert_eq!(device.num_live(ObjectKind::TextureView), 0);
}

/// Unsupported formats are remapped between RGBA and BGRA first
#[test]
fn test_negotiate_format() {
    use wgpu::TextureFormat as Tf;
    let supported = [Tf::Bgra8Unorm, Tf::Bgra8UnormSrgb];
    assert_eq!(negotiate_format(Tf::Bgra8Unorm, &supported), Tf::Bgra8Unorm);
    assert_eq!(negotiate_format(Tf::Rgba8Unorm, &supported), Tf::Bgra8Unorm);
    assert_eq!(
        negotiate_format(Tf::Rgba8UnormSrgb, &supported),
        Tf::Bgra8UnormSrgb
    );
    assert_eq!(negotiate_format(Tf::Rgba16Float, &supported), Tf::Bgra8Unorm);
}

/// The sRGB reset flag asks for the sRGB variant of the format
#[test]
fn test_swap_chain_srgb_request() {
    let device = noop::Context::default();
    let swap_chain = swap_chain(&device, ResetFlags::VSYNC | ResetFlags::SRGB_BACKBUFFER);
    assert_eq!(
        swap_chain.requested_format(),
        wgpu::TextureFormat::Bgra8UnormSrgb
    );
    assert_eq!(swap_chain.format(), wgpu::TextureFormat::Bgra8UnormSrgb);
}

fn cleared_frame(resolution: Resolution) -> Frame {
    let mut frame = Frame::new();
    frame.resolution = resolution;
    frame.view_mut(0).clear.flags = ClearFlags::COLOR;
    frame.touch(0);
    frame.sort();
    frame
}

/// A new frame resolution resizes the main window through a reset cycle
#[test]
fn test_main_window_resize() {
    let mut renderer = common::renderer();
    let small = Resolution {
        width: 800,
        height: 600,
        reset: ResetFlags::VSYNC,
    };
    let main = renderer
        .set_main_window(&TestWindow, small, None)
        .expect("Failed to create main window");
    assert_eq!(renderer.main_frame_buffer(), Some(main));

    let frame = cleared_frame(small);
    renderer.submit(&frame);
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_presents, 1);
    assert_eq!(renderer.stats().num_pre_resets, 0);
    let views = renderer.device().num_live(ObjectKind::TextureView);
    let hash = renderer.frame_buffer_format_hash(main);
    renderer.device().take_submissions();

    let large = Resolution {
        width: 1024,
        height: 768,
        ..small
    };
    renderer.submit(&cleared_frame(large));
    assert_eq!(renderer.stats().num_pre_resets, 1);
    assert_eq!(renderer.stats().num_post_resets, 1);
    assert_eq!(renderer.stats().num_presents, 1);
    assert_eq!(renderer.frame_buffer_size(main), Some((1024, 768)));
    assert_eq!(renderer.frame_buffer_format_hash(main), hash);
    assert_eq!(renderer.device().num_live(ObjectKind::TextureView), views);

    let viewport = renderer
        .device()
        .take_submissions()
        .into_iter()
        .flatten()
        .find_map(|command| match command {
            Command::SetViewport { rect, .. } => Some(rect),
            _ => None,
        });
    assert_eq!(viewport, Some([0.0, 0.0, 1024.0, 768.0]));
}

/// An explicit resize is reported with the next frame
#[test]
fn test_update_frame_buffer() {
    let mut renderer = common::renderer();
    let resolution = Resolution::default();
    let main = renderer
        .set_main_window(&TestWindow, resolution, None)
        .expect("Failed to create main window");
    renderer
        .update_frame_buffer(main, 300, 200)
        .expect("Failed to resize frame buffer");
    assert_eq!(renderer.frame_buffer_size(main), Some((300, 200)));

    renderer.submit(&cleared_frame(resolution));
    assert_eq!(renderer.stats().num_pre_resets, 1);
    renderer.submit(&cleared_frame(resolution));
    assert_eq!(renderer.stats().num_pre_resets, 0);
}

/// Skipped surfaces drop the view's work and present nothing
#[test]
fn test_skipped_surface_renders_nothing() {
    let mut renderer = common::renderer();
    let resolution = Resolution::default();
    renderer
        .set_main_window(&TestWindow, resolution, None)
        .expect("Failed to create main window");
    let frame = cleared_frame(resolution);
    renderer.submit(&frame);
    renderer.device().take_submissions();

    // The held texture is presented, then the eager acquire times out twice:
    // once after present and once when the next frame retries.
    renderer
        .device()
        .script_acquire([AcquireError::Timeout, AcquireError::Timeout]);
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_presents, 1);
    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_presents, 0);
    assert_eq!(renderer.stats().num_render_passes, 0);

    renderer.submit(&frame);
    assert_eq!(renderer.stats().num_presents, 1);
}
