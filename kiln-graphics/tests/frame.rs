//! Frame building and sort key ordering.

use kiln_graphics::{
    frame::depth_to_key, Frame, ProgramHandle, Rect, RenderBind, RenderCompute, RenderDraw,
    RenderItem, SortKey, State, ViewMode,
};
use proptest::prelude::*;
use slotmap::{Key as _, KeyData};

fn program(index: u64) -> ProgramHandle {
    ProgramHandle::from(KeyData::from_ffi((1 << 32) | index))
}

fn draw(index: u64) -> RenderDraw {
    RenderDraw::new(program(index))
}

fn item_program(item: &RenderItem) -> u64 {
    item.program().data().as_ffi() & 0xffff_ffff
}

/// Fields survive encoding in every view mode
#[test]
fn test_sort_key_decode() {
    let key = SortKey {
        view: 7,
        is_draw: true,
        blend: 1,
        program: 300,
        depth: depth_to_key(0.25),
        seq: 42,
    };
    for mode in [ViewMode::Default, ViewMode::DepthAscending, ViewMode::DepthDescending] {
        let decoded = SortKey::decode(key.encode(mode), mode);
        assert_eq!(decoded, key, "{:?}", mode);
    }
    let decoded = SortKey::decode(key.encode(ViewMode::Sequential), ViewMode::Sequential);
    assert_eq!(decoded.seq, 42);
    assert_eq!(decoded.program, 300);
    assert_eq!(decoded.depth, 0, "sequential keys carry no depth");

    let compute = SortKey {
        is_draw: false,
        blend: 0,
        depth: 0,
        ..key
    };
    assert_eq!(SortKey::decode(compute.encode(ViewMode::Default), ViewMode::Default), compute);
}

/// Items of one view are contiguous and compute work precedes draws
#[test]
fn test_frame_sort_groups_views() {
    let mut frame = Frame::new();
    frame.submit(2, draw(1), RenderBind::default(), 0.0);
    frame.submit(0, draw(1), RenderBind::default(), 0.0);
    frame.dispatch(2, RenderCompute::new(program(2), [1, 1, 1]), RenderBind::default());
    frame.submit(1, draw(3), RenderBind::default(), 0.0);
    frame.dispatch(0, RenderCompute::new(program(2), [1, 1, 1]), RenderBind::default());
    assert!(!frame.is_sorted());

    frame.sort();
    assert!(frame.is_sorted());
    let order: Vec<(u16, bool)> = frame
        .items
        .iter()
        .map(|item| (item.view, item.item.is_compute()))
        .collect();
    assert_eq!(
        order,
        vec![(0, true), (0, false), (1, false), (2, true), (2, false)]
    );
}

/// Opaque draws sort before blended ones in the default mode
#[test]
fn test_frame_sort_blend_class() {
    let mut frame = Frame::new();
    let mut blended = draw(1);
    blended.state = State::DEFAULT | State::BLEND_ALPHA;
    frame.submit(0, blended, RenderBind::default(), 0.0);
    frame.submit(0, draw(9), RenderBind::default(), 0.0);
    frame.sort();
    match frame.items[0].item {
        RenderItem::Draw(ref first) => assert!(!first.state.intersects(State::BLEND_MASK)),
        RenderItem::Compute(_) => panic!("unexpected compute item"),
    }
}

/// Depth modes order by depth, sequential mode by submission
#[test]
fn test_frame_sort_view_modes() {
    let depths = [0.5, -2.0, 3.0, 0.0];

    let mut frame = Frame::new();
    frame.view_mut(0).mode = ViewMode::DepthAscending;
    frame.view_mut(1).mode = ViewMode::DepthDescending;
    frame.view_mut(2).mode = ViewMode::Sequential;
    for (index, &depth) in depths.iter().enumerate() {
        frame.submit(0, draw(index as u64), RenderBind::default(), depth);
        frame.submit(1, draw(index as u64), RenderBind::default(), depth);
        frame.submit(2, draw(10 - index as u64), RenderBind::default(), depth);
    }
    frame.sort();

    let programs = |view: u16| -> Vec<u64> {
        frame
            .items
            .iter()
            .filter(|item| item.view == view)
            .map(|item| item_program(&item.item))
            .collect()
    };
    assert_eq!(programs(0), vec![1, 3, 0, 2]);
    assert_eq!(programs(1), vec![2, 0, 3, 1]);
    assert_eq!(programs(2), vec![10, 9, 8, 7]);
}

/// Touching a view submits an item without a program
#[test]
fn test_frame_touch() {
    let mut frame = Frame::new();
    frame.touch(3);
    assert_eq!(frame.items.len(), 1);
    assert_eq!(frame.views.len(), 4);
    assert!(frame.items[0].item.program().is_null());
}

/// Caches hand out indices in insertion order
#[test]
fn test_frame_caches() {
    let mut frame = Frame::new();
    assert_eq!(frame.matrix_cache.len(), 1, "index 0 is the identity");
    let matrix = frame.add_transform(glam::Mat4::from_scale(glam::Vec3::splat(2.0)).into());
    assert_eq!(matrix, 1);
    assert_eq!(frame.add_scissor(Rect::new(0, 0, 8, 8)), 0);
    assert_eq!(frame.add_scissor(Rect::new(4, 4, 8, 8)), 1);
}

/// Rectangles clip against each other
#[test]
fn test_rect_intersect() {
    let a = Rect::new(0, 0, 100, 50);
    let b = Rect::new(80, 40, 100, 100);
    assert_eq!(a.intersect(&b), Rect::new(80, 40, 20, 10));
    assert!(a.intersect(&Rect::new(200, 0, 10, 10)).is_zero_area());
    assert!(a.contains(&Rect::new(10, 10, 20, 20)));
    assert!(!a.contains(&b));
}

proptest! {
    /// The depth key preserves float ordering
    #[test]
    fn prop_depth_key_is_monotonic(a in -1.0e6f32..1.0e6, b in -1.0e6f32..1.0e6) {
        if a < b {
            prop_assert!(depth_to_key(a) < depth_to_key(b));
        } else if a > b {
            prop_assert!(depth_to_key(a) > depth_to_key(b));
        }
    }
}
