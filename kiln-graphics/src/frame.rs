//! Per-frame description consumed by [`RendererContext::submit`].
//!
//! A frame is built by the caller, sorted once with [`Frame::sort`], and
//! then only read by the renderer.
//!
//! [`RendererContext::submit`]: crate::RendererContext::submit

use std::ops::Range;

use crate::{
    state::{SamplerFlags, State, Stencil},
    FrameBufferHandle, IndexBufferHandle, OcclusionQueryHandle, ProgramHandle, TextureHandle,
    UniformHandle, VertexBufferHandle, VertexLayoutHandle, MAX_COLOR_ATTACHMENTS,
    MAX_COLOR_PALETTE, MAX_TEXTURE_SAMPLERS, MAX_VERTEX_STREAMS, MAX_VIEWS,
};

pub type ViewId = u16;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0 && self.width == 0 && self.height == 0
    }

    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x as u32 + self.width as u32
    }

    pub fn bottom(&self) -> u32 {
        self.y as u32 + self.height as u32
    }

    pub fn intersect(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        Rect {
            x,
            y,
            width: right.saturating_sub(x as u32) as u16,
            height: bottom.saturating_sub(y as u32) as u16,
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct ClearFlags: u16 {
        const COLOR = 0x1;
        const DEPTH = 0x2;
        const STENCIL = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearColor {
    /// One color for every attachment, as `0xRRGGBBAA`.
    Rgba(u32),
    /// Per-attachment index into [`Frame::color_palette`].
    Palette([u8; MAX_COLOR_ATTACHMENTS]),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clear {
    pub flags: ClearFlags,
    pub color: ClearColor,
    pub depth: f32,
    pub stencil: u8,
}

impl Default for Clear {
    fn default() -> Self {
        Self {
            flags: ClearFlags::empty(),
            color: ClearColor::Rgba(0x0000_00ff),
            depth: 1.0,
            stencil: 0,
        }
    }
}

pub(crate) fn unpack_rgba(rgba: u32) -> [f32; 4] {
    [
        ((rgba >> 24) & 0xff) as f32 / 255.0,
        ((rgba >> 16) & 0xff) as f32 / 255.0,
        ((rgba >> 8) & 0xff) as f32 / 255.0,
        (rgba & 0xff) as f32 / 255.0,
    ]
}

impl Clear {
    /// Color of color attachment `index`.
    pub fn color_of(&self, index: usize, palette: &[[f32; 4]; MAX_COLOR_PALETTE]) -> [f32; 4] {
        match self.color {
            ClearColor::Rgba(rgba) => unpack_rgba(rgba),
            ClearColor::Palette(indices) => {
                palette[indices[index.min(MAX_COLOR_ATTACHMENTS - 1)] as usize % MAX_COLOR_PALETTE]
            }
        }
    }
}

/// How draws within a view are ordered.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum ViewMode {
    /// Grouped by blend class then program, front to back within a program.
    #[default]
    Default,
    /// Submission order.
    Sequential,
    DepthAscending,
    DepthDescending,
}

#[derive(Clone, Debug)]
pub struct View {
    /// Viewport, in target pixels.
    pub rect: Rect,
    /// View scissor; zero means the whole viewport.
    pub scissor: Rect,
    pub clear: Clear,
    /// Target; `None` renders into the main frame buffer.
    pub frame_buffer: Option<FrameBufferHandle>,
    pub view: mint::ColumnMatrix4<f32>,
    pub proj: mint::ColumnMatrix4<f32>,
    pub mode: ViewMode,
    /// Debug group label, empty for none.
    pub name: String,
}

impl Default for View {
    fn default() -> Self {
        Self {
            rect: Rect::default(),
            scissor: Rect::default(),
            clear: Clear::default(),
            frame_buffer: None,
            view: glam::Mat4::IDENTITY.into(),
            proj: glam::Mat4::IDENTITY.into(),
            mode: ViewMode::Default,
            name: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexStream {
    pub buffer: VertexBufferHandle,
    pub start_vertex: u32,
    /// Overrides the layout the buffer was created with.
    pub layout: Option<VertexLayoutHandle>,
}

impl VertexStream {
    /// Whole buffer with the layout it was created with.
    pub fn new(buffer: VertexBufferHandle) -> Self {
        Self {
            buffer,
            start_vertex: 0,
            layout: None,
        }
    }
}

/// Per-instance data, read as `stride` consecutive `vec4` attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstanceData {
    pub buffer: VertexBufferHandle,
    pub offset: u32,
    /// Number of `vec4` per instance.
    pub stride: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectBuffer {
    pub buffer: VertexBufferHandle,
    /// First command index.
    pub start: u32,
    pub count: u32,
}

/// Size in bytes of one indirect draw or dispatch command slot.
pub const DRAW_INDIRECT_STRIDE: u64 = 32;

impl IndirectBuffer {
    /// Command slots to issue, or `None` when they do not fit in a buffer of
    /// `buffer_size` bytes.
    pub fn commands(&self, buffer_size: u64) -> Option<Range<u32>> {
        let end = self.start.checked_add(self.count)?;
        (end as u64 * DRAW_INDIRECT_STRIDE <= buffer_size).then_some(self.start..end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcclusionUse {
    /// The draw feeds the query.
    Probe(OcclusionQueryHandle),
    /// The draw is skipped when the query reported nothing visible.
    Conditional(OcclusionQueryHandle),
}

#[derive(Clone, Debug)]
pub struct RenderDraw {
    pub program: ProgramHandle,
    pub state: State,
    pub stencil: Stencil,
    /// Blend constant as `0xRRGGBBAA`, or per-target blend with
    /// [`State::BLEND_INDEPENDENT`].
    pub rgba: u32,
    pub streams: [Option<VertexStream>; MAX_VERTEX_STREAMS],
    /// Vertices to draw without an index buffer; `u32::MAX` for all.
    pub num_vertices: u32,
    pub index_buffer: Option<IndexBufferHandle>,
    pub start_index: u32,
    /// `u32::MAX` for all.
    pub num_indices: u32,
    pub instance_data: Option<InstanceData>,
    pub num_instances: u32,
    pub indirect: Option<IndirectBuffer>,
    pub occlusion: Option<OcclusionUse>,
    /// Index into [`Frame::rect_cache`].
    pub scissor: Option<u16>,
    /// Index into [`Frame::matrix_cache`].
    pub matrix: u32,
    pub num_matrices: u16,
    /// Range of [`Frame::uniforms`] applied before this draw.
    pub uniforms: Range<u32>,
}

impl RenderDraw {
    pub fn new(program: ProgramHandle) -> Self {
        Self {
            program,
            state: State::DEFAULT,
            stencil: Stencil::NONE,
            rgba: 0,
            streams: [None; MAX_VERTEX_STREAMS],
            num_vertices: u32::MAX,
            index_buffer: None,
            start_index: 0,
            num_indices: u32::MAX,
            instance_data: None,
            num_instances: 1,
            indirect: None,
            occlusion: None,
            scissor: None,
            matrix: 0,
            num_matrices: 1,
            uniforms: 0..0,
        }
    }

    pub fn stream_mask(&self) -> u8 {
        self.streams
            .iter()
            .enumerate()
            .filter(|(_, stream)| stream.is_some())
            .fold(0, |mask, (index, _)| mask | 1 << index)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Direct([u32; 3]),
    Indirect(IndirectBuffer),
}

#[derive(Clone, Debug)]
pub struct RenderCompute {
    pub program: ProgramHandle,
    pub dispatch: Dispatch,
    pub matrix: u32,
    pub num_matrices: u16,
    pub uniforms: Range<u32>,
}

impl RenderCompute {
    pub fn new(program: ProgramHandle, groups: [u32; 3]) -> Self {
        Self {
            program,
            dispatch: Dispatch::Direct(groups),
            matrix: 0,
            num_matrices: 0,
            uniforms: 0..0,
        }
    }
}

#[derive(Clone, Debug)]
pub enum RenderItem {
    Draw(RenderDraw),
    Compute(RenderCompute),
}

impl RenderItem {
    pub fn program(&self) -> ProgramHandle {
        match *self {
            Self::Draw(ref draw) => draw.program,
            Self::Compute(ref compute) => compute.program,
        }
    }

    pub fn is_compute(&self) -> bool {
        matches!(*self, Self::Compute(_))
    }

    pub fn uniforms(&self) -> Range<u32> {
        match *self {
            Self::Draw(ref draw) => draw.uniforms.clone(),
            Self::Compute(ref compute) => compute.uniforms.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

/// Resource bound to one slot of a [`RenderBind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// Sampled texture with its sampler state.
    Texture {
        texture: TextureHandle,
        sampler: SamplerFlags,
    },
    /// Storage image of a single mip.
    Image {
        texture: TextureHandle,
        mip: u8,
        access: Access,
    },
    VertexBuffer {
        buffer: VertexBufferHandle,
        access: Access,
    },
    IndexBuffer {
        buffer: IndexBufferHandle,
        access: Access,
    },
}

#[derive(Clone, Debug, Default)]
pub struct RenderBind {
    pub slots: [Option<Binding>; MAX_TEXTURE_SAMPLERS],
}

impl RenderBind {
    pub fn with(mut self, stage: usize, binding: Binding) -> Self {
        self.slots[stage] = Some(binding);
        self
    }
}

/// Texture to texture copy executed before the items of `view`.
#[derive(Clone, Copy, Debug)]
pub struct BlitItem {
    pub view: ViewId,
    pub src: TextureHandle,
    pub src_mip: u8,
    pub src_origin: [u32; 3],
    pub dst: TextureHandle,
    pub dst_mip: u8,
    pub dst_origin: [u32; 3],
    pub size: [u32; 3],
}

/// Write applied to a resource at the start of submission.
#[derive(Clone, Debug)]
pub enum ResourceUpdate {
    VertexBuffer {
        handle: VertexBufferHandle,
        offset: u32,
        data: Vec<u8>,
    },
    IndexBuffer {
        handle: IndexBufferHandle,
        offset: u32,
        data: Vec<u8>,
    },
    Texture {
        handle: TextureHandle,
        mip: u8,
        layer: u16,
        origin: [u32; 3],
        size: [u32; 3],
        data: Vec<u8>,
    },
}

#[derive(Clone, Debug)]
pub struct UniformUpdate {
    pub uniform: UniformHandle,
    pub data: Vec<u8>,
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct ResetFlags: u32 {
        const VSYNC = 0x1;
        const MSAA_X2 = 0x2;
        const MSAA_X4 = 0x4;
        const MSAA_X8 = 0x8;
        const MSAA_X16 = 0x10;
        const MSAA_MASK = 0x1e;
        const SRGB_BACKBUFFER = 0x20;
        const FLIP_AFTER_RENDER = 0x40;
    }
}

impl ResetFlags {
    pub fn sample_count(self) -> u32 {
        if self.contains(Self::MSAA_X16) {
            16
        } else if self.contains(Self::MSAA_X8) {
            8
        } else if self.contains(Self::MSAA_X4) {
            4
        } else if self.contains(Self::MSAA_X2) {
            2
        } else {
            1
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub reset: ResetFlags,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            reset: ResetFlags::VSYNC,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct DebugFlags: u32 {
        const WIREFRAME = 0x1;
        const PROFILER = 0x2;
    }
}

//=============================================================================
// Sort key
//=============================================================================

const VIEW_SHIFT: u32 = 56;
const DRAW_BIT: u64 = 1 << 55;
const SEQ_MASK: u64 = (1 << 20) - 1;
const PROGRAM_MASK: u64 = (1 << 9) - 1;
const BLEND_MASK: u64 = 0x3;

/// Submission order of an item, packed into one integer.
///
/// The view occupies the top byte so items of a view are contiguous. Below
/// it a draw bit places compute items ahead of draws within the same view.
/// The rest depends on the view's [`ViewMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub view: ViewId,
    pub is_draw: bool,
    /// Translucency class, 0 for opaque.
    pub blend: u8,
    pub program: u16,
    pub depth: u32,
    pub seq: u32,
}

impl SortKey {
    pub fn encode(&self, mode: ViewMode) -> u64 {
        let view = (self.view as u64 & 0xff) << VIEW_SHIFT;
        let seq = self.seq as u64 & SEQ_MASK;
        let program = self.program as u64 & PROGRAM_MASK;
        let blend = self.blend as u64 & BLEND_MASK;
        let depth = self.depth as u64;
        if !self.is_draw {
            return view | seq << 20 | program;
        }
        let rest = match mode {
            ViewMode::Default => blend << 53 | program << 44 | depth << 12 | (seq & 0xfff),
            ViewMode::Sequential => seq << 35 | blend << 33 | program << 24,
            ViewMode::DepthAscending => depth << 23 | blend << 21 | program << 12 | (seq & 0xfff),
            ViewMode::DepthDescending => {
                (!self.depth as u64) << 23 | blend << 21 | program << 12 | (seq & 0xfff)
            }
        };
        view | DRAW_BIT | rest
    }

    /// Recovers the fields a key of `mode` carries. Bits the mode does not
    /// encode come back as zero.
    pub fn decode(key: u64, mode: ViewMode) -> Self {
        let view = (key >> VIEW_SHIFT) as ViewId;
        let is_draw = key & DRAW_BIT != 0;
        if !is_draw {
            return Self {
                view,
                is_draw,
                blend: 0,
                program: (key & PROGRAM_MASK) as u16,
                depth: 0,
                seq: ((key >> 20) & SEQ_MASK) as u32,
            };
        }
        let (blend, program, depth, seq) = match mode {
            ViewMode::Default => (
                (key >> 53) & BLEND_MASK,
                (key >> 44) & PROGRAM_MASK,
                (key >> 12) & 0xffff_ffff,
                key & 0xfff,
            ),
            ViewMode::Sequential => (
                (key >> 33) & BLEND_MASK,
                (key >> 24) & PROGRAM_MASK,
                0,
                (key >> 35) & SEQ_MASK,
            ),
            ViewMode::DepthAscending => (
                (key >> 21) & BLEND_MASK,
                (key >> 12) & PROGRAM_MASK,
                (key >> 23) & 0xffff_ffff,
                key & 0xfff,
            ),
            ViewMode::DepthDescending => (
                (key >> 21) & BLEND_MASK,
                (key >> 12) & PROGRAM_MASK,
                !((key >> 23) & 0xffff_ffff) & 0xffff_ffff,
                key & 0xfff,
            ),
        };
        Self {
            view,
            is_draw,
            blend: blend as u8,
            program: program as u16,
            depth: depth as u32,
            seq: seq as u32,
        }
    }
}

/// Maps a float depth onto an unsigned integer with the same ordering.
pub fn depth_to_key(depth: f32) -> u32 {
    let bits = depth.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Item of a frame after sorting.
#[derive(Clone, Debug)]
pub struct SubmitItem {
    pub key: u64,
    pub view: ViewId,
    pub item: RenderItem,
    pub bind: RenderBind,
}

//=============================================================================
// Frame
//=============================================================================

#[derive(Clone, Debug)]
pub struct Frame {
    pub views: Vec<View>,
    pub items: Vec<SubmitItem>,
    pub blits: Vec<BlitItem>,
    pub matrix_cache: Vec<mint::ColumnMatrix4<f32>>,
    pub rect_cache: Vec<Rect>,
    pub uniforms: Vec<UniformUpdate>,
    pub updates: Vec<ResourceUpdate>,
    pub color_palette: [[f32; 4]; MAX_COLOR_PALETTE],
    pub resolution: Resolution,
    pub debug: DebugFlags,
    seq: Vec<u32>,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    pub fn new() -> Self {
        Self {
            views: Vec::new(),
            items: Vec::new(),
            blits: Vec::new(),
            matrix_cache: vec![glam::Mat4::IDENTITY.into()],
            rect_cache: Vec::new(),
            uniforms: Vec::new(),
            updates: Vec::new(),
            color_palette: [[0.0; 4]; MAX_COLOR_PALETTE],
            resolution: Resolution::default(),
            debug: DebugFlags::empty(),
            seq: Vec::new(),
        }
    }

    /// Returns a mutable view, growing the view table as needed.
    pub fn view_mut(&mut self, id: ViewId) -> &mut View {
        let index = id as usize;
        assert!(index < MAX_VIEWS, "view {} out of range", id);
        if self.views.len() <= index {
            self.views.resize_with(index + 1, View::default);
        }
        &mut self.views[index]
    }

    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.views.get(id as usize)
    }

    /// Appends a transform and returns its cache index.
    pub fn add_transform(&mut self, matrix: mint::ColumnMatrix4<f32>) -> u32 {
        self.matrix_cache.push(matrix);
        (self.matrix_cache.len() - 1) as u32
    }

    /// Appends a scissor rectangle and returns its cache index.
    pub fn add_scissor(&mut self, rect: Rect) -> u16 {
        self.rect_cache.push(rect);
        (self.rect_cache.len() - 1) as u16
    }

    /// Records a uniform value and returns the range a draw must reference.
    pub fn set_uniform(&mut self, uniform: UniformHandle, data: &[u8]) -> Range<u32> {
        let start = self.uniforms.len() as u32;
        self.uniforms.push(UniformUpdate {
            uniform,
            data: data.to_vec(),
        });
        start..start + 1
    }

    fn next_seq(&mut self, view: ViewId) -> u32 {
        let index = view as usize;
        if self.seq.len() <= index {
            self.seq.resize(index + 1, 0);
        }
        let seq = self.seq[index];
        self.seq[index] += 1;
        seq
    }

    pub fn submit(&mut self, view: ViewId, draw: RenderDraw, bind: RenderBind, depth: f32) {
        let seq = self.next_seq(view);
        let blend = if draw.state.intersects(State::BLEND_MASK) { 1 } else { 0 };
        let key = SortKey {
            view,
            is_draw: true,
            blend,
            program: program_sort_id(draw.program),
            depth: depth_to_key(depth),
            seq,
        };
        let mode = self.view_mut(view).mode;
        self.items.push(SubmitItem {
            key: key.encode(mode),
            view,
            item: RenderItem::Draw(draw),
            bind,
        });
    }

    /// Makes sure `view` is processed, so its clear happens even without
    /// draws.
    pub fn touch(&mut self, view: ViewId) {
        self.submit(
            view,
            RenderDraw::new(ProgramHandle::default()),
            RenderBind::default(),
            0.0,
        );
    }

    pub fn dispatch(&mut self, view: ViewId, compute: RenderCompute, bind: RenderBind) {
        let seq = self.next_seq(view);
        let key = SortKey {
            view,
            is_draw: false,
            blend: 0,
            program: program_sort_id(compute.program),
            depth: 0,
            seq,
        };
        let mode = self.view_mut(view).mode;
        self.items.push(SubmitItem {
            key: key.encode(mode),
            view,
            item: RenderItem::Compute(compute),
            bind,
        });
    }

    pub fn blit(&mut self, blit: BlitItem) {
        self.blits.push(blit);
    }

    /// Orders items and blits for submission.
    pub fn sort(&mut self) {
        self.items.sort_by_key(|item| item.key);
        self.blits.sort_by_key(|blit| blit.view);
    }

    pub fn is_sorted(&self) -> bool {
        self.items.windows(2).all(|pair| pair[0].key <= pair[1].key)
    }
}

fn program_sort_id(program: ProgramHandle) -> u16 {
    use slotmap::Key as _;
    (program.data().as_ffi() as u32 & PROGRAM_MASK as u32) as u16
}
