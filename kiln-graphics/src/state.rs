//! Packed render, stencil and sampler state.
//!
//! Draw items carry loosely typed 64-bit state words. Fields are decoded
//! here and mapped onto wgpu enums when pipelines and samplers are built.

bitflags::bitflags! {
    /// Render state of a draw: write mask, depth test, blending, culling,
    /// primitive type and rasterization flags.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct State: u64 {
        const WRITE_R = 0x1;
        const WRITE_G = 0x2;
        const WRITE_B = 0x4;
        const WRITE_A = 0x8;
        const WRITE_Z = 1 << 38;
        const WRITE_RGB = Self::WRITE_R.bits() | Self::WRITE_G.bits() | Self::WRITE_B.bits();
        const WRITE_MASK = Self::WRITE_RGB.bits() | Self::WRITE_A.bits() | Self::WRITE_Z.bits();

        const DEPTH_TEST_LESS = 1 << 4;
        const DEPTH_TEST_LEQUAL = 2 << 4;
        const DEPTH_TEST_EQUAL = 3 << 4;
        const DEPTH_TEST_GEQUAL = 4 << 4;
        const DEPTH_TEST_GREATER = 5 << 4;
        const DEPTH_TEST_NOTEQUAL = 6 << 4;
        const DEPTH_TEST_NEVER = 7 << 4;
        const DEPTH_TEST_ALWAYS = 8 << 4;
        const DEPTH_TEST_MASK = 0xf << 4;

        const BLEND_MASK = 0xffff << 12;
        const BLEND_EQUATION_MASK = 0x3f << 28;
        const BLEND_INDEPENDENT = 1 << 34;
        const BLEND_ALPHA_TO_COVERAGE = 1 << 35;

        const CULL_CW = 1 << 36;
        const CULL_CCW = 2 << 36;
        const CULL_MASK = 0x3 << 36;
        const FRONT_CCW = 1 << 39;

        const ALPHA_REF_MASK = 0xff << 40;

        const PT_TRISTRIP = 1 << 48;
        const PT_LINES = 2 << 48;
        const PT_LINESTRIP = 3 << 48;
        const PT_POINTS = 4 << 48;
        const PT_MASK = 0x7 << 48;

        const POINT_SIZE_MASK = 0xf << 52;

        const MSAA = 1 << 56;
        const LINEAA = 1 << 57;
        const CONSERVATIVE_RASTER = 1 << 58;
    }
}

const BLEND_SHIFT: u32 = 12;
const BLEND_EQUATION_SHIFT: u32 = 28;
const ALPHA_REF_SHIFT: u32 = 40;
const POINT_SIZE_SHIFT: u32 = 52;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum BlendFactor {
    Zero = 1,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
    SrcAlphaSat,
    Factor,
    InvFactor,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum BlendEquation {
    Add = 0,
    Sub,
    RevSub,
    Min,
    Max,
}

/// Primitive topology stored in [`State::PT_MASK`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PrimitiveType {
    TriList,
    TriStrip,
    Lines,
    LineStrip,
    Points,
}

impl PrimitiveType {
    /// Number of primitives produced by `count` vertices or indices.
    pub fn primitive_count(self, count: u32) -> u32 {
        match self {
            Self::TriList => count / 3,
            Self::TriStrip => count.saturating_sub(2),
            Self::Lines => count / 2,
            Self::LineStrip => count.saturating_sub(1),
            Self::Points => count,
        }
    }
}

impl State {
    /// Opaque, depth tested, back-face culled.
    pub const DEFAULT: Self = Self::from_bits_retain(
        Self::WRITE_RGB.bits()
            | Self::WRITE_A.bits()
            | Self::WRITE_Z.bits()
            | Self::DEPTH_TEST_LESS.bits()
            | Self::CULL_CW.bits()
            | Self::MSAA.bits(),
    );

    pub const BLEND_ALPHA: Self = Self::blend_func(BlendFactor::SrcAlpha, BlendFactor::InvSrcAlpha);
    pub const BLEND_ADD: Self = Self::blend_func(BlendFactor::One, BlendFactor::One);

    /// Bits that affect pipeline compatibility. Alpha reference and point
    /// size are shader-side values and stay out of pipeline keys.
    pub const COMPATIBILITY_MASK: Self = Self::from_bits_retain(
        Self::WRITE_MASK.bits()
            | Self::DEPTH_TEST_MASK.bits()
            | Self::BLEND_MASK.bits()
            | Self::BLEND_EQUATION_MASK.bits()
            | Self::BLEND_INDEPENDENT.bits()
            | Self::BLEND_ALPHA_TO_COVERAGE.bits()
            | Self::CULL_MASK.bits()
            | Self::FRONT_CCW.bits()
            | Self::PT_MASK.bits()
            | Self::MSAA.bits()
            | Self::LINEAA.bits()
            | Self::CONSERVATIVE_RASTER.bits(),
    );

    pub const fn blend_func_separate(
        src_rgb: BlendFactor,
        dst_rgb: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    ) -> Self {
        let packed = (src_rgb as u64)
            | (dst_rgb as u64) << 4
            | (src_alpha as u64) << 8
            | (dst_alpha as u64) << 12;
        Self::from_bits_retain(packed << BLEND_SHIFT)
    }

    pub const fn blend_func(src: BlendFactor, dst: BlendFactor) -> Self {
        Self::blend_func_separate(src, dst, src, dst)
    }

    pub const fn blend_equation_separate(rgb: BlendEquation, alpha: BlendEquation) -> Self {
        Self::from_bits_retain(((rgb as u64) | (alpha as u64) << 3) << BLEND_EQUATION_SHIFT)
    }

    pub const fn blend_equation(equation: BlendEquation) -> Self {
        Self::blend_equation_separate(equation, equation)
    }

    pub const fn alpha_ref(value: u8) -> Self {
        Self::from_bits_retain((value as u64) << ALPHA_REF_SHIFT)
    }

    pub const fn point_size(value: u8) -> Self {
        Self::from_bits_retain(((value & 0xf) as u64) << POINT_SIZE_SHIFT)
    }

    pub fn alpha_ref_value(self) -> u8 {
        ((self.bits() & Self::ALPHA_REF_MASK.bits()) >> ALPHA_REF_SHIFT) as u8
    }

    pub fn color_writes(self) -> wgpu::ColorWrites {
        let mut writes = wgpu::ColorWrites::empty();
        writes.set(wgpu::ColorWrites::RED, self.contains(Self::WRITE_R));
        writes.set(wgpu::ColorWrites::GREEN, self.contains(Self::WRITE_G));
        writes.set(wgpu::ColorWrites::BLUE, self.contains(Self::WRITE_B));
        writes.set(wgpu::ColorWrites::ALPHA, self.contains(Self::WRITE_A));
        writes
    }

    /// Depth comparison, `None` when the depth test is disabled.
    pub fn depth_compare(self) -> Option<wgpu::CompareFunction> {
        let func = ((self.bits() & Self::DEPTH_TEST_MASK.bits()) >> 4) as u8;
        map_compare_function(func)
    }

    pub fn cull_mode(self) -> Option<wgpu::Face> {
        match (self & Self::CULL_MASK).bits() >> 36 {
            1 => Some(wgpu::Face::Front),
            2 => Some(wgpu::Face::Back),
            _ => None,
        }
    }

    pub fn front_face(self) -> wgpu::FrontFace {
        if self.contains(Self::FRONT_CCW) {
            wgpu::FrontFace::Ccw
        } else {
            wgpu::FrontFace::Cw
        }
    }

    pub fn primitive(self) -> PrimitiveType {
        match (self & Self::PT_MASK).bits() >> 48 {
            1 => PrimitiveType::TriStrip,
            2 => PrimitiveType::Lines,
            3 => PrimitiveType::LineStrip,
            4 => PrimitiveType::Points,
            _ => PrimitiveType::TriList,
        }
    }

    pub fn topology(self) -> wgpu::PrimitiveTopology {
        match self.primitive() {
            PrimitiveType::TriList => wgpu::PrimitiveTopology::TriangleList,
            PrimitiveType::TriStrip => wgpu::PrimitiveTopology::TriangleStrip,
            PrimitiveType::Lines => wgpu::PrimitiveTopology::LineList,
            PrimitiveType::LineStrip => wgpu::PrimitiveTopology::LineStrip,
            PrimitiveType::Points => wgpu::PrimitiveTopology::PointList,
        }
    }

    pub fn is_strip(self) -> bool {
        matches!(
            self.primitive(),
            PrimitiveType::TriStrip | PrimitiveType::LineStrip
        )
    }

    /// Blend state of color target `index`.
    ///
    /// With [`State::BLEND_INDEPENDENT`], targets past the first take their
    /// factors and equation from 11-bit groups of `rgba`.
    pub fn blend(self, rgba: u32, index: usize) -> Option<wgpu::BlendState> {
        let blend = ((self.bits() & Self::BLEND_MASK.bits()) >> BLEND_SHIFT) as u32;
        let equation =
            ((self.bits() & Self::BLEND_EQUATION_MASK.bits()) >> BLEND_EQUATION_SHIFT) as u32;

        if index > 0 && self.contains(Self::BLEND_INDEPENDENT) {
            let packed = rgba >> (11 * (index as u32 - 1));
            let src = (packed & 0xf) as u8;
            let dst = ((packed >> 4) & 0xf) as u8;
            let eq = ((packed >> 8) & 0x7) as u8;
            if src == 0 && dst == 0 {
                return None;
            }
            let component = wgpu::BlendComponent {
                src_factor: map_blend_factor(src),
                dst_factor: map_blend_factor(dst),
                operation: map_blend_operation(eq),
            };
            return Some(wgpu::BlendState {
                color: component,
                alpha: component,
            });
        }

        if blend == 0 {
            return None;
        }
        Some(wgpu::BlendState {
            color: wgpu::BlendComponent {
                src_factor: map_blend_factor((blend & 0xf) as u8),
                dst_factor: map_blend_factor(((blend >> 4) & 0xf) as u8),
                operation: map_blend_operation((equation & 0x7) as u8),
            },
            alpha: wgpu::BlendComponent {
                src_factor: map_blend_factor(((blend >> 8) & 0xf) as u8),
                dst_factor: map_blend_factor(((blend >> 12) & 0xf) as u8),
                operation: map_blend_operation(((equation >> 3) & 0x7) as u8),
            },
        })
    }

    /// True when blending reads the blend constant.
    pub fn uses_blend_factor(self) -> bool {
        let blend = (self.bits() & Self::BLEND_MASK.bits()) >> BLEND_SHIFT;
        (0..4).any(|i| {
            let factor = ((blend >> (i * 4)) & 0xf) as u8;
            factor == BlendFactor::Factor as u8 || factor == BlendFactor::InvFactor as u8
        })
    }
}

fn map_blend_factor(factor: u8) -> wgpu::BlendFactor {
    match factor {
        1 => wgpu::BlendFactor::Zero,
        2 => wgpu::BlendFactor::One,
        3 => wgpu::BlendFactor::Src,
        4 => wgpu::BlendFactor::OneMinusSrc,
        5 => wgpu::BlendFactor::SrcAlpha,
        6 => wgpu::BlendFactor::OneMinusSrcAlpha,
        7 => wgpu::BlendFactor::DstAlpha,
        8 => wgpu::BlendFactor::OneMinusDstAlpha,
        9 => wgpu::BlendFactor::Dst,
        10 => wgpu::BlendFactor::OneMinusDst,
        11 => wgpu::BlendFactor::SrcAlphaSaturated,
        12 => wgpu::BlendFactor::Constant,
        13 => wgpu::BlendFactor::OneMinusConstant,
        _ => wgpu::BlendFactor::One,
    }
}

fn map_blend_operation(equation: u8) -> wgpu::BlendOperation {
    match equation {
        1 => wgpu::BlendOperation::Subtract,
        2 => wgpu::BlendOperation::ReverseSubtract,
        3 => wgpu::BlendOperation::Min,
        4 => wgpu::BlendOperation::Max,
        _ => wgpu::BlendOperation::Add,
    }
}

/// Maps a 4-bit comparison field (1 = less .. 8 = always).
pub(crate) fn map_compare_function(func: u8) -> Option<wgpu::CompareFunction> {
    Some(match func {
        1 => wgpu::CompareFunction::Less,
        2 => wgpu::CompareFunction::LessEqual,
        3 => wgpu::CompareFunction::Equal,
        4 => wgpu::CompareFunction::GreaterEqual,
        5 => wgpu::CompareFunction::Greater,
        6 => wgpu::CompareFunction::NotEqual,
        7 => wgpu::CompareFunction::Never,
        8 => wgpu::CompareFunction::Always,
        _ => return None,
    })
}

//=============================================================================
// Stencil
//=============================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum StencilTest {
    Less = 1,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
    Never,
    Always,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[repr(u8)]
pub enum StencilOp {
    Zero = 0,
    Keep,
    Replace,
    Incr,
    IncrSat,
    Decr,
    DecrSat,
    Invert,
}

fn map_stencil_op(op: u32) -> wgpu::StencilOperation {
    match op {
        0 => wgpu::StencilOperation::Zero,
        2 => wgpu::StencilOperation::Replace,
        3 => wgpu::StencilOperation::IncrementWrap,
        4 => wgpu::StencilOperation::IncrementClamp,
        5 => wgpu::StencilOperation::DecrementWrap,
        6 => wgpu::StencilOperation::DecrementClamp,
        7 => wgpu::StencilOperation::Invert,
        _ => wgpu::StencilOperation::Keep,
    }
}

/// Front face in the low 32 bits, back face in the high 32 bits.
/// Each face packs reference, read mask, test and three operations.
/// A zero back face mirrors the front face.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub struct Stencil(pub u64);

const STENCIL_FUNC_REF_MASK: u32 = 0xff;
const STENCIL_FUNC_RMASK_SHIFT: u32 = 8;
const STENCIL_TEST_SHIFT: u32 = 16;
const STENCIL_OP_FAIL_S_SHIFT: u32 = 20;
const STENCIL_OP_FAIL_Z_SHIFT: u32 = 24;
const STENCIL_OP_PASS_Z_SHIFT: u32 = 28;

impl Stencil {
    pub const NONE: Self = Self(0);

    pub const fn face(
        test: StencilTest,
        reference: u8,
        read_mask: u8,
        fail_stencil: StencilOp,
        fail_depth: StencilOp,
        pass: StencilOp,
    ) -> u32 {
        reference as u32
            | (read_mask as u32) << STENCIL_FUNC_RMASK_SHIFT
            | (test as u32) << STENCIL_TEST_SHIFT
            | (fail_stencil as u32) << STENCIL_OP_FAIL_S_SHIFT
            | (fail_depth as u32) << STENCIL_OP_FAIL_Z_SHIFT
            | (pass as u32) << STENCIL_OP_PASS_Z_SHIFT
    }

    pub const fn new(front: u32, back: u32) -> Self {
        Self(front as u64 | (back as u64) << 32)
    }

    pub fn is_enabled(self) -> bool {
        self.0 != 0
    }

    pub fn front(self) -> u32 {
        self.0 as u32
    }

    pub fn back(self) -> u32 {
        match (self.0 >> 32) as u32 {
            0 => self.front(),
            back => back,
        }
    }

    /// Reference value, bound at draw time rather than baked in pipelines.
    pub fn reference(self) -> u32 {
        self.front() & STENCIL_FUNC_REF_MASK
    }

    /// Stencil bits with both reference values cleared.
    pub fn without_reference(self) -> Self {
        let mask = !(STENCIL_FUNC_REF_MASK as u64 | (STENCIL_FUNC_REF_MASK as u64) << 32);
        Self(self.0 & mask)
    }

    pub fn read_mask(self) -> u32 {
        (self.front() >> STENCIL_FUNC_RMASK_SHIFT) & 0xff
    }

    pub fn face_state(face: u32) -> wgpu::StencilFaceState {
        wgpu::StencilFaceState {
            compare: map_compare_function(((face >> STENCIL_TEST_SHIFT) & 0xf) as u8)
                .unwrap_or(wgpu::CompareFunction::Always),
            fail_op: map_stencil_op((face >> STENCIL_OP_FAIL_S_SHIFT) & 0xf),
            depth_fail_op: map_stencil_op((face >> STENCIL_OP_FAIL_Z_SHIFT) & 0xf),
            pass_op: map_stencil_op((face >> STENCIL_OP_PASS_Z_SHIFT) & 0xf),
        }
    }

    pub fn state(self) -> wgpu::StencilState {
        if !self.is_enabled() {
            return wgpu::StencilState::default();
        }
        wgpu::StencilState {
            front: Self::face_state(self.front()),
            back: Self::face_state(self.back()),
            read_mask: self.read_mask(),
            write_mask: 0xff,
        }
    }
}

//=============================================================================
// Sampler
//=============================================================================

bitflags::bitflags! {
    /// Sampler state flags; `BITS_MASK` covers the fields that describe a
    /// native sampler object.
    #[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
    pub struct SamplerFlags: u32 {
        const U_MIRROR = 1;
        const U_CLAMP = 2;
        const U_BORDER = 3;
        const U_MASK = 0x3;
        const V_MIRROR = 1 << 2;
        const V_CLAMP = 2 << 2;
        const V_BORDER = 3 << 2;
        const V_MASK = 0x3 << 2;
        const W_MIRROR = 1 << 4;
        const W_CLAMP = 2 << 4;
        const W_BORDER = 3 << 4;
        const W_MASK = 0x3 << 4;
        const UVW_CLAMP = Self::U_CLAMP.bits() | Self::V_CLAMP.bits() | Self::W_CLAMP.bits();

        const MIN_POINT = 1 << 6;
        const MIN_ANISOTROPIC = 2 << 6;
        const MIN_MASK = 0x3 << 6;
        const MAG_POINT = 1 << 8;
        const MAG_ANISOTROPIC = 2 << 8;
        const MAG_MASK = 0x3 << 8;
        const MIP_POINT = 1 << 10;
        const MIP_MASK = 1 << 10;
        const POINT = Self::MIN_POINT.bits() | Self::MAG_POINT.bits() | Self::MIP_POINT.bits();

        const COMPARE_LESS = 1 << 16;
        const COMPARE_LEQUAL = 2 << 16;
        const COMPARE_EQUAL = 3 << 16;
        const COMPARE_GEQUAL = 4 << 16;
        const COMPARE_GREATER = 5 << 16;
        const COMPARE_NOTEQUAL = 6 << 16;
        const COMPARE_NEVER = 7 << 16;
        const COMPARE_ALWAYS = 8 << 16;
        const COMPARE_MASK = 0xf << 16;

        /// Use the sampler flags the texture was created with.
        const INTERNAL_DEFAULT = 1 << 28;

        const BITS_MASK = Self::U_MASK.bits()
            | Self::V_MASK.bits()
            | Self::W_MASK.bits()
            | Self::MIN_MASK.bits()
            | Self::MAG_MASK.bits()
            | Self::MIP_MASK.bits()
            | Self::COMPARE_MASK.bits();
    }
}

fn map_address_mode(mode: u32) -> wgpu::AddressMode {
    match mode {
        1 => wgpu::AddressMode::MirrorRepeat,
        2 => wgpu::AddressMode::ClampToEdge,
        3 => wgpu::AddressMode::ClampToBorder,
        _ => wgpu::AddressMode::Repeat,
    }
}

fn map_filter_mode(mode: u32) -> wgpu::FilterMode {
    match mode {
        1 => wgpu::FilterMode::Nearest,
        _ => wgpu::FilterMode::Linear,
    }
}

impl SamplerFlags {
    /// Only the bits that describe a native sampler.
    pub fn masked(self) -> Self {
        self & Self::BITS_MASK
    }

    pub fn compare(self) -> Option<wgpu::CompareFunction> {
        map_compare_function(((self.bits() & Self::COMPARE_MASK.bits()) >> 16) as u8)
    }

    pub fn is_anisotropic(self) -> bool {
        (self & Self::MIN_MASK) == Self::MIN_ANISOTROPIC
    }

    pub(crate) fn address_modes(self) -> [wgpu::AddressMode; 3] {
        let bits = self.bits();
        [
            map_address_mode(bits & 0x3),
            map_address_mode((bits >> 2) & 0x3),
            map_address_mode((bits >> 4) & 0x3),
        ]
    }

    pub(crate) fn filters(self) -> (wgpu::FilterMode, wgpu::FilterMode, wgpu::MipmapFilterMode) {
        let bits = self.bits();
        let mip = match (bits >> 10) & 0x1 {
            1 => wgpu::MipmapFilterMode::Nearest,
            _ => wgpu::MipmapFilterMode::Linear,
        };
        (
            map_filter_mode((bits >> 6) & 0x3),
            map_filter_mode((bits >> 8) & 0x3),
            mip,
        )
    }
}
