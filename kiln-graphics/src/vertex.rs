//! Vertex attributes and layouts.

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::hash::Murmur2A;

/// Vertex attribute semantic.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, EnumCount, EnumIter)]
pub enum Attrib {
    Position,
    Normal,
    Tangent,
    Bitangent,
    Color0,
    Color1,
    Color2,
    Color3,
    Indices,
    Weight,
    TexCoord0,
    TexCoord1,
    TexCoord2,
    TexCoord3,
    TexCoord4,
    TexCoord5,
    TexCoord6,
    TexCoord7,
}

impl Attrib {
    /// Stable id of the attribute in shader binaries.
    pub fn id(self) -> u16 {
        match self {
            Self::Position => 0x0001,
            Self::Normal => 0x0002,
            Self::Tangent => 0x0003,
            Self::Bitangent => 0x0004,
            Self::Color0 => 0x0005,
            Self::Color1 => 0x0006,
            Self::Color2 => 0x0018,
            Self::Color3 => 0x0019,
            Self::Indices => 0x000e,
            Self::Weight => 0x000f,
            Self::TexCoord0 => 0x0010,
            Self::TexCoord1 => 0x0011,
            Self::TexCoord2 => 0x0012,
            Self::TexCoord3 => 0x0013,
            Self::TexCoord4 => 0x0014,
            Self::TexCoord5 => 0x0015,
            Self::TexCoord6 => 0x0016,
            Self::TexCoord7 => 0x0017,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::iter().find(|attrib| attrib.id() == id)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum AttribType {
    Uint8,
    Uint10,
    Int16,
    Half,
    Float,
}

impl AttribType {
    /// Size in bytes of `num` components, padded the way the GPU reads them.
    pub fn size(self, num: u8) -> u16 {
        let index = (num.clamp(1, 4) - 1) as usize;
        let sizes: [u16; 4] = match self {
            Self::Uint8 => [1, 2, 4, 4],
            Self::Uint10 => [4, 4, 4, 4],
            Self::Int16 | Self::Half => [2, 4, 8, 8],
            Self::Float => [4, 8, 12, 16],
        };
        sizes[index]
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct AttribDesc {
    pub num: u8,
    pub ty: AttribType,
    pub normalized: bool,
    pub as_int: bool,
    pub offset: u16,
}

impl AttribDesc {
    pub fn format(&self) -> wgpu::VertexFormat {
        use wgpu::VertexFormat as Vf;
        let wide = self.num > 2;
        match self.ty {
            AttribType::Uint8 if self.normalized => {
                if wide {
                    Vf::Unorm8x4
                } else {
                    Vf::Unorm8x2
                }
            }
            AttribType::Uint8 => {
                if wide {
                    Vf::Uint8x4
                } else {
                    Vf::Uint8x2
                }
            }
            AttribType::Uint10 => Vf::Unorm10_10_10_2,
            AttribType::Int16 if self.normalized => {
                if wide {
                    Vf::Snorm16x4
                } else {
                    Vf::Snorm16x2
                }
            }
            AttribType::Int16 => {
                if wide {
                    Vf::Sint16x4
                } else {
                    Vf::Sint16x2
                }
            }
            AttribType::Half => {
                if wide {
                    Vf::Float16x4
                } else {
                    Vf::Float16x2
                }
            }
            AttribType::Float => match self.num {
                1 => Vf::Float32,
                2 => Vf::Float32x2,
                3 => Vf::Float32x3,
                _ => Vf::Float32x4,
            },
        }
    }
}

/// Layout of one vertex stream.
///
/// ```
/// use kiln_graphics::{Attrib, AttribType, VertexLayout};
/// let layout = VertexLayout::builder()
///     .add(Attrib::Position, 3, AttribType::Float)
///     .add_normalized(Attrib::Color0, 4, AttribType::Uint8)
///     .end();
/// assert_eq!(layout.stride(), 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexLayout {
    hash: u32,
    stride: u16,
    attributes: [Option<AttribDesc>; Attrib::COUNT],
}

impl VertexLayout {
    pub fn builder() -> VertexLayoutBuilder {
        VertexLayoutBuilder {
            stride: 0,
            attributes: [None; Attrib::COUNT],
        }
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn stride(&self) -> u16 {
        self.stride
    }

    pub fn attribute(&self, attrib: Attrib) -> Option<&AttribDesc> {
        self.attributes[attrib as usize].as_ref()
    }

    pub fn has(&self, attrib: Attrib) -> bool {
        self.attributes[attrib as usize].is_some()
    }

    pub fn attributes(&self) -> impl Iterator<Item = (Attrib, &AttribDesc)> + '_ {
        Attrib::iter().filter_map(move |attrib| self.attribute(attrib).map(|desc| (attrib, desc)))
    }

    /// Drops the attributes `consumed` rejects. The stride is kept so the
    /// remaining offsets still address the same buffer.
    pub fn masked(&self, consumed: impl Fn(Attrib) -> bool) -> Self {
        let mut attributes = self.attributes;
        for attrib in Attrib::iter() {
            if !consumed(attrib) {
                attributes[attrib as usize] = None;
            }
        }
        let mut layout = Self {
            hash: 0,
            stride: self.stride,
            attributes,
        };
        layout.hash = layout.compute_hash();
        layout
    }

    fn compute_hash(&self) -> u32 {
        let mut murmur = Murmur2A::new();
        murmur.add_u16(self.stride);
        for (attrib, desc) in self.attributes() {
            murmur.add_u16(attrib.id());
            murmur.add_u8(desc.num);
            murmur.add_u8(desc.ty as u8);
            murmur.add_u8(desc.normalized as u8 | (desc.as_int as u8) << 1);
            murmur.add_u16(desc.offset);
        }
        murmur.end()
    }
}

pub struct VertexLayoutBuilder {
    stride: u16,
    attributes: [Option<AttribDesc>; Attrib::COUNT],
}

impl VertexLayoutBuilder {
    pub fn add(self, attrib: Attrib, num: u8, ty: AttribType) -> Self {
        self.add_ext(attrib, num, ty, false, false)
    }

    pub fn add_normalized(self, attrib: Attrib, num: u8, ty: AttribType) -> Self {
        self.add_ext(attrib, num, ty, true, false)
    }

    pub fn add_ext(
        mut self,
        attrib: Attrib,
        num: u8,
        ty: AttribType,
        normalized: bool,
        as_int: bool,
    ) -> Self {
        let num = num.clamp(1, 4);
        self.attributes[attrib as usize] = Some(AttribDesc {
            num,
            ty,
            normalized,
            as_int,
            offset: self.stride,
        });
        self.stride += ty.size(num);
        self
    }

    pub fn skip(mut self, bytes: u16) -> Self {
        self.stride += bytes;
        self
    }

    pub fn end(self) -> VertexLayout {
        let mut layout = VertexLayout {
            hash: 0,
            stride: self.stride,
            attributes: self.attributes,
        };
        layout.hash = layout.compute_hash();
        layout
    }
}
