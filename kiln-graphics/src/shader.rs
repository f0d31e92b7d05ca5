//! Shader binaries and their reflection.
//!
//! A shader binary is a small little-endian container:
//!
//! | field        | type                | notes                          |
//! |--------------|---------------------|--------------------------------|
//! | magic        | `[u8; 3]` + version | `VSH`, `FSH` or `CSH`          |
//! | hash_in      | `u32`               |                                |
//! | hash_out     | `u32`               | version 6 and later            |
//! | uniforms     | `u16` count + table | see [`UniformInfo`]            |
//! | code         | `u32` size + bytes  | WGSL, followed by one NUL byte |
//! | attributes   | `u8` count + `u16`s | [`Attrib::id`] values          |
//! | size         | `u16`               | constant block size            |
//! | block_size   | `u16`, optional     |                                |

use std::collections::HashMap;

use crate::{
    hash::Murmur2A,
    pool::Pool,
    resource::TextureFormat,
    traits::{Device, ShaderModuleDesc, ShaderModuleKey},
    vertex::Attrib,
    Error, ShaderParseError, UniformHandle, UniformType, MAX_TEXTURE_SAMPLERS,
    MIN_BUFFER_OFFSET_ALIGNMENT,
};

/// Newest binary version understood by the parser.
pub const SHADER_BIN_VERSION: u8 = 11;

/// Binding of the vertex stage constant block.
pub const VERTEX_UNIFORM_BINDING: u32 = 0;
/// Binding of the fragment stage constant block.
pub const FRAGMENT_UNIFORM_BINDING: u32 = 1;
/// Offset between a bind slot and its binding index.
pub const BIND_SHIFT: u16 = 2;
/// Offset between a texture binding and its sampler binding.
pub const SAMPLER_SHIFT: u32 = 16;

const UNIFORM_FRAGMENT_BIT: u8 = 0x10;
const UNIFORM_SAMPLER_BIT: u8 = 0x20;
const UNIFORM_READONLY_BIT: u8 = 0x40;
const UNIFORM_COMPARE_BIT: u8 = 0x80;
const UNIFORM_MASK: u8 = UNIFORM_FRAGMENT_BIT
    | UNIFORM_SAMPLER_BIT
    | UNIFORM_READONLY_BIT
    | UNIFORM_COMPARE_BIT;

const TYPE_SAMPLER: u8 = 0;
const TYPE_END: u8 = 1;
const TYPE_VEC4: u8 = 2;
const TYPE_MAT3: u8 = 3;
const TYPE_MAT4: u8 = 4;

const DESCRIPTOR_STORAGE_IMAGE: u16 = 0x0003;
const DESCRIPTOR_STORAGE_BUFFER: u16 = 0x0007;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn magic(self) -> u8 {
        match self {
            Self::Vertex => b'V',
            Self::Fragment => b'F',
            Self::Compute => b'C',
        }
    }

    pub fn visibility(self) -> wgpu::ShaderStages {
        match self {
            Self::Vertex => wgpu::ShaderStages::VERTEX,
            Self::Fragment => wgpu::ShaderStages::FRAGMENT,
            Self::Compute => wgpu::ShaderStages::COMPUTE,
        }
    }

    fn naga(self) -> naga::ShaderStage {
        match self {
            Self::Vertex => naga::ShaderStage::Vertex,
            Self::Fragment => naga::ShaderStage::Fragment,
            Self::Compute => naga::ShaderStage::Compute,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
        }
    }
}

//=============================================================================
// Binary format
//=============================================================================

/// One row of the uniform table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformInfo {
    pub name: String,
    /// Base type in the low nibble, flag bits in the high one.
    pub ty: u8,
    pub num: u8,
    pub reg_index: u16,
    pub reg_count: u16,
    pub tex_component: u8,
    pub tex_dimension: u8,
    pub tex_format: u16,
}

impl UniformInfo {
    fn base_type(&self) -> u8 {
        self.ty & !UNIFORM_MASK
    }

    pub fn is_read_only(&self) -> bool {
        self.ty & UNIFORM_READONLY_BIT != 0
    }

    pub fn is_compare(&self) -> bool {
        self.ty & UNIFORM_COMPARE_BIT != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderBinary {
    pub stage: ShaderStage,
    pub version: u8,
    pub hash_in: u32,
    pub hash_out: u32,
    pub uniforms: Vec<UniformInfo>,
    pub code: String,
    /// Attribute ids in shader input order.
    pub attributes: Vec<u16>,
    pub size: u16,
    pub block_size: Option<u16>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, count: usize) -> Result<&'a [u8], ShaderParseError> {
        let end = self.pos + count;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(ShaderParseError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ShaderParseError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ShaderParseError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ShaderParseError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }
}

impl ShaderBinary {
    pub fn parse(data: &[u8]) -> Result<Self, ShaderParseError> {
        let mut reader = Reader { data, pos: 0 };
        let magic = reader.bytes(4)?;
        let magic = [magic[0], magic[1], magic[2], magic[3]];
        let stage = match &magic[..3] {
            b"VSH" => ShaderStage::Vertex,
            b"FSH" => ShaderStage::Fragment,
            b"CSH" => ShaderStage::Compute,
            _ => return Err(ShaderParseError::BadMagic(magic)),
        };
        let version = magic[3];
        if version == 0 || version > SHADER_BIN_VERSION {
            return Err(ShaderParseError::UnsupportedVersion(version));
        }

        let hash_in = reader.u32()?;
        let hash_out = if version >= 6 { reader.u32()? } else { hash_in };

        let count = reader.u16()?;
        let mut uniforms = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_size = reader.u8()? as usize;
            let name = std::str::from_utf8(reader.bytes(name_size)?)
                .map_err(|_| ShaderParseError::NotUtf8)?
                .to_string();
            let ty = reader.u8()?;
            let num = reader.u8()?;
            let reg_index = reader.u16()?;
            let reg_count = reader.u16()?;
            let (tex_component, tex_dimension) = if version >= 8 {
                (reader.u8()?, reader.u8()?)
            } else {
                (0, 0)
            };
            let tex_format = if version >= 10 { reader.u16()? } else { 0 };
            uniforms.push(UniformInfo {
                name,
                ty,
                num,
                reg_index,
                reg_count,
                tex_component,
                tex_dimension,
                tex_format,
            });
        }

        let code_size = reader.u32()? as usize;
        let code = std::str::from_utf8(reader.bytes(code_size)?)
            .map_err(|_| ShaderParseError::NotUtf8)?
            .to_string();
        reader.bytes(1)?;

        let num_attrs = reader.u8()?;
        let mut attributes = Vec::with_capacity(num_attrs as usize);
        for _ in 0..num_attrs {
            attributes.push(reader.u16()?);
        }

        let size = reader.u16()?;
        let block_size = if reader.remaining() >= 2 {
            Some(reader.u16()?)
        } else {
            None
        };

        Ok(Self {
            stage,
            version,
            hash_in,
            hash_out,
            uniforms,
            code,
            attributes,
            size,
            block_size,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.code.len());
        out.extend_from_slice(&[self.stage.magic(), b'S', b'H', self.version]);
        out.extend_from_slice(&self.hash_in.to_le_bytes());
        if self.version >= 6 {
            out.extend_from_slice(&self.hash_out.to_le_bytes());
        }
        out.extend_from_slice(&(self.uniforms.len() as u16).to_le_bytes());
        for uniform in self.uniforms.iter() {
            out.push(uniform.name.len() as u8);
            out.extend_from_slice(uniform.name.as_bytes());
            out.push(uniform.ty);
            out.push(uniform.num);
            out.extend_from_slice(&uniform.reg_index.to_le_bytes());
            out.extend_from_slice(&uniform.reg_count.to_le_bytes());
            if self.version >= 8 {
                out.push(uniform.tex_component);
                out.push(uniform.tex_dimension);
            }
            if self.version >= 10 {
                out.extend_from_slice(&uniform.tex_format.to_le_bytes());
            }
        }
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(self.code.as_bytes());
        out.push(0);
        out.push(self.attributes.len() as u8);
        for id in self.attributes.iter() {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&self.size.to_le_bytes());
        if let Some(block_size) = self.block_size {
            out.extend_from_slice(&block_size.to_le_bytes());
        }
        out
    }

    pub fn builder(stage: ShaderStage, code: &str) -> ShaderBuilder {
        ShaderBuilder {
            binary: Self {
                stage,
                version: SHADER_BIN_VERSION,
                hash_in: 0,
                hash_out: 0,
                uniforms: Vec::new(),
                code: code.to_string(),
                attributes: Vec::new(),
                size: 0,
                block_size: None,
            },
        }
    }
}

/// Texture dimension ids used in the uniform table.
pub fn texture_dimension_id(dimension: wgpu::TextureViewDimension) -> u8 {
    match dimension {
        wgpu::TextureViewDimension::D1 => 1,
        wgpu::TextureViewDimension::D2 => 2,
        wgpu::TextureViewDimension::D2Array => 3,
        wgpu::TextureViewDimension::Cube => 4,
        wgpu::TextureViewDimension::CubeArray => 5,
        wgpu::TextureViewDimension::D3 => 6,
    }
}

fn map_texture_dimension(id: u8) -> wgpu::TextureViewDimension {
    match id {
        1 => wgpu::TextureViewDimension::D1,
        3 => wgpu::TextureViewDimension::D2Array,
        4 => wgpu::TextureViewDimension::Cube,
        5 => wgpu::TextureViewDimension::CubeArray,
        6 => wgpu::TextureViewDimension::D3,
        _ => wgpu::TextureViewDimension::D2,
    }
}

/// Texture component ids used in the uniform table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TextureComponent {
    Float = 0,
    Int = 1,
    Uint = 2,
    Depth = 3,
    UnfilterableFloat = 4,
}

fn map_sample_type(id: u8) -> wgpu::TextureSampleType {
    match id {
        1 => wgpu::TextureSampleType::Sint,
        2 => wgpu::TextureSampleType::Uint,
        3 => wgpu::TextureSampleType::Depth,
        4 => wgpu::TextureSampleType::Float { filterable: false },
        _ => wgpu::TextureSampleType::Float { filterable: true },
    }
}

/// Writes shader binaries; used for built-in shaders.
pub struct ShaderBuilder {
    binary: ShaderBinary,
}

impl ShaderBuilder {
    pub fn hashes(mut self, hash_in: u32, hash_out: u32) -> Self {
        self.binary.hash_in = hash_in;
        self.binary.hash_out = hash_out;
        self
    }

    /// Adds a constant at byte offset `offset` of the stage's block.
    pub fn uniform(mut self, name: &str, ty: UniformType, num: u8, offset: u16) -> Self {
        let base = match ty {
            UniformType::Sampler => TYPE_SAMPLER,
            UniformType::Vec4 => TYPE_VEC4,
            UniformType::Mat3 => TYPE_MAT3,
            UniformType::Mat4 => TYPE_MAT4,
        };
        let end = offset as u32 + ty.size() * num.max(1) as u32;
        self.binary.size = self.binary.size.max(end as u16);
        self.push(name, base, num, offset, num as u16, 0, 0, 0)
    }

    /// Adds a sampled texture at bind slot `stage`.
    pub fn sampler(
        self,
        name: &str,
        stage: u8,
        dimension: wgpu::TextureViewDimension,
        component: TextureComponent,
        compare: bool,
    ) -> Self {
        let flags = UNIFORM_SAMPLER_BIT | if compare { UNIFORM_COMPARE_BIT } else { 0 };
        self.push(
            name,
            TYPE_SAMPLER | flags,
            1,
            stage as u16 + BIND_SHIFT,
            1,
            component as u8,
            texture_dimension_id(dimension),
            0,
        )
    }

    pub fn storage_buffer(self, name: &str, stage: u8, read_only: bool) -> Self {
        let flags = if read_only { UNIFORM_READONLY_BIT } else { 0 };
        self.push(
            name,
            TYPE_END | flags,
            1,
            stage as u16 + BIND_SHIFT,
            DESCRIPTOR_STORAGE_BUFFER,
            0,
            0,
            0,
        )
    }

    pub fn storage_image(
        self,
        name: &str,
        stage: u8,
        format: TextureFormat,
        read_only: bool,
    ) -> Self {
        let flags = if read_only { UNIFORM_READONLY_BIT } else { 0 };
        self.push(
            name,
            TYPE_END | flags,
            1,
            stage as u16 + BIND_SHIFT,
            DESCRIPTOR_STORAGE_IMAGE,
            0,
            texture_dimension_id(wgpu::TextureViewDimension::D2),
            format as u16,
        )
    }

    pub fn attribute(mut self, attrib: Attrib) -> Self {
        self.binary.attributes.push(attrib.id());
        self
    }

    fn push(
        mut self,
        name: &str,
        ty: u8,
        num: u8,
        reg_index: u16,
        reg_count: u16,
        tex_component: u8,
        tex_dimension: u8,
        tex_format: u16,
    ) -> Self {
        let ty = match self.binary.stage {
            ShaderStage::Fragment => ty | UNIFORM_FRAGMENT_BIT,
            _ => ty,
        };
        self.binary.uniforms.push(UniformInfo {
            name: name.to_string(),
            ty,
            num,
            reg_index,
            reg_count,
            tex_component,
            tex_dimension,
            tex_format,
        });
        self
    }

    pub fn build(self) -> ShaderBinary {
        self.binary
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.binary.to_bytes()
    }
}

//=============================================================================
// Uniform registry
//=============================================================================

struct UniformEntry {
    name: String,
    ty: UniformType,
    num: u16,
    data: Vec<u8>,
}

/// Named uniforms and their current values.
///
/// Values are stored in constant block layout: 16 bytes per `vec4`, three
/// padded columns per `mat3`.
pub struct UniformRegistry {
    pool: Pool<UniformHandle, UniformEntry>,
    names: HashMap<String, UniformHandle>,
}

impl UniformRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Pool::new("uniform", capacity),
            names: HashMap::new(),
        }
    }

    /// Registers `name`, or returns the existing handle grown to fit.
    pub fn create(&mut self, name: &str, ty: UniformType, num: u16) -> Result<UniformHandle, Error> {
        let num = num.max(1);
        let size = (ty.size() * num as u32) as usize;
        if let Some(&handle) = self.names.get(name) {
            let entry = self.pool.get_mut(handle)?;
            if entry.ty != ty {
                log::warn!("Uniform '{}' re-registered as {:?}", name, ty);
                entry.ty = ty;
            }
            entry.num = entry.num.max(num);
            let size = (entry.ty.size() * entry.num as u32) as usize;
            entry.data.resize(size, 0);
            return Ok(handle);
        }
        let handle = self.pool.insert(UniformEntry {
            name: name.to_string(),
            ty,
            num,
            data: vec![0; size],
        })?;
        self.names.insert(name.to_string(), handle);
        Ok(handle)
    }

    pub fn destroy(&mut self, handle: UniformHandle) -> Result<(), Error> {
        let entry = self.pool.remove(handle)?;
        self.names.remove(&entry.name);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<UniformHandle> {
        self.names.get(name).copied()
    }

    pub fn info(&self, handle: UniformHandle) -> Option<(UniformType, u16)> {
        self.pool.try_get(handle).map(|entry| (entry.ty, entry.num))
    }

    /// Stores a new value; extra bytes are dropped.
    pub fn update(&mut self, handle: UniformHandle, data: &[u8]) {
        match self.pool.get_mut(handle) {
            Ok(entry) => {
                let len = data.len().min(entry.data.len());
                entry.data[..len].copy_from_slice(&data[..len]);
            }
            Err(_) => log::warn!("Update of a destroyed uniform"),
        }
    }

    pub fn data(&self, handle: UniformHandle) -> Option<&[u8]> {
        self.pool.try_get(handle).map(|entry| entry.data.as_slice())
    }
}

//=============================================================================
// Reflection
//=============================================================================

/// Values the renderer supplies on its own, matched by name.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PredefinedUniform {
    ViewRect,
    ViewTexel,
    View,
    InvView,
    Proj,
    InvProj,
    ViewProj,
    InvViewProj,
    Model,
    ModelView,
    ModelViewProj,
    AlphaRef,
}

impl PredefinedUniform {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "u_viewRect" => Self::ViewRect,
            "u_viewTexel" => Self::ViewTexel,
            "u_view" => Self::View,
            "u_invView" => Self::InvView,
            "u_proj" => Self::Proj,
            "u_invProj" => Self::InvProj,
            "u_viewProj" => Self::ViewProj,
            "u_invViewProj" => Self::InvViewProj,
            "u_model" => Self::Model,
            "u_modelView" => Self::ModelView,
            "u_modelViewProj" => Self::ModelViewProj,
            "u_alphaRef4" => Self::AlphaRef,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredefinedBinding {
    pub kind: PredefinedUniform,
    /// Byte offset in the constant block.
    pub loc: u16,
    pub count: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformBinding {
    pub handle: UniformHandle,
    pub loc: u16,
    pub count: u16,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BindKind {
    /// Storage buffer.
    Buffer { read_only: bool },
    /// Storage texture of a single mip.
    Image {
        read_only: bool,
        format: wgpu::TextureFormat,
        dimension: wgpu::TextureViewDimension,
    },
    /// Sampled texture with a companion sampler.
    Texture {
        dimension: wgpu::TextureViewDimension,
        sample_type: wgpu::TextureSampleType,
        compare: bool,
    },
}

/// How one bind slot maps onto the bind group layout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BindInfo {
    pub kind: BindKind,
    pub binding: u32,
    pub visibility: wgpu::ShaderStages,
}

impl BindInfo {
    pub fn sampler_binding(&self) -> Option<u32> {
        match self.kind {
            BindKind::Texture { .. } => Some(self.binding + SAMPLER_SHIFT),
            _ => None,
        }
    }
}

/// A loaded shader.
pub struct Shader {
    pub stage: ShaderStage,
    pub module: ShaderModuleKey,
    pub entry_point: String,
    pub hash: u32,
    /// Consumed attributes in input order; the index is the location.
    pub attributes: Vec<Attrib>,
    pub predefined: Vec<PredefinedBinding>,
    pub uniforms: Vec<UniformBinding>,
    pub bindings: [Option<BindInfo>; MAX_TEXTURE_SAMPLERS],
    /// Constant block size as declared.
    pub size: u16,
    /// Constant block size rounded up to the dynamic offset alignment.
    pub gpu_size: u32,
}

impl Shader {
    pub fn create<D: Device>(
        device: &D,
        data: &[u8],
        registry: &UniformRegistry,
        label: &str,
    ) -> Result<Self, Error> {
        let binary = ShaderBinary::parse(data)?;
        let entry_point = validate_wgsl(&binary.code, binary.stage)?;
        let module = device.create_shader_module(&ShaderModuleDesc {
            label,
            source: &binary.code,
        })?;
        let mut shader = Self::reflect(&binary, registry)?;
        shader.module = module;
        shader.entry_point = entry_point;
        log::debug!(
            "Created {} shader '{}' hash {:08x}",
            binary.stage.name(),
            label,
            shader.hash
        );
        Ok(shader)
    }

    /// Builds the binding tables of `binary` without touching the device.
    pub fn reflect(binary: &ShaderBinary, registry: &UniformRegistry) -> Result<Self, Error> {
        let visibility = binary.stage.visibility();
        let mut predefined = Vec::new();
        let mut uniforms = Vec::new();
        let mut bindings = [None; MAX_TEXTURE_SAMPLERS];

        for info in binary.uniforms.iter() {
            if let Some(kind) = PredefinedUniform::from_name(&info.name) {
                predefined.push(PredefinedBinding {
                    kind,
                    loc: info.reg_index,
                    count: info.reg_count.max(1),
                });
                continue;
            }
            match info.base_type() {
                TYPE_END => {
                    let stage = bind_stage(info.reg_index)?;
                    let read_only = info.is_read_only();
                    let kind = if info.reg_count == DESCRIPTOR_STORAGE_BUFFER {
                        BindKind::Buffer { read_only }
                    } else {
                        let format = match TextureFormat::from_id(info.tex_format) {
                            Some(format) => format.to_wgpu(),
                            None => {
                                log::warn!(
                                    "Storage image '{}' has unknown format {}",
                                    info.name,
                                    info.tex_format
                                );
                                wgpu::TextureFormat::Rgba8Unorm
                            }
                        };
                        BindKind::Image {
                            read_only,
                            format,
                            dimension: map_texture_dimension(info.tex_dimension),
                        }
                    };
                    bindings[stage] = Some(BindInfo {
                        kind,
                        binding: info.reg_index as u32,
                        visibility,
                    });
                }
                TYPE_SAMPLER => {
                    let stage = bind_stage(info.reg_index)?;
                    let compare = info.is_compare();
                    let sample_type = if compare {
                        wgpu::TextureSampleType::Depth
                    } else {
                        map_sample_type(info.tex_component)
                    };
                    bindings[stage] = Some(BindInfo {
                        kind: BindKind::Texture {
                            dimension: map_texture_dimension(info.tex_dimension),
                            sample_type,
                            compare,
                        },
                        binding: info.reg_index as u32,
                        visibility,
                    });
                }
                _ => match registry.find(&info.name) {
                    Some(handle) => uniforms.push(UniformBinding {
                        handle,
                        loc: info.reg_index,
                        count: info.reg_count.max(1),
                    }),
                    None => log::warn!(
                        "User defined uniform '{}' is not registered, it won't be set",
                        info.name
                    ),
                },
            }
        }

        let mut attributes = Vec::with_capacity(binary.attributes.len());
        for &id in binary.attributes.iter() {
            match Attrib::from_id(id) {
                Some(attrib) => attributes.push(attrib),
                None => log::warn!("Unknown vertex attribute id {:#x}", id),
            }
        }

        let mut murmur = Murmur2A::new();
        murmur.add_u32(binary.hash_in);
        murmur.add_u32(binary.hash_out);
        murmur.add(binary.code.as_bytes());
        murmur.add_u8(binary.attributes.len() as u8);
        for &id in binary.attributes.iter() {
            murmur.add_u16(id);
        }

        let align = MIN_BUFFER_OFFSET_ALIGNMENT;
        Ok(Self {
            stage: binary.stage,
            module: ShaderModuleKey::default(),
            entry_point: String::new(),
            hash: murmur.end(),
            attributes,
            predefined,
            uniforms,
            bindings,
            size: binary.size,
            gpu_size: (binary.size as u32).div_ceil(align) * align,
        })
    }

    /// Shader input location of `attrib`, if consumed.
    pub fn location(&self, attrib: Attrib) -> Option<u32> {
        self.attributes
            .iter()
            .position(|&a| a == attrib)
            .map(|index| index as u32)
    }

    pub fn consumes(&self, attrib: Attrib) -> bool {
        self.attributes.contains(&attrib)
    }

    pub fn destroy<D: Device>(self, device: &D) {
        device.destroy_shader_module(self.module);
    }
}

fn bind_stage(reg_index: u16) -> Result<usize, ShaderParseError> {
    match reg_index.checked_sub(BIND_SHIFT) {
        Some(stage) if (stage as usize) < MAX_TEXTURE_SAMPLERS => Ok(stage as usize),
        _ => Err(ShaderParseError::BadRegister(reg_index)),
    }
}

/// Parses `code` with naga and returns the entry point name for `stage`.
pub fn validate_wgsl(code: &str, stage: ShaderStage) -> Result<String, ShaderParseError> {
    let module = naga::front::wgsl::parse_str(code)
        .map_err(|e| ShaderParseError::Wgsl(e.emit_to_string(code)))?;
    module
        .entry_points
        .iter()
        .find(|ep| ep.stage == stage.naga())
        .map(|ep| ep.name.clone())
        .ok_or(ShaderParseError::MissingEntryPoint(stage.name()))
}
