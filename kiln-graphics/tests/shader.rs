//! Shader binary parsing and reflection.

mod common;

use kiln_graphics::{
    noop,
    shader::{
        BindKind, PredefinedUniform, Shader, ShaderBinary, ShaderStage, TextureComponent,
        UniformRegistry, SHADER_BIN_VERSION,
    },
    Attrib, Error, ShaderParseError, UniformType,
};

/// A built blob parses back to the same binary
#[test]
fn test_shader_blob_parse() {
    let binary = ShaderBinary::builder(ShaderStage::Vertex, common::VS_POSITION)
        .hashes(0xdead, 0xbeef)
        .uniform("u_modelViewProj", UniformType::Mat4, 1, 0)
        .uniform("u_tint", UniformType::Vec4, 1, 64)
        .attribute(Attrib::Position)
        .build();
    assert_eq!(binary.size, 80);

    let parsed = ShaderBinary::parse(&binary.to_bytes()).expect("Failed to parse blob");
    assert_eq!(parsed.stage, ShaderStage::Vertex);
    assert_eq!(parsed.version, SHADER_BIN_VERSION);
    assert_eq!((parsed.hash_in, parsed.hash_out), (0xdead, 0xbeef));
    assert_eq!(parsed.uniforms, binary.uniforms);
    assert_eq!(parsed.code, common::VS_POSITION);
    assert_eq!(parsed.attributes, vec![Attrib::Position.id()]);
    assert_eq!(parsed.size, 80);
}

/// Older versions omit the output hash and texture metadata
#[test]
fn test_shader_blob_old_version() {
    let mut binary = ShaderBinary::builder(ShaderStage::Fragment, common::FS_SOLID)
        .hashes(7, 9)
        .uniform("u_color", UniformType::Vec4, 1, 0)
        .build();
    binary.version = 5;
    let bytes = binary.to_bytes();

    let parsed = ShaderBinary::parse(&bytes).expect("Failed to parse blob");
    assert_eq!(parsed.hash_in, 7);
    assert_eq!(parsed.hash_out, 7, "without an output hash the input hash is reused");
    assert_eq!(parsed.uniforms[0].tex_dimension, 0);
}

/// Malformed blobs are rejected with a reason
#[test]
fn test_shader_blob_errors() {
    let bytes = common::vs_position_blob();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(matches!(
        ShaderBinary::parse(&bad_magic),
        Err(ShaderParseError::BadMagic(_))
    ));

    let mut future = bytes.clone();
    future[3] = SHADER_BIN_VERSION + 1;
    assert!(matches!(
        ShaderBinary::parse(&future),
        Err(ShaderParseError::UnsupportedVersion(_))
    ));

    for len in [2, 6, 20, bytes.len() - 3] {
        assert!(
            matches!(
                ShaderBinary::parse(&bytes[..len]),
                Err(ShaderParseError::Truncated(_))
            ),
            "blob cut at {} bytes",
            len
        );
    }
}

/// Uniforms are sorted into predefined, user, sampler and storage slots
#[test]
fn test_shader_reflection() {
    common::init_logger();
    let mut registry = UniformRegistry::new(16);
    let tint = registry
        .create("u_tint", UniformType::Vec4, 1)
        .expect("Failed to register uniform");

    let binary = ShaderBinary::builder(ShaderStage::Fragment, common::FS_TEXTURED)
        .uniform("u_viewRect", UniformType::Vec4, 1, 0)
        .uniform("u_tint", UniformType::Vec4, 1, 16)
        .uniform("u_unknown", UniformType::Vec4, 1, 32)
        .sampler(
            "s_shadow",
            1,
            wgpu::TextureViewDimension::D2,
            TextureComponent::Depth,
            true,
        )
        .storage_buffer("b_lights", 3, true)
        .build();
    let shader = Shader::reflect(&binary, &registry).expect("Failed to reflect shader");

    assert_eq!(shader.predefined.len(), 1);
    assert_eq!(shader.predefined[0].kind, PredefinedUniform::ViewRect);
    assert_eq!(shader.uniforms.len(), 1, "unregistered uniforms are ignored");
    assert_eq!(shader.uniforms[0].handle, tint);
    assert_eq!(shader.uniforms[0].loc, 16);
    assert_eq!(shader.size, 48);
    assert_eq!(shader.gpu_size, 256);

    let sampler = shader.bindings[1].expect("Sampler slot is empty");
    assert_eq!(sampler.binding, 3);
    assert_eq!(sampler.sampler_binding(), Some(19));
    assert!(matches!(
        sampler.kind,
        BindKind::Texture {
            compare: true,
            sample_type: wgpu::TextureSampleType::Depth,
            ..
        }
    ));
    let storage = shader.bindings[3].expect("Storage slot is empty");
    assert_eq!(storage.kind, BindKind::Buffer { read_only: true });
    assert_eq!(storage.visibility, wgpu::ShaderStages::FRAGMENT);
    assert!(shader.bindings[0].is_none());
}

/// The hash covers code and attributes but not the uniform table
#[test]
fn test_shader_hash() {
    let registry = UniformRegistry::new(4);
    let hash = |code: &str, attributes: &[Attrib]| {
        let mut builder = ShaderBinary::builder(ShaderStage::Vertex, code).hashes(1, 2);
        for &attrib in attributes {
            builder = builder.attribute(attrib);
        }
        Shader::reflect(&builder.build(), &registry)
            .expect("Failed to reflect shader")
            .hash
    };
    let base = hash(common::VS_POSITION, &[Attrib::Position]);
    assert_eq!(base, hash(common::VS_POSITION, &[Attrib::Position]));
    assert_ne!(base, hash(common::VS_POSITION, &[Attrib::Position, Attrib::Normal]));
    assert_ne!(base, hash(common::FS_SOLID, &[Attrib::Position]));
}

/// WGSL is validated before a module is created
#[test]
fn test_shader_create_validates_wgsl() {
    common::init_logger();
    let device = noop::Context::default();
    let registry = UniformRegistry::new(4);

    let broken = ShaderBinary::builder(ShaderStage::Vertex, "fn vs_main( {").to_bytes();
    assert!(matches!(
        Shader::create(&device, &broken, &registry, "broken"),
        Err(Error::InvalidShader(ShaderParseError::Wgsl(_)))
    ));

    let wrong_stage = ShaderBinary::builder(ShaderStage::Compute, common::FS_SOLID).to_bytes();
    assert!(matches!(
        Shader::create(&device, &wrong_stage, &registry, "wrong stage"),
        Err(Error::InvalidShader(ShaderParseError::MissingEntryPoint(_)))
    ));
    assert_eq!(device.num_live(noop::ObjectKind::ShaderModule), 0);

    let shader = Shader::create(&device, &common::fs_solid_blob(), &registry, "solid")
        .expect("Failed to create shader");
    assert_eq!(shader.entry_point, "fs_main");
    assert_eq!(device.num_live(noop::ObjectKind::ShaderModule), 1);
}

/// A program needs a vertex or compute shader first
#[test]
fn test_program_requires_vertex_shader() {
    let mut renderer = common::renderer();
    let fs = renderer
        .create_shader(&common::fs_solid_blob(), "fs_solid")
        .expect("Failed to create shader");
    assert!(matches!(
        renderer.create_program(fs, None),
        Err(Error::MissingVertexShader)
    ));
}
