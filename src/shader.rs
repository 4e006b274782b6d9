//! Shader stages and reflection ingest.
//!
//! A [`ShaderStage`] wraps compiled SPIR-V together with the binding and
//! vertex-input metadata reflected from it. Reflection is delegated to
//! `spirq`, which this layer treats as a black box returning, per stage, an
//! ordered list of descriptor bindings (set, binding, kind, array count) and
//! for vertex stages the input attribute list. The shader module itself only
//! lives until the owning pipeline has been created; after that the layout
//! and vertex-input descriptions are all that remain.

use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::context::GpuContext;
use crate::error::{Error, Result};

/// The kinds of descriptor this layer knows how to bind.
///
/// Sized against the bootstrap descriptor pool, which guarantees capacity for
/// uniform buffers, combined image samplers, samplers and sampled images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    SampledImage,
    Sampler,
}

impl DescriptorKind {
    pub fn as_vk(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
        }
    }
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::UniformBuffer => "uniform buffer",
            DescriptorKind::StorageBuffer => "storage buffer",
            DescriptorKind::CombinedImageSampler => "combined image sampler",
            DescriptorKind::SampledImage => "sampled image",
            DescriptorKind::Sampler => "sampler",
        };
        f.write_str(name)
    }
}

/// One descriptor binding as declared by a single shader stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
}

/// One vertex input attribute with its resolved format and byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Everything the layout builder and pipeline need to know about one stage.
#[derive(Clone, Debug)]
pub struct ShaderReflection {
    /// The single declaring stage. Multi-stage visibility is produced later
    /// by the layout builder when it merges identical re-declarations.
    pub stage: vk::ShaderStageFlags,
    pub bindings: Vec<ReflectedBinding>,
    /// Input attributes, ordered by location. Empty for non-vertex stages.
    pub vertex_inputs: Vec<VertexInput>,
    /// Tightly-packed stride over `vertex_inputs`, in bytes.
    pub vertex_stride: u32,
}

/// A compiled shader stage: module handle plus reflected metadata.
///
/// Owned by a pipeline during assembly. The module is destroyed when the
/// stage is dropped, which the pipeline does as soon as the graphics pipeline
/// has been created.
pub struct ShaderStage {
    ctx: Arc<GpuContext>,
    module: vk::ShaderModule,
    reflection: ShaderReflection,
}

pub const SHADER_ENTRY_POINT: &CStr = c"main";

impl ShaderStage {
    /// Creates the shader module and reflects its binding metadata.
    pub fn new(
        ctx: Arc<GpuContext>,
        code: &[u32],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let reflection = reflect(code, stage)?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { ctx.device.create_shader_module(&create_info, None) }
            .map_err(|e| Error::vulkan("vkCreateShaderModule", e))?;

        log::debug!(
            "created {stage:?} shader module: {} bindings, {} vertex inputs",
            reflection.bindings.len(),
            reflection.vertex_inputs.len(),
        );

        Ok(Self {
            ctx,
            module,
            reflection,
        })
    }

    /// As [`ShaderStage::new`], but from the raw byte blob an external
    /// compiler produces.
    pub fn from_bytes(
        ctx: Arc<GpuContext>,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(bytes))?;
        Self::new(ctx, &words, stage)
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

impl Drop for ShaderStage {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_shader_module(self.module, None) };
    }
}

/// Scalar component type of a vertex input, as far as formats are concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InputScalar {
    F32,
    I32,
    U32,
}

/// Maps a (scalar, component count) pair to a vertex attribute format and its
/// byte size. Only 32-bit components appear in the supported shaders.
pub(crate) fn input_format(scalar: InputScalar, components: u32) -> Option<(vk::Format, u32)> {
    let format = match (scalar, components) {
        (InputScalar::F32, 1) => vk::Format::R32_SFLOAT,
        (InputScalar::F32, 2) => vk::Format::R32G32_SFLOAT,
        (InputScalar::F32, 3) => vk::Format::R32G32B32_SFLOAT,
        (InputScalar::F32, 4) => vk::Format::R32G32B32A32_SFLOAT,
        (InputScalar::I32, 1) => vk::Format::R32_SINT,
        (InputScalar::I32, 2) => vk::Format::R32G32_SINT,
        (InputScalar::I32, 3) => vk::Format::R32G32B32_SINT,
        (InputScalar::I32, 4) => vk::Format::R32G32B32A32_SINT,
        (InputScalar::U32, 1) => vk::Format::R32_UINT,
        (InputScalar::U32, 2) => vk::Format::R32G32_UINT,
        (InputScalar::U32, 3) => vk::Format::R32G32B32_UINT,
        (InputScalar::U32, 4) => vk::Format::R32G32B32A32_UINT,
        _ => return None,
    };
    Some((format, 4 * components))
}

/// Assigns tightly-packed byte offsets to inputs sorted by location and
/// returns them with the total stride.
pub(crate) fn pack_vertex_inputs(
    mut inputs: Vec<(u32, vk::Format, u32)>,
) -> (Vec<VertexInput>, u32) {
    inputs.sort_by_key(|&(location, _, _)| location);

    let mut packed = Vec::with_capacity(inputs.len());
    let mut offset = 0;
    for (location, format, size) in inputs {
        packed.push(VertexInput {
            location,
            format,
            offset,
        });
        offset += size;
    }
    (packed, offset)
}

fn reflect(code: &[u32], stage: vk::ShaderStageFlags) -> Result<ShaderReflection> {
    let entry_points = spirq::ReflectConfig::new()
        .spv(code)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| Error::Reflection(format!("{e:?}")))?;

    let mut bindings = Vec::new();
    let mut raw_inputs = Vec::new();

    for entry_point in &entry_points {
        for var in &entry_point.vars {
            match var {
                spirq::var::Variable::Descriptor {
                    desc_bind,
                    desc_ty,
                    nbind,
                    ..
                } => {
                    bindings.push(ReflectedBinding {
                        set: desc_bind.set(),
                        binding: desc_bind.bind(),
                        kind: descriptor_kind(desc_ty)?,
                        count: *nbind,
                    });
                }
                spirq::var::Variable::Input { location, ty, .. }
                    if stage == vk::ShaderStageFlags::VERTEX =>
                {
                    let loc = location.loc();
                    let (scalar, components) = input_scalar(ty).ok_or_else(|| {
                        Error::UnsupportedVertexInput {
                            location: loc,
                            type_desc: format!("{ty:?}"),
                        }
                    })?;
                    let (format, size) = input_format(scalar, components).ok_or_else(|| {
                        Error::UnsupportedVertexInput {
                            location: loc,
                            type_desc: format!("{ty:?}"),
                        }
                    })?;
                    raw_inputs.push((loc, format, size));
                }
                _ => {}
            }
        }
    }

    let (vertex_inputs, vertex_stride) = pack_vertex_inputs(raw_inputs);

    Ok(ShaderReflection {
        stage,
        bindings,
        vertex_inputs,
        vertex_stride,
    })
}

fn descriptor_kind(desc_ty: &spirq::ty::DescriptorType) -> Result<DescriptorKind> {
    use spirq::ty::DescriptorType;
    match desc_ty {
        DescriptorType::UniformBuffer() => Ok(DescriptorKind::UniformBuffer),
        DescriptorType::StorageBuffer(..) => Ok(DescriptorKind::StorageBuffer),
        DescriptorType::CombinedImageSampler() => Ok(DescriptorKind::CombinedImageSampler),
        DescriptorType::SampledImage() => Ok(DescriptorKind::SampledImage),
        DescriptorType::Sampler() => Ok(DescriptorKind::Sampler),
        other => Err(Error::UnsupportedDescriptorType(format!("{other:?}"))),
    }
}

fn input_scalar(ty: &spirq::ty::Type) -> Option<(InputScalar, u32)> {
    use spirq::ty::{ScalarType, Type};

    let scalar_of = |scalar: &ScalarType| match scalar {
        ScalarType::Float { bits: 32 } => Some(InputScalar::F32),
        ScalarType::Integer {
            bits: 32,
            is_signed: true,
        } => Some(InputScalar::I32),
        ScalarType::Integer {
            bits: 32,
            is_signed: false,
        } => Some(InputScalar::U32),
        _ => None,
    };

    match ty {
        Type::Scalar(s) => scalar_of(s).map(|k| (k, 1)),
        Type::Vector(v) => scalar_of(&v.scalar_ty).map(|k| (k, v.nscalar)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_formats_cover_32bit_scalars_and_vectors() {
        assert_eq!(
            input_format(InputScalar::F32, 2),
            Some((vk::Format::R32G32_SFLOAT, 8))
        );
        assert_eq!(
            input_format(InputScalar::F32, 4),
            Some((vk::Format::R32G32B32A32_SFLOAT, 16))
        );
        assert_eq!(
            input_format(InputScalar::U32, 1),
            Some((vk::Format::R32_UINT, 4))
        );
        assert_eq!(
            input_format(InputScalar::I32, 3),
            Some((vk::Format::R32G32B32_SINT, 12))
        );
        assert_eq!(input_format(InputScalar::F32, 5), None);
        assert_eq!(input_format(InputScalar::F32, 0), None);
    }

    #[test]
    fn vertex_inputs_pack_tightly_in_location_order() {
        // Declared out of order: location 2 (vec4), 0 (vec2), 1 (uint).
        let (inputs, stride) = pack_vertex_inputs(vec![
            (2, vk::Format::R32G32B32A32_SFLOAT, 16),
            (0, vk::Format::R32G32_SFLOAT, 8),
            (1, vk::Format::R32_UINT, 4),
        ]);

        assert_eq!(stride, 28);
        assert_eq!(
            inputs,
            vec![
                VertexInput {
                    location: 0,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 0
                },
                VertexInput {
                    location: 1,
                    format: vk::Format::R32_UINT,
                    offset: 8
                },
                VertexInput {
                    location: 2,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 12
                },
            ]
        );
    }

    #[test]
    fn empty_input_list_has_zero_stride() {
        let (inputs, stride) = pack_vertex_inputs(Vec::new());
        assert!(inputs.is_empty());
        assert_eq!(stride, 0);
    }
}
