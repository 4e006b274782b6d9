//! Descriptor set allocation and initial resource writes.
//!
//! Sets are allocated from the bootstrap-owned fixed-capacity pool in one
//! batch call, which Vulkan guarantees to be all-or-nothing: either every
//! requested set comes back usable or the whole call fails and no partial
//! array exists. Initial writes are applied synchronously before returning,
//! so the handles are immediately usable in command recording.

use ash::vk;
use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::descriptor::layout::SetLayout;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::shader::DescriptorKind;

/// A concrete resource to write into one descriptor slot.
pub enum BindingResource<'a> {
    UniformBuffer(&'a Buffer),
    CombinedImageSampler(&'a Image),
}

impl BindingResource<'_> {
    fn kind(&self) -> DescriptorKind {
        match self {
            BindingResource::UniformBuffer(_) => DescriptorKind::UniformBuffer,
            BindingResource::CombinedImageSampler(_) => DescriptorKind::CombinedImageSampler,
        }
    }
}

/// A descriptor write request: which slot, and what to put there.
pub struct BindingWrite<'a> {
    pub set: u32,
    pub binding: u32,
    pub resource: BindingResource<'a>,
}

/// Allocates one concrete descriptor set per raw layout.
pub fn allocate_sets(
    ctx: &GpuContext,
    raw_layouts: &[vk::DescriptorSetLayout],
) -> Result<Vec<vk::DescriptorSet>> {
    if raw_layouts.is_empty() {
        return Ok(Vec::new());
    }
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(ctx.descriptor_pool)
        .set_layouts(raw_layouts);
    unsafe { ctx.device.allocate_descriptor_sets(&alloc_info) }
        .map_err(|e| Error::vulkan("vkAllocateDescriptorSets", e))
}

/// Writes initial resources into freshly allocated sets.
///
/// Every write is checked against the set layouts first: the slot must be
/// declared and its kind must match the supplied resource. Only then is the
/// whole batch applied in a single `vkUpdateDescriptorSets` call.
pub fn write_initial_bindings(
    ctx: &GpuContext,
    sets: &[vk::DescriptorSet],
    set_layouts: &[SetLayout],
    writes: &[BindingWrite<'_>],
) -> Result<()> {
    for write in writes {
        let declared = set_layouts
            .get(write.set as usize)
            .and_then(|layout| layout.binding(write.binding))
            .ok_or(Error::UnknownBinding {
                set: write.set,
                binding: write.binding,
            })?;
        if declared.kind != write.resource.kind() {
            return Err(Error::BindingKindMismatch {
                set: write.set,
                binding: write.binding,
                expected: declared.kind.to_string(),
                supplied: write.resource.kind().to_string(),
            });
        }
    }

    // Info structs are collected first so the write array can hold stable
    // references into them.
    let mut buffer_infos: SmallVec<[vk::DescriptorBufferInfo; 4]> = SmallVec::new();
    let mut image_infos: SmallVec<[vk::DescriptorImageInfo; 4]> = SmallVec::new();
    for write in writes {
        match &write.resource {
            BindingResource::UniformBuffer(buffer) => buffer_infos.push(
                vk::DescriptorBufferInfo {
                    buffer: buffer.handle(),
                    offset: 0,
                    range: buffer.size(),
                },
            ),
            BindingResource::CombinedImageSampler(image) => image_infos.push(
                vk::DescriptorImageInfo {
                    sampler: image.sampler(),
                    image_view: image.view(),
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            ),
        }
    }

    let mut writes_vk: SmallVec<[vk::WriteDescriptorSet<'_>; 4]> = SmallVec::new();
    let (mut next_buffer, mut next_image) = (0, 0);
    for write in writes {
        let dst_set = sets
            .get(write.set as usize)
            .copied()
            .ok_or(Error::UnknownBinding {
                set: write.set,
                binding: write.binding,
            })?;
        let base = vk::WriteDescriptorSet::default()
            .dst_set(dst_set)
            .dst_binding(write.binding)
            .dst_array_element(0);
        let write_vk = match &write.resource {
            BindingResource::UniformBuffer(_) => {
                let info = std::slice::from_ref(&buffer_infos[next_buffer]);
                next_buffer += 1;
                base.descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(info)
            }
            BindingResource::CombinedImageSampler(_) => {
                let info = std::slice::from_ref(&image_infos[next_image]);
                next_image += 1;
                base.descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
            }
        };
        writes_vk.push(write_vk);
    }

    unsafe { ctx.device.update_descriptor_sets(&writes_vk, &[]) };
    Ok(())
}
