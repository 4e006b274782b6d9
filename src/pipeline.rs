//! Graphics pipeline assembly from reflected shader stages.
//!
//! A [`Pipeline`] is created once per distinct shader combination. It derives
//! its entire resource contract (the per-set binding layouts and the vertex
//! input description) from the stages' reflection metadata, then builds a
//! dynamic-rendering graphics pipeline around the renderer's fixed draw
//! shape: a 4-vertex triangle strip instanced from a per-instance vertex
//! buffer, alpha-blended into a single color attachment.
//!
//! Shader modules are only needed during assembly; the stage list is
//! consumed and dropped (destroying the modules) as soon as the pipeline
//! exists. The pipeline outlives every rendering that references it and is
//! destroyed by its owner dropping it.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::context::GpuContext;
use crate::descriptor::layout::{build_set_layouts, SetLayout};
use crate::error::{Error, Result};
use crate::shader::{ShaderStage, VertexInput, SHADER_ENTRY_POINT};

/// A graphics pipeline with its derived resource contract.
pub struct Pipeline {
    ctx: Arc<GpuContext>,
    set_layouts: Vec<SetLayout>,
    raw_set_layouts: Vec<vk::DescriptorSetLayout>,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
    vertex_inputs: Vec<VertexInput>,
    vertex_stride: u32,
}

impl Pipeline {
    /// Builds a pipeline from compiled stages, targeting color attachments
    /// of `color_format`.
    ///
    /// The stage set is validated (at least vertex + fragment), the set
    /// layouts are derived and materialized, and the vertex input is taken
    /// from the vertex stage's reflection at instance rate. `stages` is
    /// consumed; the shader modules are destroyed before this returns.
    pub fn new(
        ctx: Arc<GpuContext>,
        stages: Vec<ShaderStage>,
        color_format: vk::Format,
    ) -> Result<Self> {
        let reflections: Vec<_> = stages.iter().map(|s| s.reflection()).collect();
        let set_layouts = build_set_layouts(&reflections)?;

        // Stage-set validation guarantees a vertex stage exists.
        let vertex = reflections
            .iter()
            .find(|r| r.stage.contains(vk::ShaderStageFlags::VERTEX))
            .ok_or(Error::MissingStage("vertex"))?;
        let vertex_inputs = vertex.vertex_inputs.clone();
        let vertex_stride = vertex.vertex_stride;

        let mut raw_set_layouts = Vec::with_capacity(set_layouts.len());
        for set_layout in &set_layouts {
            match set_layout.create_raw(&ctx) {
                Ok(raw) => raw_set_layouts.push(raw),
                Err(e) => {
                    destroy_raw(&ctx, &raw_set_layouts, None, None);
                    return Err(e);
                }
            }
        }

        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_set_layouts);
        let layout = match unsafe { ctx.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                destroy_raw(&ctx, &raw_set_layouts, None, None);
                return Err(Error::vulkan("vkCreatePipelineLayout", e));
            }
        };

        let handle = match create_graphics_pipeline(
            &ctx,
            &stages,
            layout,
            &vertex_inputs,
            vertex_stride,
            color_format,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                destroy_raw(&ctx, &raw_set_layouts, Some(layout), None);
                return Err(e);
            }
        };

        // Bytecode and reflection handles are no longer needed; dropping the
        // stages destroys the shader modules.
        drop(stages);

        Ok(Self {
            ctx,
            set_layouts,
            raw_set_layouts,
            layout,
            handle,
            vertex_inputs,
            vertex_stride,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The derived per-set binding schema, dense by set index.
    pub fn set_layouts(&self) -> &[SetLayout] {
        &self.set_layouts
    }

    /// The raw layout handles matching [`Pipeline::set_layouts`].
    pub fn raw_set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.raw_set_layouts
    }

    pub fn vertex_inputs(&self) -> &[VertexInput] {
        &self.vertex_inputs
    }

    /// Per-instance stride of the vertex input, in bytes.
    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        destroy_raw(
            &self.ctx,
            &self.raw_set_layouts,
            Some(self.layout),
            Some(self.handle),
        );
    }
}

fn destroy_raw(
    ctx: &GpuContext,
    raw_set_layouts: &[vk::DescriptorSetLayout],
    layout: Option<vk::PipelineLayout>,
    pipeline: Option<vk::Pipeline>,
) {
    unsafe {
        if let Some(pipeline) = pipeline {
            ctx.device.destroy_pipeline(pipeline, None);
        }
        if let Some(layout) = layout {
            ctx.device.destroy_pipeline_layout(layout, None);
        }
        for &raw in raw_set_layouts {
            ctx.device.destroy_descriptor_set_layout(raw, None);
        }
    }
}

/// Vertex binding/attribute descriptions for a single instance-rate binding.
pub(crate) fn vertex_input_descriptions(
    inputs: &[VertexInput],
    stride: u32,
) -> (
    SmallVec<[vk::VertexInputBindingDescription; 1]>,
    SmallVec<[vk::VertexInputAttributeDescription; 8]>,
) {
    let mut bindings = SmallVec::new();
    let mut attributes = SmallVec::new();
    if !inputs.is_empty() {
        bindings.push(vk::VertexInputBindingDescription {
            binding: 0,
            stride,
            input_rate: vk::VertexInputRate::INSTANCE,
        });
        for input in inputs {
            attributes.push(vk::VertexInputAttributeDescription {
                location: input.location,
                binding: 0,
                format: input.format,
                offset: input.offset,
            });
        }
    }
    (bindings, attributes)
}

fn create_graphics_pipeline(
    ctx: &GpuContext,
    stages: &[ShaderStage],
    layout: vk::PipelineLayout,
    vertex_inputs: &[VertexInput],
    vertex_stride: u32,
    color_format: vk::Format,
) -> Result<vk::Pipeline> {
    let stage_infos: SmallVec<[vk::PipelineShaderStageCreateInfo<'_>; 2]> = stages
        .iter()
        .map(|stage| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.reflection().stage)
                .module(stage.module())
                .name(SHADER_ENTRY_POINT)
        })
        .collect();

    let (binding_descs, attribute_descs) = vertex_input_descriptions(vertex_inputs, vertex_stride);
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descs)
        .vertex_attribute_descriptions(&attribute_descs);

    // The quad is a fixed 4-vertex strip; all per-draw variation comes from
    // instance data.
    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_STRIP);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let blend_attachment = vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
        dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    };
    let blend_attachments = [blend_attachment];
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats = [color_format];
    let mut rendering_info =
        vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stage_infos)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        ctx.device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    }
    .map_err(|(_, e)| Error::vulkan("vkCreateGraphicsPipelines", e))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_rate_binding_covers_all_attributes() {
        let inputs = [
            VertexInput {
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            VertexInput {
                location: 1,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 8,
            },
        ];
        let (bindings, attributes) = vertex_input_descriptions(&inputs, 24);

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].stride, 24);
        assert_eq!(bindings[0].input_rate, vk::VertexInputRate::INSTANCE);

        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 8);
    }

    #[test]
    fn no_inputs_means_no_binding() {
        let (bindings, attributes) = vertex_input_descriptions(&[], 0);
        assert!(bindings.is_empty());
        assert!(attributes.is_empty());
    }
}
