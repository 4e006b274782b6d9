//! The per-target draw unit and its dirty-tracked command buffer.
//!
//! A [`Rendering`] ties one target image, one pipeline, one descriptor set
//! array and one instance buffer into a replayable command buffer. The
//! `needs_recording` flag is the sole signal governing re-recording: every
//! mutating call sets it, [`Rendering::record`] consumes it, and a record
//! call while the flag is clear is a logged no-op rather than an error.
//! Re-recording is never implicit.
//!
//! Recording assumes a fully-wired rendering. A missing or zero-size
//! instance buffer, a zero-extent target or a descriptor set array that
//! does not match the pipeline's contract are integration bugs and fail
//! before anything is recorded.

use std::sync::Arc;

use ash::vk;

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::error::{Error, Result};
use crate::image::{record_layout_barrier, Image};
use crate::pipeline::Pipeline;

/// The color target a rendering draws into.
///
/// Plain handles: the target (a swapchain image or an offscreen [`Image`])
/// stays owned by whoever created it.
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

impl RenderTarget {
    /// Targets an offscreen image owned elsewhere.
    pub fn from_image(image: &Image) -> Self {
        Self {
            image: image.handle(),
            view: image.view(),
            extent: image.extent(),
            format: image.format(),
        }
    }
}

/// The mutable draw state behind a rendering, tracked by the dirty flag.
///
/// Kept as plain data, separate from the GPU-facing wrapper, so the state
/// machine itself is directly exercisable.
#[derive(Debug)]
pub(crate) struct RenderingState {
    pub target: RenderTarget,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    /// Handle and size of the instance buffer, if one is set.
    pub instance: Option<(vk::Buffer, u64)>,
    /// Handle and size of the optional indirect draw buffer.
    pub indirect: Option<(vk::Buffer, u64)>,
    pub instance_count: u32,
    pub clear_color: [f32; 4],
    pub needs_recording: bool,
}

impl RenderingState {
    fn new(target: RenderTarget) -> Self {
        Self {
            target,
            descriptor_sets: Vec::new(),
            instance: None,
            indirect: None,
            instance_count: 0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            needs_recording: true,
        }
    }

    fn set_target(&mut self, target: RenderTarget) {
        self.target = target;
        self.needs_recording = true;
    }

    fn set_descriptor_sets(&mut self, sets: Vec<vk::DescriptorSet>) {
        self.descriptor_sets = sets;
        self.needs_recording = true;
    }

    fn set_instance(&mut self, handle: vk::Buffer, size: u64) {
        self.instance = Some((handle, size));
        self.needs_recording = true;
    }

    fn set_indirect(&mut self, buffer: Option<(vk::Buffer, u64)>) {
        self.indirect = buffer;
        self.needs_recording = true;
    }

    fn set_instance_count(&mut self, count: u32) {
        self.instance_count = count;
        self.needs_recording = true;
    }

    fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
        self.needs_recording = true;
    }

    fn mark_recorded(&mut self) {
        self.needs_recording = false;
    }

    /// Checks every prerequisite of recording, without touching the GPU.
    fn validate(&self, expected_sets: usize) -> Result<()> {
        if self.descriptor_sets.len() != expected_sets {
            return Err(Error::MissingPrerequisite(
                "descriptor set count does not match the pipeline's set layouts",
            ));
        }
        match self.instance {
            None => return Err(Error::MissingPrerequisite("instance buffer is not set")),
            Some((_, 0)) => {
                return Err(Error::MissingPrerequisite("instance buffer has zero size"))
            }
            Some(_) => {}
        }
        if let Some((_, 0)) = self.indirect {
            return Err(Error::MissingPrerequisite("indirect buffer has zero size"));
        }
        if self.target.extent.width == 0 || self.target.extent.height == 0 {
            return Err(Error::MissingPrerequisite("target image has zero extent"));
        }
        Ok(())
    }
}

/// A per-target draw with a cached, dirty-tracked command buffer.
pub struct Rendering {
    ctx: Arc<GpuContext>,
    pipeline: Arc<Pipeline>,
    state: RenderingState,
    // Arcs keep the buffers alive as long as the recorded commands may
    // reference them; the handles live in `state`.
    instance_buffer: Option<Arc<Buffer>>,
    indirect_buffer: Option<Arc<Buffer>>,
    command_buffer: Option<vk::CommandBuffer>,
}

impl Rendering {
    /// Creates an unrecorded rendering for `target`; `needs_recording`
    /// starts out set.
    pub fn new(ctx: Arc<GpuContext>, pipeline: Arc<Pipeline>, target: RenderTarget) -> Self {
        Self {
            ctx,
            pipeline,
            state: RenderingState::new(target),
            instance_buffer: None,
            indirect_buffer: None,
            command_buffer: None,
        }
    }

    pub fn needs_recording(&self) -> bool {
        self.state.needs_recording
    }

    /// The recorded command buffer, once [`Rendering::record`] has run.
    pub fn command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.command_buffer
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// The current instance buffer, e.g. to grow it and set the replacement.
    pub fn instance_buffer(&self) -> Option<&Arc<Buffer>> {
        self.instance_buffer.as_ref()
    }

    pub fn indirect_buffer(&self) -> Option<&Arc<Buffer>> {
        self.indirect_buffer.as_ref()
    }

    pub fn set_target(&mut self, target: RenderTarget) {
        self.state.set_target(target);
    }

    pub fn set_graphics_pipeline(&mut self, pipeline: Arc<Pipeline>) {
        self.pipeline = pipeline;
        self.state.needs_recording = true;
    }

    pub fn set_descriptor_sets(&mut self, sets: Vec<vk::DescriptorSet>) {
        self.state.set_descriptor_sets(sets);
    }

    /// Sets (or replaces, after growth) the per-instance data buffer.
    pub fn set_instance_buffer(&mut self, buffer: Arc<Buffer>) {
        self.state.set_instance(buffer.handle(), buffer.size());
        self.instance_buffer = Some(buffer);
    }

    pub fn set_indirect_buffer(&mut self, buffer: Option<Arc<Buffer>>) {
        self.state
            .set_indirect(buffer.as_ref().map(|b| (b.handle(), b.size())));
        self.indirect_buffer = buffer;
    }

    /// Sets the draw range: the number of quad instances drawn.
    pub fn set_instance_count(&mut self, count: u32) {
        self.state.set_instance_count(count);
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.state.set_clear_color(color);
    }

    /// Re-records the command buffer if anything changed since the last
    /// recording.
    ///
    /// Recording is idempotent given fixed inputs: the existing command
    /// buffer is reset and re-used, never leaked and re-allocated. When the
    /// dirty flag is clear this is a logged early-return.
    pub fn record(&mut self) -> Result<()> {
        if !self.state.needs_recording {
            log::debug!("rendering already recorded, nothing to do");
            return Ok(());
        }
        self.state.validate(self.pipeline.raw_set_layouts().len())?;

        let device = &self.ctx.device;
        let cmd = match self.command_buffer {
            Some(cmd) => {
                unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
                    .map_err(|e| Error::vulkan("vkResetCommandBuffer", e))?;
                cmd
            }
            None => {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.ctx.command_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
                    .map_err(|e| Error::vulkan("vkAllocateCommandBuffers", e))?[0];
                self.command_buffer = Some(cmd);
                cmd
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .map_err(|e| Error::vulkan("vkBeginCommandBuffer", e))?;

        let target = self.state.target;
        record_layout_barrier(
            device,
            cmd,
            target.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(target.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.state.clear_color,
                },
            });
        let color_attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.handle(),
            );
            if !self.state.descriptor_sets.is_empty() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline.layout(),
                    0,
                    &self.state.descriptor_sets,
                    &[],
                );
            }
            // Validated above: the instance buffer is present and non-empty.
            if let Some((instance_buffer, _)) = self.state.instance {
                device.cmd_bind_vertex_buffers(cmd, 0, &[instance_buffer], &[0]);
            }

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: target.extent.width as f32,
                height: target.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            match self.state.indirect {
                Some((indirect_buffer, _)) => {
                    device.cmd_draw_indirect(
                        cmd,
                        indirect_buffer,
                        0,
                        1,
                        std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
                    );
                }
                None => device.cmd_draw(cmd, 4, self.state.instance_count, 0, 0),
            }

            device.cmd_end_rendering(cmd);
        }

        record_layout_barrier(
            device,
            cmd,
            target.image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )?;

        unsafe { device.end_command_buffer(cmd) }
            .map_err(|e| Error::vulkan("vkEndCommandBuffer", e))?;

        self.state.mark_recorded();
        Ok(())
    }
}

impl Drop for Rendering {
    fn drop(&mut self) {
        if let Some(cmd) = self.command_buffer.take() {
            unsafe {
                self.ctx
                    .device
                    .free_command_buffers(self.ctx.command_pool, &[cmd])
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(width: u32, height: u32) -> RenderTarget {
        RenderTarget {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            extent: vk::Extent2D { width, height },
            format: vk::Format::B8G8R8A8_UNORM,
        }
    }

    fn wired_state() -> RenderingState {
        let mut state = RenderingState::new(target(800, 600));
        state.set_descriptor_sets(vec![vk::DescriptorSet::null()]);
        state.set_instance(vk::Buffer::null(), 4096);
        state.set_instance_count(16);
        state
    }

    #[test]
    fn dirty_on_creation_clean_after_recording() {
        let mut state = RenderingState::new(target(800, 600));
        assert!(state.needs_recording);
        state.mark_recorded();
        assert!(!state.needs_recording);
    }

    #[test]
    fn every_mutator_re_dirties() {
        let mutators: Vec<fn(&mut RenderingState)> = vec![
            |s| s.set_target(target(1024, 768)),
            |s| s.set_descriptor_sets(vec![vk::DescriptorSet::null()]),
            |s| s.set_instance(vk::Buffer::null(), 8192),
            |s| s.set_indirect(None),
            |s| s.set_instance_count(32),
            |s| s.set_clear_color([1.0, 0.0, 0.0, 1.0]),
        ];
        for mutate in mutators {
            let mut state = wired_state();
            state.mark_recorded();
            assert!(!state.needs_recording);
            mutate(&mut state);
            assert!(state.needs_recording);
        }
    }

    #[test]
    fn fully_wired_state_validates() {
        assert!(wired_state().validate(1).is_ok());
    }

    #[test]
    fn missing_instance_buffer_is_fatal() {
        let mut state = wired_state();
        state.instance = None;
        assert!(matches!(
            state.validate(1),
            Err(Error::MissingPrerequisite(_))
        ));
    }

    #[test]
    fn zero_size_buffers_are_fatal() {
        let mut state = wired_state();
        state.instance = Some((vk::Buffer::null(), 0));
        assert!(state.validate(1).is_err());

        let mut state = wired_state();
        state.indirect = Some((vk::Buffer::null(), 0));
        assert!(state.validate(1).is_err());
    }

    #[test]
    fn zero_extent_target_is_fatal() {
        let mut state = wired_state();
        state.target = target(0, 600);
        assert!(state.validate(1).is_err());
    }

    #[test]
    fn descriptor_set_count_must_match_pipeline() {
        let state = wired_state();
        assert!(state.validate(2).is_err());
        assert!(state.validate(1).is_ok());
    }
}
