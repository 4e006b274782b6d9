//! Sampled images with tracked access layouts.
//!
//! An [`Image`]'s `layout` field is the single piece of mutable state in this
//! module and must always reflect the image's real access mode before any
//! command references it. Every transition goes through the fixed
//! access-mask/pipeline-stage tables below and updates the field together
//! with the barrier that performs it; any layout pair outside the tables is
//! an error rather than a guess.
//!
//! Pixel uploads never map image memory directly. They stage through a
//! transient host buffer and run transition → copy → transition inside one
//! single-use command buffer, fully fenced, so no other command can ever
//! observe the image in an intermediate layout.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::error::{Error, Result};

/// Access mask and pipeline stage to wait on when leaving `old` layout.
pub(crate) fn src_access_and_stage(
    old: vk::ImageLayout,
) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    match old {
        vk::ImageLayout::UNDEFINED => Some((
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        )),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Some((
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Some((
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        )),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Some((
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        vk::ImageLayout::PRESENT_SRC_KHR => Some((
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )),
        _ => None,
    }
}

/// Access mask and pipeline stage to make available when entering `new`
/// layout. Mirror of [`src_access_and_stage`], except that transitioning
/// *into* `UNDEFINED` is never valid.
pub(crate) fn dst_access_and_stage(
    new: vk::ImageLayout,
) -> Option<(vk::AccessFlags, vk::PipelineStageFlags)> {
    match new {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => Some((
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => Some((
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        )),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => Some((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => Some((
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        vk::ImageLayout::PRESENT_SRC_KHR => Some((
            vk::AccessFlags::MEMORY_READ,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )),
        _ => None,
    }
}

/// Records exactly one pipeline barrier moving `image` from `old` to `new`.
///
/// Shared by [`Image::transition_layout`] and the command recording cache,
/// which also transitions swapchain images it does not own.
pub(crate) fn record_layout_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let unsupported = || Error::UnsupportedTransition { from: old, to: new };
    let (src_access, src_stage) = src_access_and_stage(old).ok_or_else(unsupported)?;
    let (dst_access, dst_stage) = dst_access_and_stage(new).ok_or_else(unsupported)?;

    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
    Ok(())
}

/// A sampled 2D image with its view, sampler and tracked layout.
pub struct Image {
    ctx: Arc<GpuContext>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    format: vk::Format,
    extent: vk::Extent2D,
    layout: vk::ImageLayout,
}

impl Image {
    /// Creates a device-local sampled image. Usage also includes transfer
    /// and color-attachment bits so the image can receive staged uploads and
    /// serve as an offscreen render target. Layout starts `UNDEFINED`.
    pub fn new(ctx: Arc<GpuContext>, extent: vk::Extent2D, format: vk::Format) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { ctx.device.create_image(&create_info, None) }
            .map_err(|e| Error::vulkan("vkCreateImage", e))?;

        let allocation = match ctx.allocate_image_memory(handle, "image") {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(handle, None) };
                return Err(e);
            }
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { ctx.device.create_image_view(&view_info, None) }
            .map_err(|e| Error::vulkan("vkCreateImageView", e))?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE);
        let sampler = unsafe { ctx.device.create_sampler(&sampler_info, None) }
            .map_err(|e| Error::vulkan("vkCreateSampler", e))?;

        Ok(Self {
            ctx,
            handle,
            allocation: Some(allocation),
            view,
            sampler,
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Records a layout transition into `cmd` and updates the tracked
    /// layout.
    ///
    /// Requesting the layout the image is already in is a logged no-op: no
    /// redundant barrier is ever emitted. An unknown old or new layout fails
    /// with an unsupported-transition error before anything is recorded.
    pub fn transition_layout(
        &mut self,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        if new_layout == self.layout {
            log::warn!("image already in layout {new_layout:?}, skipping transition");
            return Ok(());
        }
        record_layout_barrier(&self.ctx.device, cmd, self.handle, self.layout, new_layout)?;
        self.layout = new_layout;
        Ok(())
    }

    /// Uploads tightly-packed pixel data into `rect` and leaves the image in
    /// `final_layout`.
    ///
    /// The upload always stages through a transient host buffer and runs the
    /// whole transition/copy/transition sequence in one fenced single-use
    /// submission.
    pub fn copy_data(
        &mut self,
        final_layout: vk::ImageLayout,
        pixels: &[u8],
        rect: vk::Rect2D,
        pixel_size: u32,
    ) -> Result<()> {
        validate_rect(rect, self.extent)?;
        let expected =
            u64::from(rect.extent.width) * u64::from(rect.extent.height) * u64::from(pixel_size);
        if (pixels.len() as u64) < expected {
            return Err(Error::PixelDataSize {
                expected,
                supplied: pixels.len() as u64,
            });
        }

        // Validate both transitions up front so nothing is recorded on a
        // bad layout pair.
        let old = self.layout;
        let to_dst = || Error::UnsupportedTransition {
            from: old,
            to: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        };
        src_access_and_stage(old).ok_or_else(to_dst)?;
        dst_access_and_stage(final_layout).ok_or(Error::UnsupportedTransition {
            from: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            to: final_layout,
        })?;

        let staging = Buffer::new(
            self.ctx.clone(),
            expected,
            vk::BufferUsageFlags::TRANSFER_SRC,
        )?;
        staging.update(0, &pixels[..expected as usize])?;

        let ctx = self.ctx.clone();
        ctx.submit_one_shot(|cmd| {
            record_layout_barrier(
                &ctx.device,
                cmd,
                self.handle,
                old,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D {
                    x: rect.offset.x,
                    y: rect.offset.y,
                    z: 0,
                },
                image_extent: vk::Extent3D {
                    width: rect.extent.width,
                    height: rect.extent.height,
                    depth: 1,
                },
            };
            unsafe {
                ctx.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    self.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };

            record_layout_barrier(
                &ctx.device,
                cmd,
                self.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                final_layout,
            )
        })?;
        // Staging buffer dropped after the fence wait above.

        self.layout = final_layout;
        Ok(())
    }

    /// Decodes a PNG file and uploads it over the top-left of the image,
    /// leaving it in `final_layout`. RGB data is expanded to RGBA8; the
    /// decoded frame must fit inside the image extent.
    pub fn load_from_file(
        &mut self,
        path: impl AsRef<Path>,
        final_layout: vk::ImageLayout,
    ) -> Result<()> {
        let (width, height, pixels) = decode_png_rgba8(path.as_ref())?;
        let rect = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        };
        self.copy_data(final_layout, &pixels, rect, 4)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_sampler(self.sampler, None);
            self.ctx.device.destroy_image_view(self.view, None);
            self.ctx.device.destroy_image(self.handle, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.ctx.free_allocation(allocation);
        }
    }
}

fn validate_rect(rect: vk::Rect2D, extent: vk::Extent2D) -> Result<()> {
    let fits = rect.offset.x >= 0
        && rect.offset.y >= 0
        && rect.offset.x as u64 + u64::from(rect.extent.width) <= u64::from(extent.width)
        && rect.offset.y as u64 + u64::from(rect.extent.height) <= u64::from(extent.height);
    if fits {
        Ok(())
    } else {
        Err(Error::RectOutOfBounds {
            x: rect.offset.x,
            y: rect.offset.y,
            rect_w: rect.extent.width,
            rect_h: rect.extent.height,
            img_w: extent.width,
            img_h: extent.height,
        })
    }
}

/// Decodes `path` into tightly-packed RGBA8 pixels.
fn decode_png_rgba8(path: &Path) -> Result<(u32, u32, Vec<u8>)> {
    let decoder = png::Decoder::new(std::fs::File::open(path)?);
    let mut reader = decoder.read_info()?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf)?;
    buf.truncate(info.buffer_size());

    if info.bit_depth != png::BitDepth::Eight {
        return Err(Error::UnsupportedBitDepth(info.bit_depth));
    }
    let pixels = match info.color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => expand_rgb_to_rgba(&buf),
        other => return Err(Error::UnsupportedColorType(other)),
    };
    Ok((info.width, info.height, pixels))
}

fn expand_rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for px in rgb.chunks_exact(3) {
        rgba.extend_from_slice(px);
        rgba.push(u8::MAX);
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED_OLD: [vk::ImageLayout; 6] = [
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    ];

    #[test]
    fn source_masks_match_the_table() {
        assert_eq!(
            src_access_and_stage(vk::ImageLayout::UNDEFINED),
            Some((
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TOP_OF_PIPE
            ))
        );
        assert_eq!(
            src_access_and_stage(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            Some((
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            ))
        );
        assert_eq!(
            src_access_and_stage(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            Some((
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TRANSFER
            ))
        );
        assert_eq!(
            src_access_and_stage(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            Some((
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::FRAGMENT_SHADER
            ))
        );
        assert_eq!(
            src_access_and_stage(vk::ImageLayout::PRESENT_SRC_KHR),
            Some((
                vk::AccessFlags::MEMORY_READ,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            ))
        );
    }

    #[test]
    fn destination_masks_mirror_the_source_table() {
        for layout in SUPPORTED_OLD {
            if layout == vk::ImageLayout::UNDEFINED {
                // Transitioning into UNDEFINED is never valid.
                assert_eq!(dst_access_and_stage(layout), None);
            } else {
                assert_eq!(dst_access_and_stage(layout), src_access_and_stage(layout));
            }
        }
    }

    #[test]
    fn every_supported_pair_resolves() {
        for old in SUPPORTED_OLD {
            for new in SUPPORTED_OLD {
                if new == vk::ImageLayout::UNDEFINED {
                    continue;
                }
                assert!(src_access_and_stage(old).is_some());
                assert!(dst_access_and_stage(new).is_some());
            }
        }
    }

    #[test]
    fn layouts_outside_the_table_are_rejected() {
        for layout in [
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PREINITIALIZED,
        ] {
            assert_eq!(src_access_and_stage(layout), None);
            assert_eq!(dst_access_and_stage(layout), None);
        }
    }

    #[test]
    fn rect_validation() {
        let extent = vk::Extent2D {
            width: 64,
            height: 32,
        };
        let rect = |x, y, w, h| vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D {
                width: w,
                height: h,
            },
        };

        assert!(validate_rect(rect(0, 0, 64, 32), extent).is_ok());
        assert!(validate_rect(rect(32, 16, 32, 16), extent).is_ok());
        assert!(validate_rect(rect(0, 0, 65, 32), extent).is_err());
        assert!(validate_rect(rect(1, 0, 64, 32), extent).is_err());
        assert!(validate_rect(rect(-1, 0, 4, 4), extent).is_err());
    }

    #[test]
    fn rgb_expands_to_opaque_rgba() {
        let rgb = [1, 2, 3, 4, 5, 6];
        assert_eq!(expand_rgb_to_rgba(&rgb), vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }
}
