//! The shared GPU context handed down from the bootstrap layer.
//!
//! Everything in here is created and ultimately destroyed by the bootstrap
//! code that owns instance, device and swapchain setup. The context only
//! carries the handles the resource layer needs; it never tears them down.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Bootstrap-owned device state shared by every resource in this crate.
///
/// Passed explicitly (usually as `Arc<GpuContext>`) into every operation
/// instead of living in a hidden global. Host code is single-threaded; the
/// allocator sits behind a mutex only because it requires `&mut` access
/// through shared resources.
///
/// `command_pool` must be created with
/// `COMMAND_POOL_CREATE_RESET_COMMAND_BUFFER`: cached rendering command
/// buffers are reset individually on re-record, not through a pool reset.
pub struct GpuContext {
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub allocator: Mutex<Allocator>,
    pub descriptor_pool: vk::DescriptorPool,
    pub command_pool: vk::CommandPool,
}

impl GpuContext {
    pub fn new(
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        allocator: Allocator,
        descriptor_pool: vk::DescriptorPool,
        command_pool: vk::CommandPool,
    ) -> Self {
        Self {
            device,
            queue,
            queue_family_index,
            allocator: Mutex::new(allocator),
            descriptor_pool,
            command_pool,
        }
    }

    /// Records and submits a single-use command buffer, blocking until the
    /// GPU has finished executing it.
    ///
    /// This is the one suspension point of the transfer paths: staged buffer
    /// updates, image uploads and layout transition sequences all run through
    /// here, and the unbounded fence wait guarantees no staging resource is
    /// freed while the GPU might still read it.
    pub fn submit_one_shot(
        &self,
        record: impl FnOnce(vk::CommandBuffer) -> Result<()>,
    ) -> Result<()> {
        let device = &self.device;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| Error::vulkan("vkAllocateCommandBuffers", e))?[0];

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .map_err(|e| Error::vulkan("vkBeginCommandBuffer", e))?;

            record(cmd)?;

            unsafe { device.end_command_buffer(cmd) }
                .map_err(|e| Error::vulkan("vkEndCommandBuffer", e))?;

            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
                .map_err(|e| Error::vulkan("vkCreateFence", e))?;

            let buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&buffers);
            let submitted = unsafe { device.queue_submit(self.queue, &[submit_info], fence) }
                .map_err(|e| Error::vulkan("vkQueueSubmit", e));

            let waited = submitted.and_then(|_| {
                unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
                    .map_err(|e| Error::vulkan("vkWaitForFences", e))
            });

            unsafe { device.destroy_fence(fence, None) };
            waited
        })();

        unsafe { device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    /// Allocates and binds backing memory for a buffer.
    pub(crate) fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Allocation> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            return Err(Error::vulkan("vkBindBufferMemory", e));
        }
        Ok(allocation)
    }

    /// Allocates and binds backing memory for an image.
    pub(crate) fn allocate_image_memory(
        &self,
        image: vk::Image,
        name: &str,
    ) -> Result<Allocation> {
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free_allocation(allocation);
            return Err(Error::vulkan("vkBindImageMemory", e));
        }
        Ok(allocation)
    }

    /// Returns an allocation to the shared allocator. Failures are logged
    /// rather than propagated because this runs from `Drop` impls.
    pub(crate) fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::warn!("failed to free gpu allocation: {e}");
        }
    }
}
