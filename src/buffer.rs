//! GPU buffers with residency-driven data paths.
//!
//! Every buffer is classified once at creation: declared usage decides
//! whether its memory should live host-side or device-side, and that class,
//! not the call site, picks the data path for every later update, clear or
//! copy. Host-preferred buffers are written through their persistent mapping;
//! device-preferred buffers are fed through a transient staging buffer and a
//! fenced one-shot copy, so by the time any operation returns the data is
//! GPU-visible and the staging memory is already gone.
//!
//! Sizes are fixed for the lifetime of a buffer. Growing means creating a
//! larger buffer and copying the old contents over ([`Buffer::grown`]); there
//! is no in-place reallocation of GPU memory.

use std::ptr;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use crate::context::GpuContext;
use crate::error::{Error, Result};

/// Where a buffer's backing memory should live, derived from declared usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Directly host-writable; updates go through the mapping.
    HostPreferred,
    /// Efficient for the GPU only; updates are staged and copied.
    DevicePreferred,
    /// No strong signal from usage; takes the device data path.
    Auto,
}

impl Residency {
    /// Transfer-only buffers are host-preferred; anything the GPU reads
    /// during a draw (vertex/index/indirect/uniform/storage) is
    /// device-preferred; the rest is auto.
    pub fn from_usage(usage: vk::BufferUsageFlags) -> Residency {
        let device_read = vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::INDIRECT_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER;
        let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        if usage.intersects(device_read) {
            Residency::DevicePreferred
        } else if !usage.is_empty() && transfer.contains(usage) {
            Residency::HostPreferred
        } else {
            Residency::Auto
        }
    }

    fn memory_location(self) -> MemoryLocation {
        match self {
            Residency::HostPreferred => MemoryLocation::CpuToGpu,
            Residency::DevicePreferred | Residency::Auto => MemoryLocation::GpuOnly,
        }
    }

    fn is_host(self) -> bool {
        matches!(self, Residency::HostPreferred)
    }
}

/// A GPU buffer with fixed size and a residency class.
pub struct Buffer {
    ctx: Arc<GpuContext>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    usage: vk::BufferUsageFlags,
    residency: Residency,
}

impl Buffer {
    /// Creates a buffer of `size` bytes for the declared `usage`.
    ///
    /// Transfer source/destination usage is always added on top of the
    /// declared flags so the staged update, copy and read-back paths work
    /// regardless of residency. Residency itself is derived from the
    /// *declared* usage only.
    pub fn new(ctx: Arc<GpuContext>, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        let residency = Residency::from_usage(usage);
        let full_usage =
            usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(full_usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { ctx.device.create_buffer(&create_info, None) }
            .map_err(|e| Error::vulkan("vkCreateBuffer", e))?;

        let allocation =
            match ctx.allocate_buffer_memory(handle, residency.memory_location(), "buffer") {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { ctx.device.destroy_buffer(handle, None) };
                    return Err(e);
                }
            };

        Ok(Self {
            ctx,
            handle,
            allocation: Some(allocation),
            size,
            usage,
            residency,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Writes `data` into the buffer at `offset`.
    ///
    /// A zero-length write is a silent no-op. A range past the fixed size is
    /// a usage error, raised before any GPU work is issued.
    pub fn update(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        validate_range("buffer update", self.size, offset, data.len() as u64)?;

        if self.residency.is_host() {
            self.write_mapped(offset, data)
        } else {
            log::debug!(
                "staging {} byte update into device buffer at offset {offset}",
                data.len()
            );
            let staging = Self::staging(self.ctx.clone(), data.len() as u64)?;
            staging.write_mapped(0, data)?;
            self.ctx.submit_one_shot(|cmd| {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: data.len() as u64,
                };
                unsafe {
                    self.ctx
                        .device
                        .cmd_copy_buffer(cmd, staging.handle, self.handle, &[region])
                };
                Ok(())
            })
            // Staging is dropped here, after the fence wait.
        }
    }

    /// Typed convenience over [`Buffer::update`].
    pub fn update_typed<T: bytemuck::NoUninit>(&self, offset: u64, data: &[T]) -> Result<()> {
        self.update(offset, bytemuck::cast_slice(data))
    }

    /// Fills the whole buffer with `byte`.
    pub fn clear(&self, byte: u8) -> Result<()> {
        if self.residency.is_host() {
            let fill = vec![byte; self.size as usize];
            self.write_mapped(0, &fill)
        } else if fill_buffer_covers(self.size) {
            let word = u32::from_ne_bytes([byte; 4]);
            self.ctx.submit_one_shot(|cmd| {
                unsafe {
                    self.ctx
                        .device
                        .cmd_fill_buffer(cmd, self.handle, 0, vk::WHOLE_SIZE, word)
                };
                Ok(())
            })
        } else {
            let fill = vec![byte; self.size as usize];
            self.update(0, &fill)
        }
    }

    /// Copies `size` bytes from `src` to `dst`.
    ///
    /// Both ranges are validated independently before the GPU copy is issued.
    /// A zero-size copy is a silent no-op.
    pub fn copy(
        src: &Buffer,
        dst: &Buffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        validate_range("buffer copy source", src.size, src_offset, size)?;
        validate_range("buffer copy destination", dst.size, dst_offset, size)?;

        // When both sides are host-mapped the copy never has to touch the GPU.
        if src.residency.is_host() && dst.residency.is_host() {
            let data = src.read_mapped(src_offset, size)?;
            return dst.write_mapped(dst_offset, &data);
        }

        src.ctx.submit_one_shot(|cmd| {
            let region = vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            };
            unsafe {
                src.ctx
                    .device
                    .cmd_copy_buffer(cmd, src.handle, dst.handle, &[region])
            };
            Ok(())
        })
    }

    /// Reads `len` bytes back from the buffer at `offset`.
    ///
    /// Host-preferred buffers are read straight from the mapping;
    /// device-preferred buffers are copied into a transient staging buffer
    /// first.
    pub fn read_back(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        validate_range("buffer read-back", self.size, offset, len)?;

        if self.residency.is_host() {
            self.read_mapped(offset, len)
        } else {
            let staging = Self::staging(self.ctx.clone(), len)?;
            Self::copy(self, &staging, offset, 0, len)?;
            staging.read_mapped(0, len)
        }
    }

    /// Creates a larger buffer with the same declared usage and copies this
    /// buffer's contents into it. The caller replaces (and drops) the old
    /// buffer; this is the only supported growth pattern.
    pub fn grown(&self, new_size: u64) -> Result<Buffer> {
        let bigger = Buffer::new(self.ctx.clone(), new_size, self.usage)?;
        Self::copy(self, &bigger, 0, 0, self.size.min(new_size))?;
        Ok(bigger)
    }

    fn staging(ctx: Arc<GpuContext>, size: u64) -> Result<Buffer> {
        // Transfer-only usage classifies as host-preferred, which is exactly
        // what a staging hop needs.
        Buffer::new(ctx, size, vk::BufferUsageFlags::TRANSFER_SRC)
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or(Error::NotHostMapped)
    }

    fn write_mapped(&self, offset: u64, data: &[u8]) -> Result<()> {
        let base = self.mapped_ptr()?;
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset as usize), data.len()) };
        Ok(())
    }

    fn read_mapped(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let base = self.mapped_ptr()?;
        let mut out = vec![0u8; len as usize];
        unsafe { ptr::copy_nonoverlapping(base.add(offset as usize), out.as_mut_ptr(), len as usize) };
        Ok(out)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_buffer(self.handle, None) };
        if let Some(allocation) = self.allocation.take() {
            self.ctx.free_allocation(allocation);
        }
    }
}

/// Whether `vkCmdFillBuffer` with `VK_WHOLE_SIZE` reaches every byte of a
/// buffer of `size` bytes. The fill extent is rounded down to a multiple of
/// 4, so unaligned sizes must take the staged write path instead.
fn fill_buffer_covers(size: u64) -> bool {
    size % 4 == 0
}

/// Rejects any `offset + len` range that does not fit in `size` bytes.
fn validate_range(op: &'static str, size: u64, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(Error::OutOfBounds {
            op,
            offset,
            len,
            size,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_only_usage_is_host_preferred() {
        assert_eq!(
            Residency::from_usage(vk::BufferUsageFlags::TRANSFER_SRC),
            Residency::HostPreferred
        );
        assert_eq!(
            Residency::from_usage(
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
            ),
            Residency::HostPreferred
        );
    }

    #[test]
    fn draw_visible_usage_is_device_preferred() {
        for usage in [
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::BufferUsageFlags::INDEX_BUFFER,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        ] {
            assert_eq!(Residency::from_usage(usage), Residency::DevicePreferred);
        }
        // Device wins even when mixed with transfer usage.
        assert_eq!(
            Residency::from_usage(
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            ),
            Residency::DevicePreferred
        );
    }

    #[test]
    fn unclassified_usage_is_auto() {
        assert_eq!(
            Residency::from_usage(vk::BufferUsageFlags::empty()),
            Residency::Auto
        );
        assert_eq!(
            Residency::from_usage(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
            Residency::Auto
        );
    }

    #[test]
    fn whole_size_fill_only_covers_word_multiples() {
        for size in [0, 4, 8, 4096] {
            assert!(fill_buffer_covers(size));
        }
        // A trailing partial word would be left stale by the fill command,
        // so these sizes must clear through a staged write.
        for size in [1, 2, 3, 5, 6, 4095] {
            assert!(!fill_buffer_covers(size));
        }
    }

    #[test]
    fn in_bounds_ranges_pass() {
        assert!(validate_range("t", 64, 0, 64).is_ok());
        assert!(validate_range("t", 64, 63, 1).is_ok());
        assert!(validate_range("t", 64, 64, 0).is_ok());
    }

    #[test]
    fn out_of_bounds_ranges_fail() {
        assert!(matches!(
            validate_range("t", 64, 0, 65),
            Err(Error::OutOfBounds { size: 64, .. })
        ));
        assert!(matches!(
            validate_range("t", 64, 60, 8),
            Err(Error::OutOfBounds { offset: 60, .. })
        ));
        // offset + len overflowing u64 must not wrap into acceptance.
        assert!(validate_range("t", 64, u64::MAX, 2).is_err());
    }
}
