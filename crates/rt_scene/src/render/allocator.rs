//! Device buffer and image allocation with staged uploads
//!
//! Device-local resources are filled through a temporary host-visible staging
//! buffer and a one-time copy that blocks until the device is done. Uploads are
//! load-time work, so no overlap with frame rendering is attempted.

use ash::vk;
use std::sync::Arc;
use crate::render::device::{
    BufferDesc, DeviceCommand, GpuBuffer, GpuImage, ImageDesc, MemoryClass, RenderDevice,
};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Allocator front end shared by every subsystem through the render context
#[derive(Clone)]
pub struct GpuAllocator {
    device: Arc<dyn RenderDevice>,
}

impl GpuAllocator {
    /// Wrap a device
    pub fn new(device: Arc<dyn RenderDevice>) -> Self {
        Self { device }
    }

    /// Underlying device
    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    /// Allocate a buffer
    ///
    /// Buffers whose usage includes `SHADER_DEVICE_ADDRESS` come back with
    /// their address already resolved.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryClass,
        alignment: Option<u64>,
    ) -> VulkanResult<GpuBuffer> {
        let mut desc = BufferDesc::new(size, usage, memory);
        if let Some(alignment) = alignment {
            desc = desc.with_alignment(alignment);
        }
        self.device.create_buffer(&desc)
    }

    /// Copy `data` into the start of `dst` through a staging buffer
    ///
    /// Blocks until the copy has completed. The staging buffer is released on
    /// every path.
    pub fn stage_and_upload(&self, dst: &GpuBuffer, data: &[u8]) -> VulkanResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        if size > dst.size() {
            return Err(VulkanError::InvalidMemoryAccess {
                reason: format!("upload of {size} bytes into buffer of {}", dst.size()),
            });
        }

        let staging = self.create_buffer(size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryClass::Upload, None)?;
        let result = self.device.write_buffer(&staging, 0, data).and_then(|()| {
            self.device.submit_and_wait(&[DeviceCommand::CopyBuffer {
                src: &staging,
                dst,
                size,
            }])
        });
        self.device.destroy_buffer(staging);

        log::debug!("Staged upload of {size} bytes");
        result
    }

    /// Allocate a device-local buffer and fill it with `data`
    pub fn create_buffer_with_data(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<GpuBuffer> {
        let buffer = self.create_buffer(
            data.len().max(1) as u64,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryClass::DeviceLocal,
            None,
        )?;
        if let Err(e) = self.stage_and_upload(&buffer, data) {
            self.device.destroy_buffer(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Release a buffer
    pub fn destroy_buffer(&self, buffer: GpuBuffer) {
        self.device.destroy_buffer(buffer);
    }

    /// Allocate a sampled 2D image
    pub fn create_image(&self, desc: &ImageDesc) -> VulkanResult<GpuImage> {
        self.device.create_image(desc)
    }

    /// Upload tightly packed texels into a whole image, leaving it shader-readable
    pub fn upload_image(&self, image: &GpuImage, texels: &[u8]) -> VulkanResult<()> {
        let staging = self.create_buffer(
            texels.len().max(1) as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryClass::Upload,
            None,
        )?;
        let result = self.device.write_buffer(&staging, 0, texels).and_then(|()| {
            self.device
                .submit_and_wait(&[DeviceCommand::CopyBufferToImage { src: &staging, dst: image }])
        });
        self.device.destroy_buffer(staging);
        result
    }

    /// Allocate an image and fill it with `texels`
    pub fn create_image_with_data(&self, desc: &ImageDesc, texels: &[u8]) -> VulkanResult<GpuImage> {
        if texels.len() as u64 != desc.byte_size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "{}x{} {:?} image needs {} bytes, got {}",
                    desc.width,
                    desc.height,
                    desc.format,
                    desc.byte_size(),
                    texels.len()
                ),
            });
        }
        let image = self.create_image(desc)?;
        if let Err(e) = self.upload_image(&image, texels) {
            self.device.destroy_image(image);
            return Err(e);
        }
        Ok(image)
    }

    /// Release an image
    pub fn destroy_image(&self, image: GpuImage) {
        self.device.destroy_image(image);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::recording::RecordingDevice;

    fn setup() -> (Arc<RecordingDevice>, GpuAllocator) {
        let device = Arc::new(RecordingDevice::new());
        let allocator = GpuAllocator::new(device.clone());
        (device, allocator)
    }

    #[test]
    fn test_staged_upload_reaches_device_local_buffer() {
        let (device, allocator) = setup();
        let data: Vec<u8> = (0..64).collect();
        let buffer = allocator
            .create_buffer_with_data(&data, vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();

        assert_eq!(buffer.memory(), MemoryClass::DeviceLocal);
        assert_eq!(device.buffer_contents(&buffer).unwrap(), data);
        // Staging buffer is gone; only the destination remains.
        let stats = device.stats();
        assert_eq!(stats.live_buffers(), 1);
        assert_eq!(stats.buffer_copies, 1);
        assert_eq!(stats.submissions, 1);
    }

    #[test]
    fn test_device_address_resolved_at_creation() {
        let (_device, allocator) = setup();
        let buffer = allocator
            .create_buffer(
                256,
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryClass::DeviceLocal,
                Some(512),
            )
            .unwrap();
        let address = buffer.device_address().unwrap();
        assert_eq!(address % 512, 0);
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let (device, allocator) = setup();
        let buffer = allocator
            .create_buffer(4, vk::BufferUsageFlags::TRANSFER_DST, MemoryClass::DeviceLocal, None)
            .unwrap();
        assert!(allocator.stage_and_upload(&buffer, &[0; 8]).is_err());
        assert_eq!(device.stats().live_buffers(), 1);
    }

    #[test]
    fn test_out_of_memory_propagates() {
        let device = Arc::new(RecordingDevice::new().with_memory_budget(32));
        let allocator = GpuAllocator::new(device.clone());
        let result = allocator.create_buffer_with_data(&[0; 64], vk::BufferUsageFlags::STORAGE_BUFFER);
        assert!(result.unwrap_err().is_out_of_memory());
        assert_eq!(device.stats().live_buffers(), 0);
    }

    #[test]
    fn test_image_upload() {
        let (device, allocator) = setup();
        let desc = ImageDesc::texture(2, 1, vk::Format::R8G8B8A8_UNORM);
        let texels = [255, 0, 0, 255, 0, 255, 0, 255];
        let image = allocator.create_image_with_data(&desc, &texels).unwrap();
        assert_eq!(device.image_contents(&image).unwrap(), texels);
        assert!(allocator.create_image_with_data(&desc, &texels[..4]).is_err());
    }
}
