//! Command buffer management
//!
//! One-time command buffers for uploads and acceleration-structure builds.
//! Every submission is fenced and waited on before returning.

use ash::extensions::khr::AccelerationStructure;
use ash::{vk, Device};
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool
    pub fn new(device: Device, queue_family_index: u32) -> VulkanResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device
                .create_command_pool(&pool_create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, command_pool })
    }

    /// Begin single-time command buffer
    pub fn begin_single_time(&self) -> VulkanResult<CommandRecorder<'_>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)?
        }
        .into_iter()
        .next()
        .ok_or_else(|| VulkanError::InvalidOperation {
            reason: "Driver returned no command buffer".to_string(),
        })?;

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) } {
            unsafe { self.device.free_command_buffers(self.command_pool, &[command_buffer]) };
            return Err(VulkanError::Api(e));
        }

        Ok(CommandRecorder {
            pool: self,
            command_buffer,
        })
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// A one-time command buffer being recorded
///
/// Freed when dropped, whether or not it was submitted.
pub struct CommandRecorder<'a> {
    pool: &'a CommandPool,
    command_buffer: vk::CommandBuffer,
}

impl CommandRecorder<'_> {
    fn device(&self) -> &Device {
        &self.pool.device
    }

    /// Copy a byte range between buffers
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe {
            self.device().cmd_copy_buffer(self.command_buffer, src, dst, &[region]);
        }
    }

    /// Transition an image between layouts for a transfer upload
    pub fn transition_image(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> VulkanResult<()> {
        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR | vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
            _ => {
                return Err(VulkanError::InvalidOperation {
                    reason: format!("Unsupported layout transition {old_layout:?} -> {new_layout:?}"),
                })
            }
        };

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        unsafe {
            self.device().cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    }

    /// Copy tightly packed texels into mip 0 of an image in `TRANSFER_DST_OPTIMAL`
    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, extent: (u32, u32)) {
        let region = vk::BufferImageCopy::builder()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: extent.0,
                height: extent.1,
                depth: 1,
            })
            .build();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
    }

    /// Make prior transfers and builds visible to the next build
    pub fn acceleration_structure_barrier(&mut self) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(
                vk::AccessFlags::TRANSFER_WRITE
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            )
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.command_buffer,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Record one acceleration-structure build
    pub fn build_acceleration_structure(
        &mut self,
        loader: &AccelerationStructure,
        info: vk::AccelerationStructureBuildGeometryInfoKHR,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        unsafe {
            loader.cmd_build_acceleration_structures(self.command_buffer, &[info], &[ranges]);
        }
    }

    /// End recording, submit to `queue` and block on a fence
    pub fn submit_and_wait(self, queue: vk::Queue) -> VulkanResult<()> {
        let device = self.device();
        unsafe {
            device
                .end_command_buffer(self.command_buffer)
                .map_err(VulkanError::Api)?;

            let fence = device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(VulkanError::Api)?;
            let command_buffers = [self.command_buffer];
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();

            let result = device
                .queue_submit(queue, &[submit], fence)
                .and_then(|()| device.wait_for_fences(&[fence], true, u64::MAX));
            device.destroy_fence(fence, None);
            result.map_err(VulkanError::Api)
        }
    }
}

impl Drop for CommandRecorder<'_> {
    fn drop(&mut self) {
        unsafe {
            self.pool
                .device
                .free_command_buffers(self.pool.command_pool, &[self.command_buffer]);
        }
    }
}
