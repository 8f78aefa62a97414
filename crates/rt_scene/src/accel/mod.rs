//! Acceleration structures
//!
//! - [`blas`]: one bottom-level structure per mesh, one geometry per primitive
//! - [`tlas`]: the scene-wide top-level structure, rebuilt when dirty
//! - [`instance`]: the GPU instance record referenced by a TLAS

pub mod blas;
pub mod instance;
pub mod tlas;

pub use blas::{BlasBuilder, BlasGeometry};
pub use instance::TlasInstance;
pub use tlas::{BlasSource, TlasBuildKind, TlasStats, TlasSynchronizer};

use ash::vk;
use crate::foundation::math::align_up;
use crate::render::allocator::GpuAllocator;
use crate::render::device::{
    AccelerationBuild, AccelerationBuildDesc, AccelerationLevel, BuildMode, DeviceAddress,
    DeviceCommand, GpuBuffer, MemoryClass, RenderDevice,
};
use crate::render::vulkan::VulkanResult;

/// An acceleration structure with its backing buffer and device address
#[derive(Debug)]
pub struct AccelerationStructure {
    handle: vk::AccelerationStructureKHR,
    buffer: GpuBuffer,
    address: DeviceAddress,
    level: AccelerationLevel,
}

impl AccelerationStructure {
    pub(crate) const fn new(
        handle: vk::AccelerationStructureKHR,
        buffer: GpuBuffer,
        address: DeviceAddress,
        level: AccelerationLevel,
    ) -> Self {
        Self { handle, buffer, address, level }
    }

    /// Raw structure handle
    pub const fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Device address referenced by TLAS instances or shader bindings
    pub const fn device_address(&self) -> DeviceAddress {
        self.address
    }

    /// Bottom or top level
    pub const fn level(&self) -> AccelerationLevel {
        self.level
    }

    /// Backing buffer
    pub const fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    /// Destroy the structure, then its backing buffer
    pub fn destroy(self, device: &dyn RenderDevice) {
        device.destroy_acceleration_structure(self.handle);
        device.destroy_buffer(self.buffer);
    }
}

/// Allocate a scratch buffer whose address honours the device's minimum
/// scratch alignment
pub(crate) fn create_scratch(allocator: &GpuAllocator, size: u64) -> VulkanResult<GpuBuffer> {
    let alignment = allocator.device().limits().min_scratch_alignment.max(1);
    allocator.create_buffer(
        align_up(size.max(1), alignment),
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryClass::DeviceLocal,
        Some(alignment),
    )
}

/// Query sizes, allocate the backing and scratch buffers, create and build a
/// new structure, then resolve its address
///
/// Blocks until the build has completed. Scratch memory is released on every
/// path; the structure and its buffer are released on failure.
pub(crate) fn build_new(
    allocator: &GpuAllocator,
    desc: &AccelerationBuildDesc<'_>,
) -> VulkanResult<AccelerationStructure> {
    let device = allocator.device();
    let sizes = device.acceleration_structure_build_sizes(desc)?;
    log::trace!(
        "{:?} sizes: structure={} scratch={} update={}",
        desc.level,
        sizes.acceleration_structure_size,
        sizes.build_scratch_size,
        sizes.update_scratch_size
    );

    let buffer = allocator.create_buffer(
        sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        MemoryClass::DeviceLocal,
        None,
    )?;

    let handle = match device.create_acceleration_structure(desc.level, &buffer, sizes.acceleration_structure_size) {
        Ok(handle) => handle,
        Err(e) => {
            allocator.destroy_buffer(buffer);
            return Err(e);
        }
    };
    let structure = AccelerationStructure::new(handle, buffer, 0, desc.level);

    let built = create_scratch(allocator, sizes.build_scratch_size).and_then(|scratch| {
        let result = scratch.require_address().and_then(|scratch_address| {
            device.submit_and_wait(&[DeviceCommand::BuildAccelerationStructure(AccelerationBuild {
                desc: *desc,
                mode: BuildMode::Build,
                dst: handle,
                scratch_address,
            })])
        });
        allocator.destroy_buffer(scratch);
        result
    });

    match built.and_then(|()| device.acceleration_structure_address(handle)) {
        Ok(address) => Ok(AccelerationStructure { address, ..structure }),
        Err(e) => {
            structure.destroy(&**device);
            Err(e)
        }
    }
}
