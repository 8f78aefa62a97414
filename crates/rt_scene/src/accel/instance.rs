//! TLAS instance records
//!
//! Byte-compatible with `VkAccelerationStructureInstanceKHR` (64 bytes) so the
//! array can be uploaded as-is and decoded again by the recording device.

use bytemuck::{Pod, Zeroable};
use ash::vk;
use crate::foundation::math::{Mat4, to_row_major_3x4};
use crate::render::device::DeviceAddress;

/// Visibility mask with every bit set
pub const MASK_ALL: u8 = 0xFF;

const CUSTOM_INDEX_MASK: u32 = 0x00FF_FFFF;

/// `vk::AccelerationStructureInstanceKHR` with `Pod`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct TlasInstance {
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    /// Custom index in bits 0..24, visibility mask in bits 24..32
    pub instance_custom_index_and_mask: u32,
    /// SBT record offset in bits 0..24, instance flags in bits 24..32
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    /// Device address of the referenced BLAS
    pub acceleration_structure_reference: u64,
}

impl TlasInstance {
    /// Build an instance from a column-major world matrix
    ///
    /// Back-face culling is disabled and the mask has every bit set. Only the
    /// low 24 bits of `custom_index` are representable.
    pub fn new(world: &Mat4, custom_index: u32, blas_address: DeviceAddress) -> Self {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw();
        Self {
            transform: to_row_major_3x4(world),
            instance_custom_index_and_mask: (custom_index & CUSTOM_INDEX_MASK) | (u32::from(MASK_ALL) << 24),
            instance_shader_binding_table_record_offset_and_flags: (flags & 0xFF) << 24,
            acceleration_structure_reference: blas_address,
        }
    }

    /// Shader-visible custom index
    pub const fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & CUSTOM_INDEX_MASK
    }

    /// Visibility mask
    pub const fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    /// Instance flags
    pub const fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }

    /// Referenced BLAS address
    pub const fn blas_address(&self) -> DeviceAddress {
        self.acceleration_structure_reference
    }
}
