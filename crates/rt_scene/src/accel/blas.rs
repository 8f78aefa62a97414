//! Bottom-level acceleration structure builder
//!
//! Every primitive of a mesh becomes one triangle geometry of a single BLAS,
//! so the TLAS carries one instance per mesh instance rather than one per
//! primitive. A BLAS is never updated in place; a changed mesh is destroyed
//! and rebuilt.

use ash::vk;
use crate::accel::{build_new, AccelerationStructure};
use crate::assets::mesh_data::PrimitiveRange;
use crate::core::RenderContext;
use crate::render::allocator::GpuAllocator;
use crate::render::device::{
    AccelerationBuildDesc, AccelerationGeometry, AccelerationLevel, GpuBuffer, TriangleGeometry,
};
use crate::render::vulkan::{VulkanError, VulkanResult};

const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

/// Device-resident geometry of one mesh
#[derive(Debug, Clone, Copy)]
pub struct BlasGeometry<'a> {
    /// Vertex buffer with a device address; positions are the first 12 bytes
    /// of every vertex
    pub vertex_buffer: &'a GpuBuffer,
    /// 32-bit index buffer with a device address
    pub index_buffer: &'a GpuBuffer,
    /// Size of one vertex in bytes
    pub vertex_stride: u64,
    /// Primitive ranges; indices are relative to each range's base vertex
    pub primitives: &'a [PrimitiveRange],
}

/// Builds one BLAS per mesh
pub struct BlasBuilder {
    allocator: GpuAllocator,
    flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl BlasBuilder {
    /// Create a builder using the context's allocator and build preference
    pub fn new(context: &RenderContext) -> Self {
        let flags = if context.config().acceleration.prefer_fast_trace {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
        } else {
            vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD
        };
        Self {
            allocator: context.allocator().clone(),
            flags,
        }
    }

    /// Translate primitive ranges into triangle geometries
    pub fn geometries(geometry: &BlasGeometry<'_>) -> VulkanResult<Vec<AccelerationGeometry>> {
        let vertex_address = geometry.vertex_buffer.require_address()?;
        let index_address = geometry.index_buffer.require_address()?;

        geometry
            .primitives
            .iter()
            .map(|range| {
                if range.vertex_count == 0 || range.index_count == 0 || range.index_count % 3 != 0 {
                    return Err(VulkanError::InvalidOperation {
                        reason: format!("degenerate primitive range {range:?}"),
                    });
                }
                Ok(AccelerationGeometry::Triangles(TriangleGeometry {
                    vertex_address,
                    vertex_stride: geometry.vertex_stride,
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    max_vertex: range.base_vertex + range.vertex_count - 1,
                    first_vertex: range.base_vertex,
                    index_address: index_address + u64::from(range.base_index) * INDEX_SIZE,
                    index_type: vk::IndexType::UINT32,
                    triangle_count: range.index_count / 3,
                }))
            })
            .collect()
    }

    /// Build a BLAS covering every primitive of a mesh
    ///
    /// Blocks until the device has finished the build.
    pub fn build(&self, geometry: &BlasGeometry<'_>) -> VulkanResult<AccelerationStructure> {
        let geometries = Self::geometries(geometry)?;
        if geometries.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "mesh has no primitives".to_string(),
            });
        }

        let desc = AccelerationBuildDesc {
            level: AccelerationLevel::Bottom,
            geometries: &geometries,
            flags: self.flags,
        };
        let structure = build_new(&self.allocator, &desc)?;

        log::debug!(
            "Built BLAS with {} geometries, {} triangles at {:#x}",
            geometries.len(),
            desc.primitive_counts().iter().sum::<u32>(),
            structure.device_address()
        );
        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::render::device::MemoryClass;
    use crate::render::recording::RecordingDevice;
    use std::sync::Arc;

    fn geometry_buffers(context: &RenderContext) -> (GpuBuffer, GpuBuffer) {
        let usage = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        let vertices = context
            .allocator()
            .create_buffer(6 * 48, usage, MemoryClass::DeviceLocal, None)
            .unwrap();
        let indices = context
            .allocator()
            .create_buffer(9 * 4, usage, MemoryClass::DeviceLocal, None)
            .unwrap();
        (vertices, indices)
    }

    #[test]
    fn test_one_geometry_per_primitive() {
        let device = Arc::new(RecordingDevice::new());
        let context = RenderContext::new(device.clone(), EngineConfig::default()).unwrap();
        let (vertices, indices) = geometry_buffers(&context);
        let primitives = [
            PrimitiveRange { base_vertex: 0, vertex_count: 3, base_index: 0, index_count: 3 },
            PrimitiveRange { base_vertex: 3, vertex_count: 3, base_index: 3, index_count: 6 },
        ];
        let geometry = BlasGeometry {
            vertex_buffer: &vertices,
            index_buffer: &indices,
            vertex_stride: 48,
            primitives: &primitives,
        };

        let geometries = BlasBuilder::geometries(&geometry).unwrap();
        assert_eq!(geometries.len(), 2);
        let AccelerationGeometry::Triangles(second) = geometries[1] else {
            panic!("expected triangles");
        };
        assert_eq!(second.first_vertex, 3);
        assert_eq!(second.max_vertex, 5);
        assert_eq!(second.triangle_count, 2);
        assert_eq!(second.index_address, indices.device_address().unwrap() + 12);

        let blas = BlasBuilder::new(&context).build(&geometry).unwrap();
        assert_eq!(device.stats().blas_builds, 1);
        assert!(device.is_built(blas.handle()));
        assert_eq!(blas.device_address(), blas.buffer().device_address().unwrap());
        // Backing buffer, vertices and indices; scratch released.
        assert_eq!(device.stats().live_buffers(), 3);
        blas.destroy(&*device);
        assert_eq!(device.stats().live_acceleration_structures(), 0);
    }

    #[test]
    fn test_degenerate_primitive_rejected() {
        let device = Arc::new(RecordingDevice::new());
        let context = RenderContext::new(device, EngineConfig::default()).unwrap();
        let (vertices, indices) = geometry_buffers(&context);
        let primitives = [PrimitiveRange { base_vertex: 0, vertex_count: 3, base_index: 0, index_count: 4 }];
        let geometry = BlasGeometry {
            vertex_buffer: &vertices,
            index_buffer: &indices,
            vertex_stride: 48,
            primitives: &primitives,
        };
        assert!(BlasBuilder::new(&context).build(&geometry).is_err());
    }

    #[test]
    fn test_build_failure_releases_resources() {
        let device = Arc::new(RecordingDevice::new());
        let context = RenderContext::new(device.clone(), EngineConfig::default()).unwrap();
        let (vertices, indices) = geometry_buffers(&context);
        // Index range runs past the end of the index buffer.
        let primitives = [PrimitiveRange { base_vertex: 0, vertex_count: 3, base_index: 9, index_count: 3 }];
        let geometry = BlasGeometry {
            vertex_buffer: &vertices,
            index_buffer: &indices,
            vertex_stride: 48,
            primitives: &primitives,
        };
        assert!(BlasBuilder::new(&context).build(&geometry).is_err());
        let stats = device.stats();
        assert_eq!(stats.live_buffers(), 2);
        assert_eq!(stats.live_acceleration_structures(), 0);
    }
}
