//! Device meshes
//!
//! A mesh owns one interleaved vertex buffer, one 32-bit index buffer, its
//! primitive table and the BLAS built over them. All four are released
//! together.

use ash::vk;
use crate::accel::{AccelerationStructure, BlasBuilder, BlasGeometry};
use crate::assets::{MeshData, PrimitiveRange, Vertex};
use crate::render::allocator::GpuAllocator;
use crate::render::device::{DeviceAddress, GpuBuffer};
use crate::render::vulkan::VulkanResult;
use crate::resources::handle::ResourceHandle;

/// Usage shared by vertex and index buffers: shader access through device
/// addresses and acceleration-structure build input
fn geometry_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
}

/// A draw range with its resolved material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    /// Range inside the mesh buffers
    pub range: PrimitiveRange,
    /// Material pool handle
    pub material: ResourceHandle,
}

/// A mesh resident on the device
#[derive(Debug)]
pub struct Mesh {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    primitives: Vec<Primitive>,
    blas: AccelerationStructure,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    /// Upload vertex and index data, then build the BLAS
    ///
    /// `materials` holds one material handle per primitive of `data`.
    pub fn upload(
        allocator: &GpuAllocator,
        builder: &BlasBuilder,
        data: &MeshData,
        materials: &[ResourceHandle],
    ) -> VulkanResult<Self> {
        let vertex_buffer = allocator.create_buffer_with_data(
            bytemuck::cast_slice(&data.vertices),
            geometry_usage() | vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = match allocator.create_buffer_with_data(
            bytemuck::cast_slice(&data.indices),
            geometry_usage() | vk::BufferUsageFlags::INDEX_BUFFER,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                allocator.destroy_buffer(vertex_buffer);
                return Err(e);
            }
        };

        let ranges = data.ranges();
        let blas = builder.build(&BlasGeometry {
            vertex_buffer: &vertex_buffer,
            index_buffer: &index_buffer,
            vertex_stride: Vertex::STRIDE,
            primitives: &ranges,
        });
        let blas = match blas {
            Ok(blas) => blas,
            Err(e) => {
                allocator.destroy_buffer(vertex_buffer);
                allocator.destroy_buffer(index_buffer);
                return Err(e);
            }
        };

        let primitives = ranges
            .iter()
            .zip(materials.iter().copied().chain(std::iter::repeat(ResourceHandle::INVALID)))
            .map(|(range, material)| Primitive { range: *range, material })
            .collect();

        Ok(Self {
            vertex_buffer,
            index_buffer,
            primitives,
            blas,
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
        })
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.index_buffer
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    /// The mesh BLAS
    pub fn blas(&self) -> &AccelerationStructure {
        &self.blas
    }

    /// Address written into TLAS instances referencing this mesh
    pub fn blas_address(&self) -> DeviceAddress {
        self.blas.device_address()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Whether any primitive uses `material`
    pub fn uses_material(&self, material: ResourceHandle) -> bool {
        self.primitives.iter().any(|p| p.material == material)
    }

    /// Release the BLAS, then the geometry buffers
    ///
    /// The caller guarantees the device no longer reads them.
    pub fn destroy(self, allocator: &GpuAllocator) {
        self.blas.destroy(&**allocator.device());
        allocator.destroy_buffer(self.vertex_buffer);
        allocator.destroy_buffer(self.index_buffer);
    }
}
