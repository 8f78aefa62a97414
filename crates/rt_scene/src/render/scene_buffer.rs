//! Scene description buffer
//!
//! One storage buffer, read by shaders through its device address:
//!
//! ```text
//! SceneHeader                        32 bytes
//! MeshRecord[mesh_slots]             24 bytes each, indexed by mesh slot
//! PrimitiveRecord[primitive_count]   16 bytes each (16-byte aligned start)
//! MaterialRecord[material_slots]     64 bytes each, indexed by material slot
//! ```
//!
//! Mesh slots double as TLAS instance custom indices, so a hit shader goes
//! `instance custom index → MeshRecord → PrimitiveRecord → MaterialRecord`.
//! Empty slots are zeroed. The buffer is rewritten only when the resource
//! manager reports a change.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use crate::core::RenderContext;
use crate::error::EngineResult;
use crate::foundation::math::align_up;
use crate::render::allocator::GpuAllocator;
use crate::render::device::{DeviceAddress, GpuBuffer};
use crate::resources::{ResourceHandle, ResourceManager};

/// Buffer header with the array offsets in bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SceneHeader {
    pub mesh_count: u32,
    pub primitive_count: u32,
    pub material_count: u32,
    pub texture_count: u32,
    pub mesh_offset: u32,
    pub primitive_offset: u32,
    pub material_offset: u32,
    pub _padding: u32,
}

/// Geometry of one mesh slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshRecord {
    pub vertex_address: u64,
    pub index_address: u64,
    pub first_primitive: u32,
    pub primitive_count: u32,
}

/// One primitive; the geometry index inside the mesh BLAS selects it
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PrimitiveRecord {
    pub base_index: u32,
    pub base_vertex: u32,
    pub index_count: u32,
    pub material: u32,
}

/// Factors and texture slots of one material slot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: [f32; 4],
    pub emissive: [f32; 3],
    pub metallic: f32,
    pub roughness: f32,
    pub normal_scale: f32,
    pub occlusion_strength: f32,
    /// Texture slots in `TextureType::ALL` order
    pub textures: [u32; 5],
}

const HEADER_SIZE: u64 = std::mem::size_of::<SceneHeader>() as u64;
const MESH_RECORD_SIZE: u64 = std::mem::size_of::<MeshRecord>() as u64;
const PRIMITIVE_RECORD_SIZE: u64 = std::mem::size_of::<PrimitiveRecord>() as u64;
const ARRAY_ALIGNMENT: u64 = 16;

/// Length of an array indexed by the slots of `handles`
fn slot_count(handles: impl Iterator<Item = ResourceHandle>) -> usize {
    handles.map(|h| h.index() as usize + 1).max().unwrap_or(0)
}

/// Records gathered from the resource pools
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneRecords {
    pub meshes: Vec<MeshRecord>,
    pub primitives: Vec<PrimitiveRecord>,
    pub materials: Vec<MaterialRecord>,
    pub texture_count: u32,
}

impl SceneRecords {
    /// Collect records for every live mesh and material
    pub fn gather(resources: &ResourceManager) -> EngineResult<Self> {
        let mut meshes = vec![MeshRecord::zeroed(); slot_count(resources.meshes().iter().map(|(h, _)| h))];
        let mut primitives = Vec::new();
        for (handle, mesh) in resources.meshes().iter() {
            meshes[handle.index() as usize] = MeshRecord {
                vertex_address: mesh.vertex_buffer().require_address()?,
                index_address: mesh.index_buffer().require_address()?,
                first_primitive: primitives.len() as u32,
                primitive_count: mesh.primitives().len() as u32,
            };
            primitives.extend(mesh.primitives().iter().map(|p| PrimitiveRecord {
                base_index: p.range.base_index,
                base_vertex: p.range.base_vertex,
                index_count: p.range.index_count,
                material: p.material.index(),
            }));
        }

        let mut materials = vec![MaterialRecord::zeroed(); slot_count(resources.materials().iter().map(|(h, _)| h))];
        for (handle, material) in resources.materials().iter() {
            let factors = material.factors();
            materials[handle.index() as usize] = MaterialRecord {
                base_color: factors.base_color,
                emissive: factors.emissive,
                metallic: factors.metallic,
                roughness: factors.roughness,
                normal_scale: factors.normal_scale,
                occlusion_strength: factors.occlusion_strength,
                textures: material.textures().map(|t| t.index()),
            };
        }

        let texture_count = slot_count(resources.textures().iter().map(|(h, _)| h)) as u32;
        Ok(Self {
            meshes,
            primitives,
            materials,
            texture_count,
        })
    }

    /// Header describing where each array starts
    pub fn header(&self) -> SceneHeader {
        let mesh_offset = HEADER_SIZE;
        let primitive_offset = align_up(mesh_offset + self.meshes.len() as u64 * MESH_RECORD_SIZE, ARRAY_ALIGNMENT);
        let material_offset = align_up(
            primitive_offset + self.primitives.len() as u64 * PRIMITIVE_RECORD_SIZE,
            ARRAY_ALIGNMENT,
        );
        SceneHeader {
            mesh_count: self.meshes.len() as u32,
            primitive_count: self.primitives.len() as u32,
            material_count: self.materials.len() as u32,
            texture_count: self.texture_count,
            mesh_offset: mesh_offset as u32,
            primitive_offset: primitive_offset as u32,
            material_offset: material_offset as u32,
            _padding: 0,
        }
    }

    /// Serialize header and arrays into one byte blob
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let total = header.material_offset as usize + std::mem::size_of_val(self.materials.as_slice());
        let mut bytes = vec![0u8; total];

        let mut write = |offset: u32, data: &[u8]| {
            let offset = offset as usize;
            bytes[offset..offset + data.len()].copy_from_slice(data);
        };
        write(0, bytemuck::bytes_of(&header));
        write(header.mesh_offset, bytemuck::cast_slice(&self.meshes));
        write(header.primitive_offset, bytemuck::cast_slice(&self.primitives));
        write(header.material_offset, bytemuck::cast_slice(&self.materials));
        bytes
    }
}

/// Device copy of the scene records
pub struct SceneBuffer {
    allocator: GpuAllocator,
    buffer: Option<GpuBuffer>,
    header: SceneHeader,
}

impl SceneBuffer {
    pub fn new(context: &RenderContext) -> Self {
        Self {
            allocator: context.allocator().clone(),
            buffer: None,
            header: SceneHeader::default(),
        }
    }

    /// Address consumed by the ray-tracing shaders
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.buffer.as_ref().and_then(GpuBuffer::device_address)
    }

    /// Header of the current contents
    pub fn header(&self) -> &SceneHeader {
        &self.header
    }

    /// Current device buffer
    pub fn buffer(&self) -> Option<&GpuBuffer> {
        self.buffer.as_ref()
    }

    /// Rewrite the buffer if the resources changed, returning its address
    ///
    /// The old buffer may still be read by an in-flight frame, so the device
    /// is drained before it is released.
    pub fn update(&mut self, resources: &mut ResourceManager) -> EngineResult<DeviceAddress> {
        if let (false, Some(address)) = (resources.is_dirty(), self.device_address()) {
            return Ok(address);
        }

        let records = SceneRecords::gather(resources)?;
        let bytes = records.encode();
        let buffer = self.allocator.create_buffer_with_data(
            &bytes,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        let address = match buffer.require_address() {
            Ok(address) => address,
            Err(e) => {
                self.allocator.destroy_buffer(buffer);
                return Err(e.into());
            }
        };

        self.release()?;
        self.buffer = Some(buffer);
        self.header = records.header();
        resources.mark_clean();
        log::debug!(
            "Scene buffer rewritten: {} bytes, {} meshes, {} primitives, {} materials",
            bytes.len(),
            self.header.mesh_count,
            self.header.primitive_count,
            self.header.material_count
        );
        Ok(address)
    }

    fn release(&mut self) -> EngineResult<()> {
        if let Some(old) = self.buffer.take() {
            self.allocator.device().wait_idle()?;
            self.allocator.destroy_buffer(old);
        }
        Ok(())
    }
}

impl Drop for SceneBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::error!("Failed to release scene buffer: {e}");
        }
    }
}

impl std::fmt::Debug for SceneBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneBuffer")
            .field("address", &self.device_address())
            .field("header", &self.header)
            .finish()
    }
}
