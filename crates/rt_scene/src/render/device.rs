//! Device abstraction consumed by the scene core
//!
//! The scene core never talks to Vulkan directly. Everything it needs from the
//! GPU goes through [`RenderDevice`]:
//!
//! ```text
//! GpuAllocator / BlasBuilder / TlasSynchronizer
//!         ↓
//!   dyn RenderDevice
//!     ├── VulkanDevice     (ash + vk-mem, real GPU)
//!     └── RecordingDevice  (in-memory, deterministic, used by tests)
//! ```
//!
//! Resources are plain values ([`GpuBuffer`], [`GpuImage`], raw acceleration
//! structure handles) and are released explicitly through the device that
//! created them. Every submission blocks until the device has finished.

use ash::vk;
use ash::vk::Handle;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// GPU virtual address of a buffer or acceleration structure
pub type DeviceAddress = vk::DeviceAddress;

/// Where an allocation lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Device-local memory, not host visible
    DeviceLocal,
    /// Host-visible memory written sequentially by the CPU (staging, uniforms)
    Upload,
    /// Host-visible memory read back by the CPU
    Readback,
}

impl MemoryClass {
    /// Whether the CPU can map memory of this class
    pub const fn is_host_visible(self) -> bool {
        matches!(self, Self::Upload | Self::Readback)
    }
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Vulkan usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub memory: MemoryClass,
    /// Minimum alignment of the allocation, if stricter than the default
    pub alignment: Option<u64>,
}

impl BufferDesc {
    /// Create a buffer description with default alignment
    pub const fn new(size: u64, usage: vk::BufferUsageFlags, memory: MemoryClass) -> Self {
        Self { size, usage, memory, alignment: None }
    }

    /// Builder pattern: Set minimum alignment
    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    /// Whether the buffer needs a device address resolved at creation
    pub fn needs_device_address(&self) -> bool {
        self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }
}

/// A device buffer
///
/// Not `Clone`: a buffer is released exactly once through
/// [`RenderDevice::destroy_buffer`].
#[derive(Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    handle: vk::Buffer,
    size: u64,
    usage: vk::BufferUsageFlags,
    memory: MemoryClass,
    device_address: Option<DeviceAddress>,
}

impl GpuBuffer {
    /// Assemble a buffer value; used by [`RenderDevice`] implementations
    pub const fn from_raw_parts(
        handle: vk::Buffer,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryClass,
        device_address: Option<DeviceAddress>,
    ) -> Self {
        Self { handle, size, usage, memory, device_address }
    }

    /// Raw Vulkan handle
    pub const fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Size in bytes
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags the buffer was created with
    pub const fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory placement
    pub const fn memory(&self) -> MemoryClass {
        self.memory
    }

    /// Device address, present when created with `SHADER_DEVICE_ADDRESS`
    pub const fn device_address(&self) -> Option<DeviceAddress> {
        self.device_address
    }

    /// Device address, or an error for buffers created without one
    pub fn require_address(&self) -> VulkanResult<DeviceAddress> {
        self.device_address.ok_or(VulkanError::MissingDeviceAddress {
            handle: self.handle.as_raw(),
        })
    }
}

/// Image creation parameters (2D, single mip, single layer)
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Vulkan usage flags
    pub usage: vk::ImageUsageFlags,
}

impl ImageDesc {
    /// Sampled 2D texture with the given format
    pub fn texture(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    /// Bytes per texel for the formats the core uploads
    pub const fn texel_size(&self) -> u64 {
        match self.format {
            vk::Format::R8_UNORM => 1,
            vk::Format::R32G32B32A32_SFLOAT => 16,
            _ => 4,
        }
    }

    /// Size in bytes of tightly packed texel data
    pub const fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.texel_size()
    }
}

/// A device image with its default view
#[derive(Debug, PartialEq, Eq)]
pub struct GpuImage {
    handle: vk::Image,
    view: vk::ImageView,
    desc_width: u32,
    desc_height: u32,
    format: vk::Format,
}

impl GpuImage {
    /// Assemble an image value; used by [`RenderDevice`] implementations
    pub const fn from_raw_parts(handle: vk::Image, view: vk::ImageView, desc: &ImageDesc) -> Self {
        Self {
            handle,
            view,
            desc_width: desc.width,
            desc_height: desc.height,
            format: desc.format,
        }
    }

    /// Raw Vulkan image handle
    pub const fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Shader-readable view
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Extent in texels
    pub const fn extent(&self) -> (u32, u32) {
        (self.desc_width, self.desc_height)
    }

    /// Texel format
    pub const fn format(&self) -> vk::Format {
        self.format
    }
}

/// Acceleration-structure level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationLevel {
    /// Per-mesh triangle geometry
    Bottom,
    /// Per-scene instance list
    Top,
}

impl AccelerationLevel {
    /// Vulkan structure type
    pub const fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// Triangle-list geometry read from device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// Address of the first vertex of the vertex buffer
    pub vertex_address: DeviceAddress,
    /// Distance between consecutive vertices in bytes
    pub vertex_stride: u64,
    /// Position format (`R32G32B32_SFLOAT`)
    pub vertex_format: vk::Format,
    /// Highest vertex index addressed by this geometry
    pub max_vertex: u32,
    /// Offset added to every index
    pub first_vertex: u32,
    /// Address of this geometry's first index
    pub index_address: DeviceAddress,
    /// Index width; fixed to 32 bit by the core
    pub index_type: vk::IndexType,
    /// Number of triangles
    pub triangle_count: u32,
}

/// Instance-list geometry for a TLAS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGeometry {
    /// Address of a tightly packed array of instance records
    pub instance_address: DeviceAddress,
    /// Number of records
    pub instance_count: u32,
}

/// One geometry of an acceleration-structure build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationGeometry {
    /// Bottom-level triangles
    Triangles(TriangleGeometry),
    /// Top-level instances
    Instances(InstanceGeometry),
}

impl AccelerationGeometry {
    /// Primitive count used for size queries and build ranges
    pub const fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(triangles) => triangles.triangle_count,
            Self::Instances(instances) => instances.instance_count,
        }
    }
}

/// Geometry and flags of an acceleration-structure build, without targets
#[derive(Debug, Clone, Copy)]
pub struct AccelerationBuildDesc<'a> {
    /// Structure level
    pub level: AccelerationLevel,
    /// Geometries, one build range each
    pub geometries: &'a [AccelerationGeometry],
    /// Build flags
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl AccelerationBuildDesc<'_> {
    /// Primitive count of every geometry, in order
    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries.iter().map(AccelerationGeometry::primitive_count).collect()
    }
}

/// Sizes reported by the device for a build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    /// Size of the backing buffer
    pub acceleration_structure_size: u64,
    /// Scratch size for a full build
    pub build_scratch_size: u64,
    /// Scratch size for an in-place update
    pub update_scratch_size: u64,
}

/// Whether a build starts from scratch or refits an existing structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build into `dst`
    Build,
    /// Refit `src` into `dst` (the same structure for in-place updates)
    Update {
        /// Structure being refitted
        src: vk::AccelerationStructureKHR,
    },
}

/// A fully specified build, recorded into a one-time command buffer
#[derive(Debug, Clone, Copy)]
pub struct AccelerationBuild<'a> {
    /// Geometry and flags
    pub desc: AccelerationBuildDesc<'a>,
    /// Full build or update
    pub mode: BuildMode,
    /// Target structure
    pub dst: vk::AccelerationStructureKHR,
    /// Scratch memory address, aligned to the device minimum
    pub scratch_address: DeviceAddress,
}

/// Commands accepted by [`RenderDevice::submit_and_wait`]
#[derive(Debug, Clone, Copy)]
pub enum DeviceCommand<'a> {
    /// Buffer to buffer copy
    CopyBuffer {
        /// Source buffer
        src: &'a GpuBuffer,
        /// Destination buffer
        dst: &'a GpuBuffer,
        /// Byte count
        size: u64,
    },
    /// Copy tightly packed texels into a whole image; the image ends in
    /// `SHADER_READ_ONLY_OPTIMAL`
    CopyBufferToImage {
        /// Source buffer
        src: &'a GpuBuffer,
        /// Destination image
        dst: &'a GpuImage,
    },
    /// Acceleration-structure build; later commands observe its result
    BuildAccelerationStructure(AccelerationBuild<'a>),
}

/// Device limits the core depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// `minAccelerationStructureScratchOffsetAlignment`
    pub min_scratch_alignment: u64,
    /// Largest TLAS instance count
    pub max_instance_count: u64,
}

/// GPU operations required by the scene core
///
/// Implementations use interior mutability; the core drives a device from a
/// single thread.
pub trait RenderDevice: Send + Sync {
    /// Human-readable device name
    fn name(&self) -> &str;

    /// Limits used for scratch alignment and TLAS sizing
    fn limits(&self) -> DeviceLimits;

    /// Allocate a buffer, resolving its device address immediately when the
    /// usage includes `SHADER_DEVICE_ADDRESS`
    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<GpuBuffer>;

    /// Release a buffer and its memory
    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Write host-visible buffer memory
    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> VulkanResult<()>;

    /// Read host-visible buffer memory
    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, out: &mut [u8]) -> VulkanResult<()>;

    /// Allocate a 2D image with a default view
    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<GpuImage>;

    /// Release an image, its view and its memory
    fn destroy_image(&self, image: GpuImage);

    /// Record `commands` into a one-time command buffer, submit it and block
    /// until the device signals completion
    fn submit_and_wait(&self, commands: &[DeviceCommand<'_>]) -> VulkanResult<()>;

    /// Query structure and scratch sizes for a build
    fn acceleration_structure_build_sizes(
        &self,
        desc: &AccelerationBuildDesc<'_>,
    ) -> VulkanResult<BuildSizes>;

    /// Create an acceleration structure bound to the start of `buffer`
    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        buffer: &GpuBuffer,
        size: u64,
    ) -> VulkanResult<vk::AccelerationStructureKHR>;

    /// Device address of a built acceleration structure
    fn acceleration_structure_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> VulkanResult<DeviceAddress>;

    /// Destroy an acceleration structure (not its backing buffer)
    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    /// Block until the device is idle
    fn wait_idle(&self) -> VulkanResult<()>;
}
