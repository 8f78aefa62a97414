//! In-memory device
//!
//! `RecordingDevice` implements [`RenderDevice`] without a GPU. Buffers are byte
//! vectors, device addresses come from a monotonic counter and every command is
//! executed synchronously on submission. Acceleration-structure builds are
//! validated the way a driver would reject them (unknown addresses, misaligned
//! scratch, refitting a structure built without `ALLOW_UPDATE`) and TLAS builds
//! decode their instance array so callers can inspect the result.
//!
//! Used by unit tests and by the headless binary's `--software` mode.

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use slotmap::{DefaultKey, Key, KeyData, SlotMap};
use crate::accel::instance::TlasInstance;
use crate::foundation::math::align_up;
use crate::render::device::{
    AccelerationBuild, AccelerationBuildDesc, AccelerationGeometry, AccelerationLevel, BufferDesc,
    BuildMode, BuildSizes, DeviceAddress, DeviceCommand, DeviceLimits, GpuBuffer, GpuImage,
    ImageDesc, RenderDevice,
};
use crate::render::vulkan::{VulkanError, VulkanResult};

const ADDRESS_BASE: DeviceAddress = 0x1000_0000;
const ADDRESS_ALIGNMENT: u64 = 256;
const INSTANCE_SIZE: usize = std::mem::size_of::<TlasInstance>();

/// Counters describing everything the device has done
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Buffers allocated
    pub buffers_created: usize,
    /// Buffers released
    pub buffers_destroyed: usize,
    /// Images allocated
    pub images_created: usize,
    /// Images released
    pub images_destroyed: usize,
    /// One-time submissions
    pub submissions: usize,
    /// Buffer copies executed
    pub buffer_copies: usize,
    /// Image uploads executed
    pub image_copies: usize,
    /// Bottom-level builds
    pub blas_builds: usize,
    /// Top-level full builds
    pub tlas_builds: usize,
    /// Top-level in-place updates
    pub tlas_updates: usize,
    /// Acceleration structures created
    pub acceleration_structures_created: usize,
    /// Acceleration structures destroyed
    pub acceleration_structures_destroyed: usize,
    /// `wait_idle` calls
    pub wait_idle_calls: usize,
}

impl RecordingStats {
    /// Buffers currently alive
    pub const fn live_buffers(&self) -> usize {
        self.buffers_created - self.buffers_destroyed
    }

    /// Acceleration structures currently alive
    pub const fn live_acceleration_structures(&self) -> usize {
        self.acceleration_structures_created - self.acceleration_structures_destroyed
    }
}

struct RecordedBuffer {
    data: Vec<u8>,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    address: Option<DeviceAddress>,
}

struct RecordedImage {
    data: Vec<u8>,
    byte_size: u64,
}

struct RecordedAccelerationStructure {
    level: AccelerationLevel,
    size: u64,
    address: DeviceAddress,
    built: bool,
    allow_update: bool,
    primitive_counts: Vec<u32>,
    instances: Vec<TlasInstance>,
}

#[derive(Default)]
struct RecordingState {
    buffers: SlotMap<DefaultKey, RecordedBuffer>,
    images: SlotMap<DefaultKey, RecordedImage>,
    structures: SlotMap<DefaultKey, RecordedAccelerationStructure>,
    next_address: DeviceAddress,
    allocated_bytes: u64,
    memory_budget: Option<u64>,
    last_tlas: Option<vk::AccelerationStructureKHR>,
    stats: RecordingStats,
}

fn key_of(raw: u64) -> DefaultKey {
    KeyData::from_ffi(raw).into()
}

fn raw_of(key: DefaultKey) -> u64 {
    key.data().as_ffi()
}

impl RecordingState {
    fn allocate_address(&mut self, size: u64) -> DeviceAddress {
        let address = self.next_address;
        self.next_address += align_up(size.max(1), ADDRESS_ALIGNMENT) + ADDRESS_ALIGNMENT;
        address
    }

    /// Resolve `[address, address + len)` to a buffer key and byte offset
    fn resolve(&self, address: DeviceAddress, len: u64) -> VulkanResult<(DefaultKey, usize)> {
        self.buffers
            .iter()
            .find_map(|(key, buffer)| {
                let base = buffer.address?;
                let end = base + buffer.data.len() as u64;
                (address >= base && address + len <= end).then(|| (key, (address - base) as usize))
            })
            .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                reason: format!("address {address:#x} (+{len}) is not inside any live buffer"),
            })
    }

    fn buffer(&self, handle: vk::Buffer) -> VulkanResult<&RecordedBuffer> {
        self.buffers
            .get(key_of(handle.as_raw()))
            .ok_or(VulkanError::ResourceNotFound { handle: handle.as_raw() })
    }

    fn copy_buffer(&mut self, src: &GpuBuffer, dst: &GpuBuffer, size: u64) -> VulkanResult<()> {
        let bytes = {
            let source = self.buffer(src.handle())?;
            source
                .data
                .get(..size as usize)
                .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                    reason: format!("copy of {size} bytes overruns source of {}", source.data.len()),
                })?
                .to_vec()
        };
        let target = self
            .buffers
            .get_mut(key_of(dst.handle().as_raw()))
            .ok_or(VulkanError::ResourceNotFound { handle: dst.handle().as_raw() })?;
        if !target.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(VulkanError::InvalidOperation {
                reason: "copy destination lacks TRANSFER_DST usage".to_string(),
            });
        }
        let slot = target
            .data
            .get_mut(..bytes.len())
            .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                reason: format!("copy of {size} bytes overruns destination"),
            })?;
        slot.copy_from_slice(&bytes);
        self.stats.buffer_copies += 1;
        Ok(())
    }

    fn copy_buffer_to_image(&mut self, src: &GpuBuffer, dst: &GpuImage) -> VulkanResult<()> {
        let image_key = key_of(dst.handle().as_raw());
        let byte_size = self
            .images
            .get(image_key)
            .ok_or(VulkanError::ResourceNotFound { handle: dst.handle().as_raw() })?
            .byte_size;
        let bytes = self
            .buffer(src.handle())?
            .data
            .get(..byte_size as usize)
            .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                reason: "staging buffer smaller than image".to_string(),
            })?
            .to_vec();
        if let Some(image) = self.images.get_mut(image_key) {
            image.data = bytes;
        }
        self.stats.image_copies += 1;
        Ok(())
    }

    fn build(&mut self, build: &AccelerationBuild<'_>, min_scratch_alignment: u64) -> VulkanResult<()> {
        if build.scratch_address == 0 || build.scratch_address % min_scratch_alignment != 0 {
            return Err(VulkanError::InvalidOperation {
                reason: format!(
                    "scratch address {:#x} not aligned to {min_scratch_alignment}",
                    build.scratch_address
                ),
            });
        }
        self.resolve(build.scratch_address, 1)?;

        let mut instances = Vec::new();
        for geometry in build.desc.geometries {
            match geometry {
                AccelerationGeometry::Triangles(triangles) => {
                    if triangles.index_type != vk::IndexType::UINT32 {
                        return Err(VulkanError::InvalidOperation {
                            reason: "only 32-bit indices are supported".to_string(),
                        });
                    }
                    let vertex_bytes = (u64::from(triangles.max_vertex) + 1) * triangles.vertex_stride;
                    self.resolve(triangles.vertex_address, vertex_bytes)?;
                    self.resolve(triangles.index_address, u64::from(triangles.triangle_count) * 12)?;
                }
                AccelerationGeometry::Instances(list) => {
                    let len = list.instance_count as usize * INSTANCE_SIZE;
                    if len == 0 {
                        continue;
                    }
                    let (key, offset) = self.resolve(list.instance_address, len as u64)?;
                    let bytes = &self.buffers[key].data[offset..offset + len];
                    instances.extend(
                        bytes
                            .chunks_exact(INSTANCE_SIZE)
                            .map(bytemuck::pod_read_unaligned::<TlasInstance>),
                    );
                }
            }
        }

        let primitive_counts = build.desc.primitive_counts();
        let allow_update = build
            .desc
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE);
        let level = build.desc.level;

        if let BuildMode::Update { src } = build.mode {
            let source = self
                .structures
                .get(key_of(src.as_raw()))
                .ok_or(VulkanError::ResourceNotFound { handle: src.as_raw() })?;
            if !source.built || !source.allow_update {
                return Err(VulkanError::InvalidOperation {
                    reason: "update source was not built with ALLOW_UPDATE".to_string(),
                });
            }
            if source.primitive_counts != primitive_counts {
                return Err(VulkanError::InvalidOperation {
                    reason: "update changes primitive counts".to_string(),
                });
            }
        }

        let target = self
            .structures
            .get_mut(key_of(build.dst.as_raw()))
            .ok_or(VulkanError::ResourceNotFound { handle: build.dst.as_raw() })?;
        if target.level != level {
            return Err(VulkanError::InvalidOperation {
                reason: format!("{level:?} build into a {:?} structure", target.level),
            });
        }
        target.built = true;
        target.allow_update = allow_update;
        target.primitive_counts = primitive_counts;
        target.instances = instances;

        match (level, build.mode) {
            (AccelerationLevel::Bottom, _) => self.stats.blas_builds += 1,
            (AccelerationLevel::Top, BuildMode::Build) => self.stats.tlas_builds += 1,
            (AccelerationLevel::Top, BuildMode::Update { .. }) => self.stats.tlas_updates += 1,
        }
        if level == AccelerationLevel::Top {
            self.last_tlas = Some(build.dst);
        }
        Ok(())
    }
}

/// Deterministic in-memory [`RenderDevice`]
pub struct RecordingDevice {
    name: String,
    limits: DeviceLimits,
    state: Mutex<RecordingState>,
}

impl RecordingDevice {
    /// Create a device with typical desktop limits
    pub fn new() -> Self {
        Self::with_limits(DeviceLimits {
            min_scratch_alignment: 128,
            max_instance_count: (1 << 24) - 1,
        })
    }

    /// Create a device with explicit limits
    pub fn with_limits(limits: DeviceLimits) -> Self {
        let state = RecordingState {
            next_address: ADDRESS_BASE,
            ..RecordingState::default()
        };
        Self {
            name: "Recording device".to_string(),
            limits,
            state: Mutex::new(state),
        }
    }

    /// Fail allocations once `bytes` of buffer and image memory are live
    #[must_use]
    pub fn with_memory_budget(self, bytes: u64) -> Self {
        self.state.lock().memory_budget = Some(bytes);
        self
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> RecordingStats {
        self.state.lock().stats.clone()
    }

    /// Instances consumed by the most recent TLAS build or update
    pub fn last_tlas_instances(&self) -> Option<Vec<TlasInstance>> {
        let state = self.state.lock();
        let handle = state.last_tlas?;
        state
            .structures
            .get(key_of(handle.as_raw()))
            .map(|structure| structure.instances.clone())
    }

    /// Instances of a specific TLAS
    pub fn tlas_instances(&self, handle: vk::AccelerationStructureKHR) -> Option<Vec<TlasInstance>> {
        self.state
            .lock()
            .structures
            .get(key_of(handle.as_raw()))
            .map(|structure| structure.instances.clone())
    }

    /// Whether an acceleration structure is alive and built
    pub fn is_built(&self, handle: vk::AccelerationStructureKHR) -> bool {
        self.state
            .lock()
            .structures
            .get(key_of(handle.as_raw()))
            .is_some_and(|structure| structure.built)
    }

    /// Copy of a buffer's contents, host visible or not
    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Option<Vec<u8>> {
        self.state
            .lock()
            .buffers
            .get(key_of(buffer.handle().as_raw()))
            .map(|recorded| recorded.data.clone())
    }

    /// Copy of an image's texels
    pub fn image_contents(&self, image: &GpuImage) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(key_of(image.handle().as_raw()))
            .map(|recorded| recorded.data.clone())
    }

    fn reserve(state: &mut RecordingState, bytes: u64) -> VulkanResult<()> {
        if let Some(budget) = state.memory_budget {
            if state.allocated_bytes + bytes > budget {
                log::warn!(
                    "Recording device budget exceeded: {} + {bytes} > {budget}",
                    state.allocated_bytes
                );
                return Err(VulkanError::from_allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, bytes));
            }
        }
        state.allocated_bytes += bytes;
        Ok(())
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderDevice for RecordingDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<GpuBuffer> {
        if desc.size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "zero-sized buffer".to_string(),
            });
        }
        let mut state = self.state.lock();
        Self::reserve(&mut state, desc.size)?;

        let address = if desc.needs_device_address() {
            let alignment = desc.alignment.unwrap_or(ADDRESS_ALIGNMENT).max(ADDRESS_ALIGNMENT);
            let address = align_up(state.allocate_address(desc.size + alignment), alignment);
            Some(address)
        } else {
            None
        };

        let key = state.buffers.insert(RecordedBuffer {
            data: vec![0; desc.size as usize],
            usage: desc.usage,
            host_visible: desc.memory.is_host_visible(),
            address,
        });
        state.stats.buffers_created += 1;

        Ok(GpuBuffer::from_raw_parts(
            vk::Buffer::from_raw(raw_of(key)),
            desc.size,
            desc.usage,
            desc.memory,
            address,
        ))
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(key_of(buffer.handle().as_raw())).is_some() {
            state.allocated_bytes = state.allocated_bytes.saturating_sub(buffer.size());
            state.stats.buffers_destroyed += 1;
        } else {
            log::error!("destroy_buffer: unknown buffer {:#x}", buffer.handle().as_raw());
        }
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> VulkanResult<()> {
        let mut state = self.state.lock();
        let recorded = state
            .buffers
            .get_mut(key_of(buffer.handle().as_raw()))
            .ok_or(VulkanError::ResourceNotFound { handle: buffer.handle().as_raw() })?;
        if !recorded.host_visible {
            return Err(VulkanError::InvalidMemoryAccess {
                reason: "host write to device-local buffer".to_string(),
            });
        }
        let start = offset as usize;
        let slot = recorded
            .data
            .get_mut(start..start + data.len())
            .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                reason: format!("write of {} bytes at {offset} overruns buffer", data.len()),
            })?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, out: &mut [u8]) -> VulkanResult<()> {
        let state = self.state.lock();
        let recorded = state.buffer(buffer.handle())?;
        if !recorded.host_visible {
            return Err(VulkanError::InvalidMemoryAccess {
                reason: "host read of device-local buffer".to_string(),
            });
        }
        let start = offset as usize;
        let slot = recorded
            .data
            .get(start..start + out.len())
            .ok_or_else(|| VulkanError::InvalidMemoryAccess {
                reason: format!("read of {} bytes at {offset} overruns buffer", out.len()),
            })?;
        out.copy_from_slice(slot);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<GpuImage> {
        let byte_size = desc.byte_size();
        if byte_size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "zero-sized image".to_string(),
            });
        }
        let mut state = self.state.lock();
        Self::reserve(&mut state, byte_size)?;
        let key = state.images.insert(RecordedImage {
            data: Vec::new(),
            byte_size,
        });
        state.stats.images_created += 1;
        let raw = raw_of(key);
        Ok(GpuImage::from_raw_parts(vk::Image::from_raw(raw), vk::ImageView::from_raw(raw), desc))
    }

    fn destroy_image(&self, image: GpuImage) {
        let mut state = self.state.lock();
        if let Some(recorded) = state.images.remove(key_of(image.handle().as_raw())) {
            state.allocated_bytes = state.allocated_bytes.saturating_sub(recorded.byte_size);
            state.stats.images_destroyed += 1;
        }
    }

    fn submit_and_wait(&self, commands: &[DeviceCommand<'_>]) -> VulkanResult<()> {
        let mut state = self.state.lock();
        for command in commands {
            match command {
                DeviceCommand::CopyBuffer { src, dst, size } => state.copy_buffer(src, dst, *size)?,
                DeviceCommand::CopyBufferToImage { src, dst } => state.copy_buffer_to_image(src, dst)?,
                DeviceCommand::BuildAccelerationStructure(build) => {
                    state.build(build, self.limits.min_scratch_alignment)?;
                }
            }
        }
        state.stats.submissions += 1;
        Ok(())
    }

    fn acceleration_structure_build_sizes(
        &self,
        desc: &AccelerationBuildDesc<'_>,
    ) -> VulkanResult<BuildSizes> {
        let (per_primitive, per_scratch) = match desc.level {
            AccelerationLevel::Bottom => (64, 32),
            AccelerationLevel::Top => (128, 64),
        };
        let primitives: u64 = desc.primitive_counts().iter().map(|&count| u64::from(count)).sum();
        let build_scratch_size = 128 + primitives * per_scratch;
        Ok(BuildSizes {
            acceleration_structure_size: 256 + primitives * per_primitive,
            build_scratch_size,
            update_scratch_size: build_scratch_size / 2,
        })
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        buffer: &GpuBuffer,
        size: u64,
    ) -> VulkanResult<vk::AccelerationStructureKHR> {
        if !buffer.usage().contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR) {
            return Err(VulkanError::InvalidOperation {
                reason: "backing buffer lacks ACCELERATION_STRUCTURE_STORAGE_KHR".to_string(),
            });
        }
        if size > buffer.size() {
            return Err(VulkanError::InvalidOperation {
                reason: format!("structure of {size} bytes does not fit buffer of {}", buffer.size()),
            });
        }
        let address = buffer.require_address()?;
        let mut state = self.state.lock();
        state.buffer(buffer.handle())?;
        let key = state.structures.insert(RecordedAccelerationStructure {
            level,
            size,
            address,
            built: false,
            allow_update: false,
            primitive_counts: Vec::new(),
            instances: Vec::new(),
        });
        state.stats.acceleration_structures_created += 1;
        log::trace!("Recording device created {level:?} structure of {size} bytes");
        Ok(vk::AccelerationStructureKHR::from_raw(raw_of(key)))
    }

    fn acceleration_structure_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> VulkanResult<DeviceAddress> {
        self.state
            .lock()
            .structures
            .get(key_of(handle.as_raw()))
            .map(|structure| structure.address)
            .ok_or(VulkanError::ResourceNotFound { handle: handle.as_raw() })
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        let mut state = self.state.lock();
        if let Some(structure) = state.structures.remove(key_of(handle.as_raw())) {
            log::trace!("Recording device destroyed {:?} structure ({} bytes)", structure.level, structure.size);
            state.stats.acceleration_structures_destroyed += 1;
            if state.last_tlas == Some(handle) {
                state.last_tlas = None;
            }
        }
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        self.state.lock().stats.wait_idle_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::device::{MemoryClass, InstanceGeometry};

    fn address_buffer(device: &RecordingDevice, size: u64) -> GpuBuffer {
        device
            .create_buffer(&BufferDesc::new(
                size,
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryClass::DeviceLocal,
            ))
            .expect("buffer")
    }

    #[test]
    fn test_addresses_are_distinct_and_aligned() {
        let device = RecordingDevice::new();
        let a = address_buffer(&device, 100);
        let b = address_buffer(&device, 100);
        let (a_addr, b_addr) = (a.require_address().unwrap(), b.require_address().unwrap());
        assert_ne!(a_addr, b_addr);
        assert!(b_addr >= a_addr + 100);
        assert_eq!(a_addr % ADDRESS_ALIGNMENT, 0);
    }

    #[test]
    fn test_buffer_without_address_usage_has_none() {
        let device = RecordingDevice::new();
        let buffer = device
            .create_buffer(&BufferDesc::new(64, vk::BufferUsageFlags::TRANSFER_SRC, MemoryClass::Upload))
            .unwrap();
        assert!(buffer.device_address().is_none());
        assert!(matches!(buffer.require_address(), Err(VulkanError::MissingDeviceAddress { .. })));
    }

    #[test]
    fn test_host_write_to_device_local_rejected() {
        let device = RecordingDevice::new();
        let buffer = address_buffer(&device, 16);
        assert!(device.write_buffer(&buffer, 0, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_budget_exhaustion_reports_out_of_memory() {
        let device = RecordingDevice::new().with_memory_budget(128);
        let _first = address_buffer(&device, 100);
        let second = device.create_buffer(&BufferDesc::new(
            100,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryClass::DeviceLocal,
        ));
        assert!(matches!(second, Err(VulkanError::OutOfDeviceMemory { requested: 100 })));
    }

    #[test]
    fn test_misaligned_scratch_rejected() {
        let device = RecordingDevice::new();
        let backing = address_buffer(&device, 1024);
        let scratch = address_buffer(&device, 1024);
        let handle = device
            .create_acceleration_structure(AccelerationLevel::Top, &backing, 512)
            .unwrap();
        let geometries = [AccelerationGeometry::Instances(InstanceGeometry {
            instance_address: 0,
            instance_count: 0,
        })];
        let build = AccelerationBuild {
            desc: AccelerationBuildDesc {
                level: AccelerationLevel::Top,
                geometries: &geometries,
                flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            },
            mode: BuildMode::Build,
            dst: handle,
            scratch_address: scratch.require_address().unwrap() + 4,
        };
        let result = device.submit_and_wait(&[DeviceCommand::BuildAccelerationStructure(build)]);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert!(!device.is_built(handle));
    }
}
