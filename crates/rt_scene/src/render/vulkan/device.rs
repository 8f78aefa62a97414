//! Vulkan implementation of [`RenderDevice`]
//!
//! Memory comes from vk-mem; every buffer that asks for
//! `SHADER_DEVICE_ADDRESS` has its address queried at creation. Allocations are
//! tracked per raw handle so destruction only needs the handle back.

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem::ManuallyDrop;
use vk_mem::Alloc as _;
use crate::core::config::DeviceConfig;
use crate::foundation::math::align_up;
use crate::render::device::{
    AccelerationBuild, AccelerationBuildDesc, AccelerationGeometry, AccelerationLevel, BufferDesc,
    BuildMode, BuildSizes, DeviceAddress, DeviceCommand, DeviceLimits, GpuBuffer, GpuImage,
    ImageDesc, MemoryClass, RenderDevice,
};
use crate::render::vulkan::commands::{CommandPool, CommandRecorder};
use crate::render::vulkan::context::VulkanContext;
use crate::render::vulkan::{VulkanError, VulkanResult};

struct BufferAllocation {
    allocation: vk_mem::Allocation,
    size: u64,
}

struct ImageAllocation {
    allocation: vk_mem::Allocation,
    view: vk::ImageView,
}

struct AllocationState {
    allocator: ManuallyDrop<vk_mem::Allocator>,
    buffers: HashMap<vk::Buffer, BufferAllocation>,
    images: HashMap<vk::Image, ImageAllocation>,
    structures: HashMap<vk::AccelerationStructureKHR, AccelerationLevel>,
}

/// GPU-backed [`RenderDevice`]
///
/// Field order matters: allocations and the command pool are released before
/// the context destroys the logical device.
pub struct VulkanDevice {
    state: Mutex<AllocationState>,
    commands: Mutex<CommandPool>,
    context: VulkanContext,
    name: String,
    limits: DeviceLimits,
}

fn allocation_info(memory: MemoryClass) -> vk_mem::AllocationCreateInfo {
    match memory {
        MemoryClass::DeviceLocal => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        },
        MemoryClass::Upload => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Auto,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        },
        MemoryClass::Readback => vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::Auto,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
            ..Default::default()
        },
    }
}

impl VulkanDevice {
    /// Create a headless device with ray-tracing support
    pub fn new(config: &DeviceConfig) -> VulkanResult<Self> {
        let context = VulkanContext::new(config)?;

        let allocator_info = vk_mem::AllocatorCreateInfo::new(
            context.instance(),
            context.raw_device(),
            context.physical_device.device,
        )
        .vulkan_api_version(vk::API_VERSION_1_2)
        .flags(vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS);
        let allocator = vk_mem::Allocator::new(allocator_info)
            .map_err(|e| VulkanError::InitializationFailed(format!("Allocator creation: {e:?}")))?;

        let commands = CommandPool::new(context.raw_device().clone(), context.device.queue_family)?;
        let limits = DeviceLimits {
            min_scratch_alignment: context.physical_device.min_scratch_alignment.max(1),
            max_instance_count: context.physical_device.max_instance_count,
        };
        let name = context.physical_device.name();

        Ok(Self {
            state: Mutex::new(AllocationState {
                allocator: ManuallyDrop::new(allocator),
                buffers: HashMap::new(),
                images: HashMap::new(),
                structures: HashMap::new(),
            }),
            commands: Mutex::new(commands),
            context,
            name,
            limits,
        })
    }

    fn raw(&self) -> &ash::Device {
        self.context.raw_device()
    }

    fn loader(&self) -> &ash::extensions::khr::AccelerationStructure {
        &self.context.device.acceleration_structure
    }

    fn buffer_address(&self, buffer: vk::Buffer) -> DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.raw().get_buffer_device_address(&info) }
    }

    fn map_host(&self, buffer: &GpuBuffer, offset: u64, len: usize) -> VulkanResult<()> {
        if !buffer.memory().is_host_visible() {
            return Err(VulkanError::InvalidMemoryAccess {
                reason: "host access to device-local buffer".to_string(),
            });
        }
        if offset + len as u64 > buffer.size() {
            return Err(VulkanError::InvalidMemoryAccess {
                reason: format!("{len} bytes at {offset} overruns buffer of {}", buffer.size()),
            });
        }
        Ok(())
    }

    fn record(&self, recorder: &mut CommandRecorder<'_>, command: &DeviceCommand<'_>) -> VulkanResult<()> {
        match command {
            DeviceCommand::CopyBuffer { src, dst, size } => {
                recorder.copy_buffer(src.handle(), dst.handle(), *size);
            }
            DeviceCommand::CopyBufferToImage { src, dst } => {
                recorder.transition_image(
                    dst.handle(),
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                )?;
                recorder.copy_buffer_to_image(src.handle(), dst.handle(), dst.extent());
                recorder.transition_image(
                    dst.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )?;
            }
            DeviceCommand::BuildAccelerationStructure(build) => {
                recorder.acceleration_structure_barrier();
                self.record_build(recorder, build);
            }
        }
        Ok(())
    }

    fn record_build(&self, recorder: &mut CommandRecorder<'_>, build: &AccelerationBuild<'_>) {
        let geometries = vk_geometries(&build.desc);
        let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> =
            build.desc.geometries.iter().map(build_range).collect();

        let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(build.desc.level.vk_type())
            .flags(build.desc.flags)
            .dst_acceleration_structure(build.dst)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch_address,
            });
        info = match build.mode {
            BuildMode::Build => info.mode(vk::BuildAccelerationStructureModeKHR::BUILD),
            BuildMode::Update { src } => info
                .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                .src_acceleration_structure(src),
        };

        recorder.build_acceleration_structure(self.loader(), info.build(), &ranges);
    }
}

fn vk_geometries(desc: &AccelerationBuildDesc<'_>) -> Vec<vk::AccelerationStructureGeometryKHR> {
    desc.geometries
        .iter()
        .map(|geometry| match geometry {
            AccelerationGeometry::Triangles(triangles) => vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                        .vertex_format(triangles.vertex_format)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.vertex_address,
                        })
                        .vertex_stride(triangles.vertex_stride)
                        .max_vertex(triangles.max_vertex)
                        .index_type(triangles.index_type)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: triangles.index_address,
                        })
                        .build(),
                })
                .build(),
            AccelerationGeometry::Instances(instances) => vk::AccelerationStructureGeometryKHR::builder()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .flags(vk::GeometryFlagsKHR::OPAQUE)
                .geometry(vk::AccelerationStructureGeometryDataKHR {
                    instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                        .array_of_pointers(false)
                        .data(vk::DeviceOrHostAddressConstKHR {
                            device_address: instances.instance_address,
                        })
                        .build(),
                })
                .build(),
        })
        .collect()
}

fn build_range(geometry: &AccelerationGeometry) -> vk::AccelerationStructureBuildRangeInfoKHR {
    let first_vertex = match geometry {
        AccelerationGeometry::Triangles(triangles) => triangles.first_vertex,
        AccelerationGeometry::Instances(_) => 0,
    };
    vk::AccelerationStructureBuildRangeInfoKHR::builder()
        .primitive_count(geometry.primitive_count())
        .primitive_offset(0)
        .first_vertex(first_vertex)
        .transform_offset(0)
        .build()
}

impl RenderDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VulkanResult<GpuBuffer> {
        // Over-allocate so the reported address can be rounded up to the
        // requested alignment.
        let padding = desc.alignment.unwrap_or(0);
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size + padding)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let mut state = self.state.lock();
        let (buffer, allocation) = unsafe {
            state
                .allocator
                .create_buffer(&buffer_info, &allocation_info(desc.memory))
                .map_err(|e| VulkanError::from_allocation(e, desc.size))?
        };

        let address = desc.needs_device_address().then(|| {
            let base = self.buffer_address(buffer);
            desc.alignment.map_or(base, |alignment| align_up(base, alignment))
        });

        state.buffers.insert(buffer, BufferAllocation {
            allocation,
            size: desc.size + padding,
        });
        log::trace!("Created buffer {:#x} ({} bytes, {:?})", buffer.as_raw(), desc.size, desc.memory);

        Ok(GpuBuffer::from_raw_parts(buffer, desc.size, desc.usage, desc.memory, address))
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut state = self.state.lock();
        if let Some(mut entry) = state.buffers.remove(&buffer.handle()) {
            unsafe { state.allocator.destroy_buffer(buffer.handle(), &mut entry.allocation) };
        } else {
            log::error!("destroy_buffer: unknown buffer {:#x}", buffer.handle().as_raw());
        }
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> VulkanResult<()> {
        self.map_host(buffer, offset, data.len())?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .buffers
            .get_mut(&buffer.handle())
            .ok_or(VulkanError::ResourceNotFound { handle: buffer.handle().as_raw() })?;
        unsafe {
            let mapped = state
                .allocator
                .map_memory(&mut entry.allocation)
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapped.add(offset as usize), data.len());
            state
                .allocator
                .flush_allocation(&entry.allocation, offset as usize, data.len())
                .map_err(VulkanError::Api)?;
            state.allocator.unmap_memory(&mut entry.allocation);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: &GpuBuffer, offset: u64, out: &mut [u8]) -> VulkanResult<()> {
        self.map_host(buffer, offset, out.len())?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .buffers
            .get_mut(&buffer.handle())
            .ok_or(VulkanError::ResourceNotFound { handle: buffer.handle().as_raw() })?;
        debug_assert!(offset + out.len() as u64 <= entry.size);
        unsafe {
            state
                .allocator
                .invalidate_allocation(&entry.allocation, offset as usize, out.len())
                .map_err(VulkanError::Api)?;
            let mapped = state
                .allocator
                .map_memory(&mut entry.allocation)
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(mapped.add(offset as usize), out.as_mut_ptr(), out.len());
            state.allocator.unmap_memory(&mut entry.allocation);
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> VulkanResult<GpuImage> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut state = self.state.lock();
        let (image, mut allocation) = unsafe {
            state
                .allocator
                .create_image(&image_info, &allocation_info(MemoryClass::DeviceLocal))
                .map_err(|e| VulkanError::from_allocation(e, desc.byte_size()))?
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = match unsafe { self.raw().create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe { state.allocator.destroy_image(image, &mut allocation) };
                return Err(VulkanError::Api(e));
            }
        };

        state.images.insert(image, ImageAllocation { allocation, view });
        Ok(GpuImage::from_raw_parts(image, view, desc))
    }

    fn destroy_image(&self, image: GpuImage) {
        let mut state = self.state.lock();
        if let Some(mut entry) = state.images.remove(&image.handle()) {
            unsafe {
                self.raw().destroy_image_view(entry.view, None);
                state.allocator.destroy_image(image.handle(), &mut entry.allocation);
            }
        }
    }

    fn submit_and_wait(&self, commands: &[DeviceCommand<'_>]) -> VulkanResult<()> {
        let pool = self.commands.lock();
        let mut recorder = pool.begin_single_time()?;
        for command in commands {
            self.record(&mut recorder, command)?;
        }
        recorder.submit_and_wait(self.context.device.queue)
    }

    fn acceleration_structure_build_sizes(
        &self,
        desc: &AccelerationBuildDesc<'_>,
    ) -> VulkanResult<BuildSizes> {
        let geometries = vk_geometries(desc);
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(desc.level.vk_type())
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let sizes = unsafe {
            self.loader().get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &desc.primitive_counts(),
            )
        };
        Ok(BuildSizes {
            acceleration_structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        level: AccelerationLevel,
        buffer: &GpuBuffer,
        size: u64,
    ) -> VulkanResult<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.handle())
            .offset(0)
            .size(size)
            .ty(level.vk_type());

        let handle = unsafe {
            self.loader()
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| VulkanError::from_allocation(e, size))?
        };
        self.state.lock().structures.insert(handle, level);
        Ok(handle)
    }

    fn acceleration_structure_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> VulkanResult<DeviceAddress> {
        if !self.state.lock().structures.contains_key(&handle) {
            return Err(VulkanError::ResourceNotFound { handle: handle.as_raw() });
        }
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
        Ok(unsafe { self.loader().get_acceleration_structure_device_address(&info) })
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        if self.state.lock().structures.remove(&handle).is_some() {
            unsafe { self.loader().destroy_acceleration_structure(handle, None) };
        }
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.raw().device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let _ = self.wait_idle();
        let Self { state, context, .. } = self;
        let state = state.get_mut();

        if !state.structures.is_empty() || !state.buffers.is_empty() || !state.images.is_empty() {
            log::warn!(
                "VulkanDevice dropped with {} structures, {} buffers, {} images still alive",
                state.structures.len(),
                state.buffers.len(),
                state.images.len()
            );
        }

        unsafe {
            for (handle, _) in state.structures.drain() {
                context
                    .device
                    .acceleration_structure
                    .destroy_acceleration_structure(handle, None);
            }
            for (image, mut entry) in state.images.drain() {
                context.device.device.destroy_image_view(entry.view, None);
                state.allocator.destroy_image(image, &mut entry.allocation);
            }
            for (buffer, mut entry) in state.buffers.drain() {
                state.allocator.destroy_buffer(buffer, &mut entry.allocation);
            }
            ManuallyDrop::drop(&mut state.allocator);
        }
    }
}
