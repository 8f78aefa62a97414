//! Top-level acceleration structure synchronizer
//!
//! Keeps the single scene TLAS in step with the instances gathered from the
//! scene graph.
//!
//! ```text
//! FullRebuild:  wait_idle → destroy old TLAS + instance buffer
//!               → upload instances → size query → allocate → build → address
//! Refit:        wait_idle → overwrite instance buffer → UPDATE build in place
//!               (only when a TLAS built with ALLOW_UPDATE exists and the
//!                instance count is unchanged; otherwise FullRebuild)
//! ```

use ash::vk;
use crate::accel::{build_new, create_scratch, AccelerationStructure, TlasInstance};
use crate::core::config::TlasBuildPolicy;
use crate::core::RenderContext;
use crate::render::allocator::GpuAllocator;
use crate::render::device::{
    AccelerationBuild, AccelerationBuildDesc, AccelerationGeometry, AccelerationLevel, BuildMode,
    DeviceAddress, DeviceCommand, GpuBuffer, InstanceGeometry,
};
use crate::render::vulkan::{VulkanError, VulkanResult};
use crate::resources::{PoolError, ResourceHandle};

/// Resolves a mesh handle to the address of its BLAS
pub trait BlasSource {
    /// BLAS address of a live mesh
    fn blas_address(&self, mesh: ResourceHandle) -> Result<DeviceAddress, PoolError>;

    /// Number of meshes destroyed so far
    ///
    /// A TLAS built before this value changed may reference a freed BLAS.
    fn eviction_epoch(&self) -> u64 {
        0
    }
}

/// How the last synchronization reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasBuildKind {
    /// New structure built from scratch
    Full,
    /// Existing structure refitted in place
    Refit,
}

/// Build counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlasStats {
    /// Full builds
    pub full_builds: u64,
    /// In-place updates
    pub refits: u64,
    /// Rebuild requests answered without device work because nothing changed
    pub skipped: u64,
}

/// Owner of the scene TLAS and its instance buffer
pub struct TlasSynchronizer {
    allocator: GpuAllocator,
    policy: TlasBuildPolicy,
    tlas: Option<AccelerationStructure>,
    instance_buffer: Option<GpuBuffer>,
    instance_count: u32,
    stats: TlasStats,
}

impl TlasSynchronizer {
    /// Create an empty synchronizer; no TLAS exists until the first build
    pub fn new(context: &RenderContext) -> Self {
        Self {
            allocator: context.allocator().clone(),
            policy: context.config().acceleration.tlas_policy,
            tlas: None,
            instance_buffer: None,
            instance_count: 0,
            stats: TlasStats::default(),
        }
    }

    pub fn policy(&self) -> TlasBuildPolicy {
        self.policy
    }

    /// Whether a TLAS has been built
    pub fn is_initialized(&self) -> bool {
        self.tlas.is_some()
    }

    /// Address of the current TLAS
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.tlas.as_ref().map(AccelerationStructure::device_address)
    }

    /// Current TLAS
    pub fn structure(&self) -> Option<&AccelerationStructure> {
        self.tlas.as_ref()
    }

    /// Instance count of the current TLAS
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn stats(&self) -> TlasStats {
        self.stats
    }

    pub(crate) fn record_skip(&mut self) {
        self.stats.skipped += 1;
    }

    fn build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        match self.policy {
            TlasBuildPolicy::FullRebuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            TlasBuildPolicy::Refit => {
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
            }
        }
    }

    /// Bring the TLAS up to date with `instances`
    ///
    /// Blocks until the device has finished. Always waits for the device to
    /// go idle first, since the previous TLAS may still be in use by an
    /// in-flight frame.
    pub fn synchronize(&mut self, instances: &[TlasInstance]) -> VulkanResult<TlasBuildKind> {
        let device = self.allocator.device().clone();
        let max = device.limits().max_instance_count;
        if instances.len() as u64 > max {
            return Err(VulkanError::InvalidOperation {
                reason: format!("{} instances exceed the device limit of {max}", instances.len()),
            });
        }
        let count = instances.len() as u32;

        device.wait_idle()?;

        let refit = self.policy == TlasBuildPolicy::Refit
            && self.tlas.is_some()
            && count > 0
            && count == self.instance_count;
        if refit {
            self.refit(instances)?;
            self.stats.refits += 1;
            log::trace!("Refitted TLAS with {count} instances");
            return Ok(TlasBuildKind::Refit);
        }

        self.rebuild(instances)?;
        self.stats.full_builds += 1;
        log::debug!(
            "Rebuilt TLAS with {count} instances at {:#x}",
            self.device_address().unwrap_or_default()
        );
        Ok(TlasBuildKind::Full)
    }

    fn rebuild(&mut self, instances: &[TlasInstance]) -> VulkanResult<()> {
        self.release();

        let instance_buffer = self.allocator.create_buffer_with_data(
            bytemuck::cast_slice(instances),
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        )?;

        let built = instance_buffer.require_address().and_then(|instance_address| {
            let geometries = [AccelerationGeometry::Instances(InstanceGeometry {
                instance_address,
                instance_count: instances.len() as u32,
            })];
            build_new(
                &self.allocator,
                &AccelerationBuildDesc {
                    level: AccelerationLevel::Top,
                    geometries: &geometries,
                    flags: self.build_flags(),
                },
            )
        });

        match built {
            Ok(tlas) => {
                self.tlas = Some(tlas);
                self.instance_buffer = Some(instance_buffer);
                self.instance_count = instances.len() as u32;
                Ok(())
            }
            Err(e) => {
                self.allocator.destroy_buffer(instance_buffer);
                Err(e)
            }
        }
    }

    fn refit(&mut self, instances: &[TlasInstance]) -> VulkanResult<()> {
        let (Some(tlas), Some(instance_buffer)) = (&self.tlas, &self.instance_buffer) else {
            return Err(VulkanError::InvalidOperation {
                reason: "refit without an existing TLAS".to_string(),
            });
        };
        self.allocator
            .stage_and_upload(instance_buffer, bytemuck::cast_slice(instances))?;

        let geometries = [AccelerationGeometry::Instances(InstanceGeometry {
            instance_address: instance_buffer.require_address()?,
            instance_count: instances.len() as u32,
        })];
        let desc = AccelerationBuildDesc {
            level: AccelerationLevel::Top,
            geometries: &geometries,
            flags: self.build_flags(),
        };
        let device = self.allocator.device();
        let sizes = device.acceleration_structure_build_sizes(&desc)?;
        let scratch = create_scratch(&self.allocator, sizes.update_scratch_size)?;
        let result = scratch.require_address().and_then(|scratch_address| {
            device.submit_and_wait(&[DeviceCommand::BuildAccelerationStructure(AccelerationBuild {
                desc,
                mode: BuildMode::Update { src: tlas.handle() },
                dst: tlas.handle(),
                scratch_address,
            })])
        });
        self.allocator.destroy_buffer(scratch);
        result
    }

    /// Wait for the device, then destroy the TLAS and its instance buffer
    pub fn invalidate(&mut self) -> VulkanResult<()> {
        if self.tlas.is_none() && self.instance_buffer.is_none() {
            return Ok(());
        }
        self.allocator.device().wait_idle()?;
        self.release();
        log::debug!("TLAS invalidated");
        Ok(())
    }

    /// Destroy the TLAS and its instance buffer; the caller has waited for
    /// the device
    fn release(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(&**self.allocator.device());
        }
        if let Some(buffer) = self.instance_buffer.take() {
            self.allocator.destroy_buffer(buffer);
        }
        self.instance_count = 0;
    }
}

impl Drop for TlasSynchronizer {
    fn drop(&mut self) {
        if self.tlas.is_none() && self.instance_buffer.is_none() {
            return;
        }
        if let Err(e) = self.allocator.device().wait_idle() {
            log::error!("wait_idle before TLAS release failed: {e}");
        }
        self.release();
    }
}

impl std::fmt::Debug for TlasSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlasSynchronizer")
            .field("policy", &self.policy)
            .field("address", &self.device_address())
            .field("instance_count", &self.instance_count)
            .field("stats", &self.stats)
            .finish()
    }
}
