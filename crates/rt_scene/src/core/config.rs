//! # Engine Configuration
//!
//! All tunables of the scene core in one serializable structure. Pools are
//! fixed-capacity, so their sizes are decided here once at startup.
//!
//! ## Configuration Categories
//!
//! - **Device Config**: application metadata, validation, frames in flight
//! - **Pool Config**: slot counts for meshes, materials and textures
//! - **Acceleration Config**: TLAS rebuild policy and BLAS build preference

use serde::{Serialize, Deserialize};

pub use crate::config::{Config, ConfigError};

/// Largest value representable by the 24-bit instance custom index
pub const MAX_INSTANCE_CUSTOM_INDEX: usize = (1 << 24) - 1;

/// Device creation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Whether to enable Vulkan validation layers (`None` = debug builds only)
    pub enable_validation: Option<bool>,
    /// Frames recorded concurrently by the frame driver
    pub frames_in_flight: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            application_name: "rt_scene".to_string(),
            enable_validation: None,
            frames_in_flight: 2,
        }
    }
}

impl DeviceConfig {
    /// Resolve the validation toggle against the build type
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }
}

/// Fixed pool capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live meshes
    pub mesh_capacity: usize,
    /// Maximum number of live materials
    pub material_capacity: usize,
    /// Maximum number of live textures
    pub texture_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            mesh_capacity: 256,
            material_capacity: 256,
            texture_capacity: 512,
        }
    }
}

/// How a dirty TLAS is brought up to date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlasBuildPolicy {
    /// Destroy and rebuild from scratch on every dirty frame
    #[default]
    FullRebuild,
    /// Update the existing TLAS in place when only transforms changed
    ///
    /// Falls back to a full rebuild whenever the instance count differs from
    /// the previous build or no TLAS exists yet.
    Refit,
}

/// Acceleration-structure build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerationConfig {
    /// TLAS update strategy
    pub tlas_policy: TlasBuildPolicy,
    /// Build BLASes with `PREFER_FAST_TRACE` (otherwise `PREFER_FAST_BUILD`)
    pub prefer_fast_trace: bool,
}

impl Default for AccelerationConfig {
    fn default() -> Self {
        Self {
            tlas_policy: TlasBuildPolicy::FullRebuild,
            prefer_fast_trace: true,
        }
    }
}

/// # Engine Configuration
///
/// Root configuration loaded from `.toml` or `.ron`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Device settings
    pub device: DeviceConfig,
    /// Pool capacities
    pub pools: PoolConfig,
    /// Acceleration-structure settings
    pub acceleration: AccelerationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            device: DeviceConfig::default(),
            pools: PoolConfig::default(),
            acceleration: AccelerationConfig::default(),
        }
    }
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pools = [
            ("mesh_capacity", self.pools.mesh_capacity),
            ("material_capacity", self.pools.material_capacity),
            ("texture_capacity", self.pools.texture_capacity),
        ];
        for (name, capacity) in pools {
            if capacity == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
            if capacity > MAX_INSTANCE_CUSTOM_INDEX {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({capacity}) exceeds the 24-bit instance index range"
                )));
            }
        }

        if !(1..=8).contains(&self.device.frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "frames_in_flight must be within 1..=8, got {}",
                self.device.frames_in_flight
            )));
        }

        if self.device.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Builder pattern: Set pool capacities
    #[must_use]
    pub fn with_pools(mut self, pools: PoolConfig) -> Self {
        self.pools = pools;
        self
    }

    /// Builder pattern: Set TLAS build policy
    #[must_use]
    pub fn with_tlas_policy(mut self, policy: TlasBuildPolicy) -> Self {
        self.acceleration.tlas_policy = policy;
        self
    }
}
