//! Crate-level error type
//!
//! Every module keeps its own `thiserror` enum; `EngineError` gathers them at
//! the operations that span modules. [`EngineError::category`] maps each
//! failure onto the four failure classes callers act on.

use thiserror::Error;
use crate::assets::AssetError;
use crate::config::ConfigError;
use crate::render::pipeline::PipelineError;
use crate::render::vulkan::VulkanError;
use crate::resources::pool::PoolError;
use crate::scene::SceneError;

/// Broad failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A pool or device memory is full
    ResourceExhaustion,
    /// A handle or entity does not refer to a live object, or an operation
    /// would break a structural rule
    InvalidHandle,
    /// The device rejected a command, an allocation or a build
    DeviceOperationFailure,
    /// A TLAS build was requested against world transforms that were not
    /// propagated
    StaleAcceleration,
    /// Configuration or asset input is unusable
    InvalidInput,
}

/// Errors surfaced by cross-module operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Device error
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// Pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Asset import error
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Scene graph error
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// Pipeline error
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The resource is still referenced and cannot be evicted
    #[error("{resource} is still in use: {reason}")]
    ResourceInUse {
        /// Resource description
        resource: String,
        /// What still refers to it
        reason: String,
    },
}

impl EngineError {
    /// Failure class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Vulkan(e) if e.is_out_of_memory() => ErrorCategory::ResourceExhaustion,
            Self::Vulkan(VulkanError::ResourceNotFound { .. } | VulkanError::MissingDeviceAddress { .. }) => {
                ErrorCategory::InvalidHandle
            }
            Self::Vulkan(_) => ErrorCategory::DeviceOperationFailure,
            Self::Pool(PoolError::Exhausted { .. }) => ErrorCategory::ResourceExhaustion,
            Self::Pool(PoolError::InvalidHandle { .. }) | Self::ResourceInUse { .. } => ErrorCategory::InvalidHandle,
            Self::Scene(e) if e.is_stale_acceleration() => ErrorCategory::StaleAcceleration,
            Self::Scene(_) => ErrorCategory::InvalidHandle,
            Self::Asset(_) | Self::Config(_) | Self::Pipeline(_) => ErrorCategory::InvalidInput,
        }
    }
}

/// Result alias for cross-module operations
pub type EngineResult<T> = Result<T, EngineError>;
