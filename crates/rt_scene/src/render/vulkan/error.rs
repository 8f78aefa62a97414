//! Vulkan error types

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device memory allocation failed
    #[error("Out of device memory: {requested} bytes requested")]
    OutOfDeviceMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// Resource with specified handle is unknown to the device
    #[error("Resource not found: {handle:#x}")]
    ResourceNotFound {
        /// Raw handle of the resource
        handle: u64,
    },

    /// A buffer was used where a device address is required but it was
    /// created without `SHADER_DEVICE_ADDRESS`
    #[error("Buffer {handle:#x} has no device address")]
    MissingDeviceAddress {
        /// Raw handle of the buffer
        handle: u64,
    },

    /// Host access to memory that is not host visible, or out of range
    #[error("Invalid memory access: {reason}")]
    InvalidMemoryAccess {
        /// Description of the failed access
        reason: String,
    },

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl VulkanError {
    /// Map an allocation result, promoting memory exhaustion to
    /// [`VulkanError::OutOfDeviceMemory`]
    pub fn from_allocation(result: vk::Result, requested: u64) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory { requested }
            }
            other => Self::Api(other),
        }
    }

    /// Whether this error reports exhausted memory
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory { .. })
    }
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;
