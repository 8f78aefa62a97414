//! Vulkan backend
//!
//! Headless context creation, one-time command submission and the
//! [`VulkanDevice`] implementation of the device trait.

pub mod commands;
pub mod context;
pub mod device;
pub mod error;

pub use device::VulkanDevice;
pub use error::{VulkanError, VulkanResult};
