//! Device layer and per-frame GPU state
//!
//! - [`device`]: the device trait and the values crossing it
//! - [`vulkan`] / [`recording`]: the two device implementations
//! - [`allocator`]: buffer and image allocation with staged uploads
//! - [`scene_buffer`]: mesh, primitive and material records for shaders
//! - [`pipeline`] / [`frame`]: pipeline variants and the frame driver

pub mod allocator;
pub mod device;
pub mod frame;
pub mod pipeline;
pub mod recording;
pub mod scene_buffer;
pub mod vulkan;

pub use allocator::GpuAllocator;
pub use device::{DeviceAddress, GpuBuffer, GpuImage, MemoryClass, RenderDevice};
pub use frame::{FrameDriver, FrameInputs};
pub use pipeline::{PipelineKind, RayTracePushConstants, RenderPipeline};
pub use recording::RecordingDevice;
pub use scene_buffer::SceneBuffer;
pub use vulkan::{VulkanDevice, VulkanError, VulkanResult};
