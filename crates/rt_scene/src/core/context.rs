//! Explicit render context
//!
//! Constructed once at startup and passed by reference to every component
//! constructor. Tests build one around a [`RecordingDevice`](crate::render::recording::RecordingDevice).

use std::sync::Arc;
use crate::core::config::{ConfigError, EngineConfig};
use crate::render::allocator::GpuAllocator;
use crate::render::device::RenderDevice;

/// Device, allocator and validated configuration
#[derive(Clone)]
pub struct RenderContext {
    device: Arc<dyn RenderDevice>,
    allocator: GpuAllocator,
    config: EngineConfig,
}

impl RenderContext {
    /// Validate `config` and wrap `device`
    pub fn new(device: Arc<dyn RenderDevice>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!("Render context on '{}'", device.name());
        let allocator = GpuAllocator::new(device.clone());
        Ok(Self {
            device,
            allocator,
            config,
        })
    }

    /// The device every subsystem submits to
    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    /// Buffer and image allocator
    pub const fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    /// Validated configuration
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("device", &self.device.name())
            .field("config", &self.config)
            .finish()
    }
}
