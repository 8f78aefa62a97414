//! Core engine objects shared by every subsystem
//!
//! - [`config`]: serializable engine configuration
//! - [`context`]: the explicit render context handed to component constructors

pub mod config;
pub mod context;

pub use config::{AccelerationConfig, DeviceConfig, EngineConfig, PoolConfig, TlasBuildPolicy};
pub use context::RenderContext;
