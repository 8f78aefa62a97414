//! # rt_scene
//!
//! GPU-resident scene synchronization for a Vulkan ray tracer.
//!
//! A CPU-side scene graph of transform-bearing nodes is mirrored into the
//! device structures a ray-tracing dispatch needs:
//!
//! - one BLAS per mesh, built at load time ([`accel::blas`])
//! - one scene TLAS, rebuilt only when instances changed ([`accel::tlas`])
//! - a scene buffer of mesh, primitive and material records
//!   ([`render::scene_buffer`])
//!
//! Meshes, materials and textures live in fixed-capacity pools with
//! content-keyed deduplication ([`resources`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rt_scene::prelude::*;
//!
//! fn main() -> Result<(), EngineError> {
//!     let device = Arc::new(RecordingDevice::new());
//!     let context = RenderContext::new(device, EngineConfig::default())?;
//!     let mut resources = ResourceManager::new(&context)?;
//!     let mut scene = Scene::new(&context);
//!     let mut frames = FrameDriver::new(&context);
//!
//!     let cube = resources.load_mesh("cube", &MeshData::cube())?;
//!     let node = scene.create_node(scene.root(), LocalTransform::identity())?;
//!     scene.attach_mesh(node, cube, &resources)?;
//!
//!     let inputs = frames.prepare_frame(&mut scene, &mut resources, 1.0 / 60.0)?;
//!     println!("TLAS at {:#x}", inputs.tlas_address);
//!     Ok(())
//! }
//! ```

pub mod accel;
pub mod assets;
pub mod config;
pub mod core;
pub mod ecs;
pub mod error;
pub mod foundation;
pub mod render;
pub mod resources;
pub mod scene;

pub use error::{EngineError, EngineResult, ErrorCategory};

/// Common imports
pub mod prelude {
    pub use crate::{
        accel::{BlasSource, TlasInstance, TlasSynchronizer},
        assets::{ImageData, MeshData, ObjLoader, Vertex},
        core::{EngineConfig, RenderContext, TlasBuildPolicy},
        ecs::{components::LocalTransform, Entity},
        error::{EngineError, EngineResult, ErrorCategory},
        foundation::math::{Mat4, Quat, Vec3},
        render::{FrameDriver, FrameInputs, RecordingDevice, RenderDevice, VulkanDevice},
        resources::{MaterialDesc, ResourceHandle, ResourceManager, TextureType},
        scene::{Scene, SceneError},
    };
}
