//! Per-frame orchestration
//!
//! ```text
//! prepare_frame(scene, resources, dt)
//!     ├── scene.update(dt)              world transforms
//!     ├── scene.rebuild_tlas(token)     only if instances changed
//!     ├── scene_buffer.update()         only if resources changed
//!     ├── pipeline.update(inputs)       every compiled pipeline
//!     └── advance frame index           wraps at frames in flight
//! ```
//!
//! All of this runs before command recording for the frame starts.

use crate::core::RenderContext;
use crate::error::EngineResult;
use crate::render::device::DeviceAddress;
use crate::render::pipeline::{PipelineError, PipelineKind, PipelineState, RayTracePushConstants, RenderPipeline};
use crate::render::scene_buffer::SceneBuffer;
use crate::resources::ResourceManager;
use crate::scene::Scene;

/// Everything the dispatch of one frame needs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInputs {
    /// Slot among the frames in flight
    pub frame_index: usize,
    /// Frames prepared before this one
    pub frame_number: u64,
    /// Seconds since the previous frame
    pub dt: f32,
    /// Scene TLAS
    pub tlas_address: DeviceAddress,
    /// Scene buffer
    pub scene_buffer_address: DeviceAddress,
    /// Instances in the TLAS
    pub instance_count: u32,
    /// Whether the TLAS was rebuilt for this frame
    pub tlas_rebuilt: bool,
}

impl FrameInputs {
    /// Ray-tracing push-constant payload
    pub fn push_constants(&self) -> RayTracePushConstants {
        RayTracePushConstants {
            tlas_address: self.tlas_address,
            scene_buffer_address: self.scene_buffer_address,
        }
    }
}

/// Drives the per-frame update sequence
pub struct FrameDriver {
    frames_in_flight: usize,
    frame_index: usize,
    frame_number: u64,
    scene_buffer: SceneBuffer,
    pipelines: Vec<RenderPipeline>,
}

impl FrameDriver {
    /// Driver with the standard pipeline set
    pub fn new(context: &RenderContext) -> Self {
        Self::with_pipelines(context, RenderPipeline::standard_set())
    }

    /// Driver with a custom pipeline set, in submission order
    pub fn with_pipelines(context: &RenderContext, pipelines: Vec<RenderPipeline>) -> Self {
        Self {
            frames_in_flight: context.config().device.frames_in_flight.max(1),
            frame_index: 0,
            frame_number: 0,
            scene_buffer: SceneBuffer::new(context),
            pipelines,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Slot the next prepared frame will use
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Frames prepared so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn scene_buffer(&self) -> &SceneBuffer {
        &self.scene_buffer
    }

    pub fn pipelines(&self) -> &[RenderPipeline] {
        &self.pipelines
    }

    /// First pipeline of a kind
    pub fn pipeline(&self, kind: PipelineKind) -> Option<&RenderPipeline> {
        self.pipelines.iter().find(|p| p.kind() == kind)
    }

    /// Load and compile every pipeline that is not compiled yet
    pub fn compile_pipelines(&mut self) -> Result<(), PipelineError> {
        for pipeline in &mut self.pipelines {
            if pipeline.state() != PipelineState::Compiled {
                pipeline.load()?;
                pipeline.compile()?;
            }
        }
        Ok(())
    }

    /// Bring the scene's device state up to date and produce the dispatch
    /// inputs of the next frame
    pub fn prepare_frame(
        &mut self,
        scene: &mut Scene,
        resources: &mut ResourceManager,
        dt: f32,
    ) -> EngineResult<FrameInputs> {
        self.compile_pipelines()?;

        let token = scene.update(dt);
        let tlas_rebuilt = scene.rebuild_tlas(token, &*resources)?;
        let scene_buffer_address = self.scene_buffer.update(resources)?;
        let tlas_address = scene.tlas_address().ok_or(PipelineError::MissingInput {
            kind: PipelineKind::RayTraced,
            what: "TLAS address",
        })?;

        let inputs = FrameInputs {
            frame_index: self.frame_index,
            frame_number: self.frame_number,
            dt,
            tlas_address,
            scene_buffer_address,
            instance_count: scene.tlas().instance_count(),
            tlas_rebuilt,
        };
        for pipeline in &mut self.pipelines {
            pipeline.update(&inputs)?;
        }

        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.frame_number += 1;
        log::trace!(
            "Frame {} prepared (slot {}): {} instances, TLAS {:#x}{}",
            inputs.frame_number,
            inputs.frame_index,
            inputs.instance_count,
            inputs.tlas_address,
            if tlas_rebuilt { " rebuilt" } else { "" }
        );
        Ok(inputs)
    }
}

impl std::fmt::Debug for FrameDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDriver")
            .field("frames_in_flight", &self.frames_in_flight)
            .field("frame_index", &self.frame_index)
            .field("frame_number", &self.frame_number)
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}
