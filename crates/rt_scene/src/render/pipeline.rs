//! Pipeline variants
//!
//! The set of pipelines is closed, so they are one enum sharing a
//! `load → compile → update` contract:
//!
//! ```text
//! Unloaded ──load──▶ Loaded ──compile──▶ Compiled ──update(frame)──▶ Compiled
//! ```
//!
//! Only the ray-traced variant consumes scene data; it turns each frame's
//! TLAS and scene-buffer addresses into [`RayTracePushConstants`].

use ash::vk;
use bytemuck::{Pod, Zeroable};
use thiserror::Error;
use crate::render::device::DeviceAddress;
use crate::render::frame::FrameInputs;

/// Pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// `compile` before `load`
    #[error("{0:?} pipeline is not loaded")]
    NotLoaded(PipelineKind),

    /// `update` before `compile`
    #[error("{0:?} pipeline is not compiled")]
    NotCompiled(PipelineKind),

    /// A frame input the pipeline needs is missing
    #[error("{kind:?} pipeline is missing {what}")]
    MissingInput {
        /// Pipeline kind
        kind: PipelineKind,
        /// Missing input
        what: &'static str,
    },
}

/// Pipeline variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Background,
    Rasterized,
    RayTraced,
    Tonemap,
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Unloaded,
    Loaded,
    Compiled,
}

/// Push-constant payload of the ray-tracing dispatch
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RayTracePushConstants {
    /// Device address of the scene TLAS
    pub tlas_address: u64,
    /// Device address of the scene buffer
    pub scene_buffer_address: u64,
}

impl RayTracePushConstants {
    /// Size in bytes
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    /// Bytes as pushed with `vkCmdPushConstants`
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Push-constant range covering the payload in every ray-tracing stage
    pub fn range() -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::RAYGEN_KHR
                | vk::ShaderStageFlags::CLOSEST_HIT_KHR
                | vk::ShaderStageFlags::MISS_KHR,
            offset: 0,
            size: Self::SIZE,
        }
    }
}

/// Clears the target to a fixed color
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundPipeline {
    state: PipelineState,
    /// Linear RGBA clear color
    pub clear_color: [f32; 4],
}

/// Rasterized preview of every instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterPipeline {
    state: PipelineState,
    draw_count: u32,
}

impl RasterPipeline {
    /// Instances drawn in the last updated frame
    pub fn draw_count(&self) -> u32 {
        self.draw_count
    }
}

/// Ray-traced shading of the scene TLAS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RayTracePipeline {
    state: PipelineState,
    push_constants: Option<RayTracePushConstants>,
}

impl RayTracePipeline {
    /// Payload for the next dispatch
    pub fn push_constants(&self) -> Option<&RayTracePushConstants> {
        self.push_constants.as_ref()
    }
}

/// Maps HDR radiance to display range
#[derive(Debug, Clone, PartialEq)]
pub struct TonemapPipeline {
    state: PipelineState,
    /// Exposure multiplier applied before tonemapping
    pub exposure: f32,
}

/// A render pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum RenderPipeline {
    Background(BackgroundPipeline),
    Rasterized(RasterPipeline),
    RayTraced(RayTracePipeline),
    Tonemap(TonemapPipeline),
}

impl RenderPipeline {
    pub fn background(clear_color: [f32; 4]) -> Self {
        Self::Background(BackgroundPipeline {
            state: PipelineState::Unloaded,
            clear_color,
        })
    }

    pub fn rasterized() -> Self {
        Self::Rasterized(RasterPipeline {
            state: PipelineState::Unloaded,
            draw_count: 0,
        })
    }

    pub fn ray_traced() -> Self {
        Self::RayTraced(RayTracePipeline {
            state: PipelineState::Unloaded,
            push_constants: None,
        })
    }

    pub fn tonemap(exposure: f32) -> Self {
        Self::Tonemap(TonemapPipeline {
            state: PipelineState::Unloaded,
            exposure,
        })
    }

    /// Background, ray-traced and tonemap passes in submission order
    pub fn standard_set() -> Vec<Self> {
        vec![
            Self::background([0.0, 0.0, 0.0, 1.0]),
            Self::ray_traced(),
            Self::tonemap(1.0),
        ]
    }

    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Background(_) => PipelineKind::Background,
            Self::Rasterized(_) => PipelineKind::Rasterized,
            Self::RayTraced(_) => PipelineKind::RayTraced,
            Self::Tonemap(_) => PipelineKind::Tonemap,
        }
    }

    pub fn state(&self) -> PipelineState {
        match self {
            Self::Background(p) => p.state,
            Self::Rasterized(p) => p.state,
            Self::RayTraced(p) => p.state,
            Self::Tonemap(p) => p.state,
        }
    }

    fn state_mut(&mut self) -> &mut PipelineState {
        match self {
            Self::Background(p) => &mut p.state,
            Self::Rasterized(p) => &mut p.state,
            Self::RayTraced(p) => &mut p.state,
            Self::Tonemap(p) => &mut p.state,
        }
    }

    /// Shader stages and entry points the variant is built from
    pub fn shader_stages(&self) -> &'static [(vk::ShaderStageFlags, &'static str)] {
        match self {
            Self::Background(_) | Self::Tonemap(_) => &[
                (vk::ShaderStageFlags::VERTEX, "fullscreen_vs"),
                (vk::ShaderStageFlags::FRAGMENT, "main"),
            ],
            Self::Rasterized(_) => &[
                (vk::ShaderStageFlags::VERTEX, "main"),
                (vk::ShaderStageFlags::FRAGMENT, "main"),
            ],
            Self::RayTraced(_) => &[
                (vk::ShaderStageFlags::RAYGEN_KHR, "raygen"),
                (vk::ShaderStageFlags::MISS_KHR, "miss"),
                (vk::ShaderStageFlags::CLOSEST_HIT_KHR, "closest_hit"),
            ],
        }
    }

    /// Resolve shader stages; loading twice is a no-op
    pub fn load(&mut self) -> Result<(), PipelineError> {
        let kind = self.kind();
        let stages = self.shader_stages().len();
        let state = self.state_mut();
        if *state == PipelineState::Unloaded {
            *state = PipelineState::Loaded;
            log::debug!("Loaded {kind:?} pipeline ({stages} stages)");
        }
        Ok(())
    }

    /// Build the pipeline object from loaded stages
    pub fn compile(&mut self) -> Result<(), PipelineError> {
        let kind = self.kind();
        let state = self.state_mut();
        match *state {
            PipelineState::Unloaded => Err(PipelineError::NotLoaded(kind)),
            PipelineState::Loaded => {
                *state = PipelineState::Compiled;
                log::debug!("Compiled {kind:?} pipeline");
                Ok(())
            }
            PipelineState::Compiled => Ok(()),
        }
    }

    /// Take the inputs of one frame
    pub fn update(&mut self, frame: &FrameInputs) -> Result<(), PipelineError> {
        let kind = self.kind();
        if self.state() != PipelineState::Compiled {
            return Err(PipelineError::NotCompiled(kind));
        }
        match self {
            Self::Background(_) | Self::Tonemap(_) => {}
            Self::Rasterized(p) => p.draw_count = frame.instance_count,
            Self::RayTraced(p) => {
                if frame.tlas_address == 0 {
                    return Err(PipelineError::MissingInput { kind, what: "TLAS address" });
                }
                if frame.scene_buffer_address == 0 {
                    return Err(PipelineError::MissingInput {
                        kind,
                        what: "scene buffer address",
                    });
                }
                p.push_constants = Some(frame.push_constants());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tlas_address: DeviceAddress) -> FrameInputs {
        FrameInputs {
            frame_index: 0,
            frame_number: 0,
            dt: 0.016,
            tlas_address,
            scene_buffer_address: 0x2000,
            instance_count: 4,
            tlas_rebuilt: true,
        }
    }

    #[test]
    fn test_push_constant_layout() {
        let constants = RayTracePushConstants {
            tlas_address: 0x1122_3344_5566_7788,
            scene_buffer_address: 1,
        };
        assert_eq!(RayTracePushConstants::SIZE, 16);
        assert_eq!(&constants.as_bytes()[..8], &0x1122_3344_5566_7788u64.to_ne_bytes());
        assert_eq!(RayTracePushConstants::range().size, 16);
    }

    #[test]
    fn test_lifecycle_order_is_enforced() {
        let mut pipeline = RenderPipeline::ray_traced();
        assert_eq!(pipeline.compile(), Err(PipelineError::NotLoaded(PipelineKind::RayTraced)));
        assert_eq!(
            pipeline.update(&frame(0x1000)),
            Err(PipelineError::NotCompiled(PipelineKind::RayTraced))
        );
        pipeline.load().unwrap();
        pipeline.compile().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Compiled);
        pipeline.update(&frame(0x1000)).unwrap();

        let RenderPipeline::RayTraced(rt) = &pipeline else {
            panic!("expected ray-traced variant");
        };
        assert_eq!(
            rt.push_constants(),
            Some(&RayTracePushConstants {
                tlas_address: 0x1000,
                scene_buffer_address: 0x2000
            })
        );
    }

    #[test]
    fn test_ray_traced_requires_tlas() {
        let mut pipeline = RenderPipeline::ray_traced();
        pipeline.load().unwrap();
        pipeline.compile().unwrap();
        assert!(matches!(
            pipeline.update(&frame(0)),
            Err(PipelineError::MissingInput { .. })
        ));
    }

    #[test]
    fn test_raster_counts_instances() {
        let mut pipeline = RenderPipeline::rasterized();
        pipeline.load().unwrap();
        pipeline.compile().unwrap();
        pipeline.update(&frame(0)).unwrap();
        let RenderPipeline::Rasterized(raster) = &pipeline else {
            panic!("expected rasterized variant");
        };
        assert_eq!(raster.draw_count(), 4);
    }
}
