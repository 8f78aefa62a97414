//! Headless driver
//!
//! Builds a small scene, runs a fixed number of frames through the frame
//! driver and logs what reached the device. Runs on a real Vulkan device by
//! default, or on the in-memory recording device with `--software`.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nalgebra::{Unit, UnitQuaternion};
use thiserror::Error;

use rt_scene::config::{Config, ConfigError};
use rt_scene::ecs::Entity;
use rt_scene::foundation::logging;
use rt_scene::prelude::*;
use rt_scene::render::VulkanError;

/// Frame time fed to the scene update
const FRAME_DT: f32 = 1.0 / 60.0;

#[derive(Parser, Debug)]
#[command(name = "rt_headless", about = "Run the ray-tracing scene core without a window")]
struct Args {
    /// Engine configuration (.toml or .ron)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Use the in-memory recording device instead of Vulkan
    #[arg(long)]
    software: bool,

    /// Number of frames to prepare
    #[arg(long, default_value_t = 3)]
    frames: u32,

    /// OBJ model placed at the origin
    #[arg(long, value_name = "PATH")]
    obj: Option<PathBuf>,
}

#[derive(Error, Debug)]
enum AppError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("device: {0}")]
    Device(#[from] VulkanError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct DemoScene {
    pivot: Entity,
}

fn build_scene(scene: &mut Scene, resources: &mut ResourceManager, obj: Option<&PathBuf>) -> EngineResult<DemoScene> {
    let cube = resources.load_mesh("cube", &MeshData::cube())?;
    let triangle = resources.load_mesh("triangle", &MeshData::triangle())?;

    let root = scene.root();
    let left = scene.create_node(root, LocalTransform::from_translation(Vec3::new(-1.5, 0.0, 0.0)))?;
    scene.attach_mesh(left, cube, &*resources)?;
    scene.set_name(left, "cube")?;

    let pivot = scene.create_node(root, LocalTransform::identity())?;
    scene.set_name(pivot, "pivot")?;
    let orbiter = scene.create_node(pivot, LocalTransform::from_translation(Vec3::new(1.5, 0.0, 0.0)))?;
    scene.attach_mesh(orbiter, triangle, &*resources)?;

    if let Some(path) = obj {
        match resources.load_obj(path) {
            Ok(model) => {
                let node = scene.create_node(root, LocalTransform::identity())?;
                scene.attach_mesh(node, model, &*resources)?;
                scene.set_name(node, &path.display().to_string())?;
            }
            Err(e) => log::warn!("Failed to load {}: {e}, continuing without it", path.display()),
        }
    }

    Ok(DemoScene { pivot })
}

fn run(args: &Args) -> Result<(), AppError> {
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };
    logging::init_with_level(&config.log_level);

    let device: Arc<dyn RenderDevice> = if args.software {
        Arc::new(RecordingDevice::new())
    } else {
        Arc::new(VulkanDevice::new(&config.device)?)
    };
    log::info!("Using device: {}", device.name());

    let context = RenderContext::new(device, config)?;
    let mut resources = ResourceManager::new(&context)?;
    let mut scene = Scene::new(&context);
    let mut frames = FrameDriver::new(&context);
    let demo = build_scene(&mut scene, &mut resources, args.obj.as_ref())?;

    let axis = Unit::new_normalize(Vec3::y());
    for frame in 0..args.frames {
        let angle = frame as f32 * FRAME_DT * std::f32::consts::TAU;
        scene.set_rotation(demo.pivot, UnitQuaternion::from_axis_angle(&axis, angle)).map_err(EngineError::from)?;

        let inputs = frames.prepare_frame(&mut scene, &mut resources, FRAME_DT)?;
        log::info!(
            "Frame {} (slot {}): {} instances, TLAS {:#x}{}, scene buffer {:#x}",
            inputs.frame_number,
            inputs.frame_index,
            inputs.instance_count,
            inputs.tlas_address,
            if inputs.tlas_rebuilt { " (rebuilt)" } else { "" },
            inputs.scene_buffer_address
        );
    }

    let stats = scene.tlas().stats();
    log::info!(
        "Done: {} nodes, {} meshes, {} full TLAS builds, {} refits, {} skipped",
        scene.node_count(),
        resources.meshes().len(),
        stats.full_builds,
        stats.refits,
        stats.skipped
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("rt_headless: {e}");
            ExitCode::FAILURE
        }
    }
}
