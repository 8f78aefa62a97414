//! Transform propagation over random trees

use std::collections::HashMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rt_scene::foundation::math::{compose_trs, Mat4, Quat, Vec3};
use rt_scene::prelude::*;
use rt_scene::scene::{SceneError, TraversalStep};

fn scene() -> Scene {
    let device = Arc::new(RecordingDevice::new());
    let context = RenderContext::new(device, EngineConfig::default()).unwrap();
    Scene::new(&context)
}

fn random_local(rng: &mut StdRng) -> LocalTransform {
    let translation = Vec3::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0));
    let axis = nalgebra::Unit::new_normalize(Vec3::new(
        rng.gen_range(-1.0..1.0),
        rng.gen_range(-1.0..1.0),
        rng.gen_range(0.1..1.0),
    ));
    let rotation = Quat::from_axis_angle(&axis, rng.gen_range(0.0..std::f32::consts::TAU));
    let scale = Vec3::new(rng.gen_range(0.5..2.0), rng.gen_range(0.5..2.0), rng.gen_range(0.5..2.0));
    LocalTransform::from_trs(translation, rotation, scale)
}

fn random_tree(scene: &mut Scene, rng: &mut StdRng, count: usize) -> Vec<Entity> {
    let mut nodes = vec![scene.root()];
    for _ in 0..count {
        let parent = nodes[rng.gen_range(0..nodes.len())];
        let node = scene.create_node(parent, random_local(rng)).unwrap();
        nodes.push(node);
    }
    nodes
}

/// Reference world matrices computed top-down from the parent links
///
/// Root-level nodes take their local matrix unmodified.
fn reference_worlds(scene: &Scene, nodes: &[Entity]) -> HashMap<Entity, Mat4> {
    let mut worlds = HashMap::new();
    let mut pending = vec![scene.root()];
    while let Some(node) = pending.pop() {
        let local = scene.local_transform(node).unwrap();
        let local = compose_trs(local.translation(), local.rotation(), local.scale());
        let world = match scene.parent(node) {
            Some(parent) if parent != scene.root() => worlds[&parent] * local,
            _ => local,
        };
        worlds.insert(node, world);
        pending.extend_from_slice(scene.children(node));
    }
    assert_eq!(worlds.len(), nodes.len());
    worlds
}

fn assert_worlds_match(scene: &Scene, nodes: &[Entity]) {
    let expected = reference_worlds(scene, nodes);
    for node in nodes {
        assert_relative_eq!(*scene.world_matrix(*node).unwrap(), expected[node], epsilon = 1e-3);
    }
}

#[test]
fn random_trees_propagate_like_the_recursive_definition() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..5 {
        let mut scene = scene();
        let nodes = random_tree(&mut scene, &mut rng, 120);
        let _ = scene.update(0.0);
        assert_worlds_match(&scene, &nodes);
    }
}

#[test]
fn traversal_holds_one_path_per_leaf() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut scene = scene();
    let nodes = random_tree(&mut scene, &mut rng, 60);
    let _ = scene.update(0.0);

    let leaves = nodes.iter().filter(|n| scene.children(**n).is_empty()).count();
    let steps = scene.traversal();
    let ends = steps.iter().filter(|s| **s == TraversalStep::EndOfBranch).count();
    assert_eq!(ends, leaves);

    let mut at_path_start = true;
    let mut previous: Option<Entity> = None;
    for step in steps {
        match *step {
            TraversalStep::Node(node) => {
                if at_path_start {
                    assert_eq!(node, scene.root());
                } else {
                    assert_eq!(scene.parent(node), previous);
                }
                previous = Some(node);
                at_path_start = false;
            }
            TraversalStep::EndOfBranch => {
                assert!(scene.children(previous.unwrap()).is_empty());
                at_path_start = true;
            }
        }
    }
}

#[test]
fn edits_and_reparenting_converge() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut scene = scene();
    let nodes = random_tree(&mut scene, &mut rng, 80);
    let _ = scene.update(0.0);

    for round in 0..10 {
        for _ in 0..8 {
            let node = nodes[rng.gen_range(1..nodes.len())];
            scene
                .set_translation(node, Vec3::new(round as f32, rng.gen_range(-1.0..1.0), 0.0))
                .unwrap();
        }
        for _ in 0..3 {
            let node = nodes[rng.gen_range(1..nodes.len())];
            let parent = nodes[rng.gen_range(0..nodes.len())];
            match scene.reparent(node, parent) {
                Ok(()) | Err(SceneError::CycleDetected { .. }) => {}
                Err(e) => panic!("unexpected reparent failure: {e}"),
            }
        }

        let _ = scene.update(0.016);
        assert_worlds_match(&scene, &nodes);
        assert!(nodes.iter().all(|n| !scene.local_transform(*n).unwrap().is_dirty()));

        let _ = scene.update(0.016);
        assert_eq!(scene.last_propagation().recomposed, 0);
    }
}

#[test]
fn deep_chains_propagate() {
    let mut scene = scene();
    let mut parent = scene.root();
    for _ in 0..5_000 {
        parent = scene
            .create_node(parent, LocalTransform::from_translation(Vec3::new(0.0, 0.001, 0.0)))
            .unwrap();
    }
    let _ = scene.update(0.0);
    assert_relative_eq!(scene.world_matrix(parent).unwrap()[(1, 3)], 5.0, epsilon = 1e-2);
}

#[test]
fn rotation_is_applied_before_translation_of_children() {
    let mut scene = scene();
    let pivot = scene
        .create_node(
            scene.root(),
            LocalTransform::identity()
                .with_rotation(Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2)),
        )
        .unwrap();
    let arm = scene
        .create_node(pivot, LocalTransform::from_translation(Vec3::new(1.0, 0.0, 0.0)))
        .unwrap();
    let _ = scene.update(0.0);

    let world = scene.world_matrix(arm).unwrap();
    assert_relative_eq!(world[(0, 3)], 0.0, epsilon = 1e-6);
    assert_relative_eq!(world[(1, 3)], 1.0, epsilon = 1e-6);
}
