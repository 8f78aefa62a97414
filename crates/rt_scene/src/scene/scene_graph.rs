//! Traversal buffer and transform propagation
//!
//! The traversal buffer is a flat list of root-to-leaf paths, each closed by
//! an end-of-branch marker:
//!
//! ```text
//!        root                 [root, a, c, END,
//!       /    \                 root, a, d, END,
//!      a      b                root, b, END]
//!     / \
//!    c   d
//! ```
//!
//! It is built with an explicit stack, so depth is bounded by memory rather
//! than the call stack, and is rebuilt only when the topology changes.
//! Propagation walks it once: inside a path each node composes its parent's
//! world matrix with its own local matrix, and a marker resets the parent.
//! Shared ancestors are visited once per path through them; every visit
//! recomputes the world matrix, so clean descendants of a changed node always
//! pick up the new parent matrix.

use bitflags::bitflags;
use crate::ecs::components::{LocalTransform, SceneGraphNode, WorldTransform};
use crate::ecs::{Entity, World};
use crate::foundation::math::Mat4;

bitflags! {
    /// Pending work on a scene
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u8 {
        /// Topology changed; the traversal buffer must be rebuilt
        const SCENE_GRAPH = 1 << 0;
        /// Instances changed; the TLAS must be rebuilt
        const TLAS = 1 << 1;
    }
}

/// One entry of the traversal buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalStep {
    /// Visit a node; its parent is the previous node of the same path
    Node(Entity),
    /// End of a root-to-leaf path
    EndOfBranch,
}

/// Proof that world transforms were propagated
///
/// Only [`Scene::update`](crate::scene::Scene::update) creates one, and
/// [`Scene::rebuild_tlas`](crate::scene::Scene::rebuild_tlas) consumes it.
#[derive(Debug)]
#[must_use = "pass the token to Scene::rebuild_tlas"]
pub struct TransformsPropagated {
    scene_id: u64,
    epoch: u64,
}

impl TransformsPropagated {
    pub(crate) const fn new(scene_id: u64, epoch: u64) -> Self {
        Self { scene_id, epoch }
    }

    pub(crate) const fn scene_id(&self) -> u64 {
        self.scene_id
    }

    pub(crate) const fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Counters of one propagation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationStats {
    /// Node visits, counting shared ancestors once per path
    pub visits: usize,
    /// Local matrices recomposed because they were dirty
    pub recomposed: usize,
}

/// Traversal buffer plus scene-level dirty flags
#[derive(Debug)]
pub struct SceneGraph {
    traversal: Vec<TraversalStep>,
    flags: DirtyFlags,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self {
            traversal: Vec::new(),
            flags: DirtyFlags::all(),
        }
    }
}

impl SceneGraph {
    /// Start with everything dirty
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> DirtyFlags {
        self.flags
    }

    pub fn mark(&mut self, flags: DirtyFlags) {
        self.flags |= flags;
    }

    pub fn clear(&mut self, flags: DirtyFlags) {
        self.flags &= !flags;
    }

    /// Current traversal buffer
    pub fn traversal(&self) -> &[TraversalStep] {
        &self.traversal
    }

    /// Rebuild the traversal buffer if the topology changed
    pub fn refresh_traversal(&mut self, world: &World, root: Entity) {
        if self.flags.contains(DirtyFlags::SCENE_GRAPH) {
            self.traversal = Self::build_traversal(world, root);
            self.clear(DirtyFlags::SCENE_GRAPH);
            log::trace!("Rebuilt traversal buffer: {} steps", self.traversal.len());
        }
    }

    /// Flatten the tree under `root` into root-to-leaf paths
    ///
    /// Children are visited in insertion order.
    pub fn build_traversal(world: &World, root: Entity) -> Vec<TraversalStep> {
        let mut steps = Vec::new();
        let mut stack = vec![vec![root]];

        while let Some(path) = stack.pop() {
            let Some(&node) = path.last() else { continue };
            let children = world
                .get::<SceneGraphNode>(node)
                .map(|n| n.children.as_slice())
                .unwrap_or_default();

            if children.is_empty() {
                steps.extend(path.iter().map(|&e| TraversalStep::Node(e)));
                steps.push(TraversalStep::EndOfBranch);
            } else {
                for &child in children.iter().rev() {
                    let mut child_path = Vec::with_capacity(path.len() + 1);
                    child_path.extend_from_slice(&path);
                    child_path.push(child);
                    stack.push(child_path);
                }
            }
        }
        steps
    }

    /// Recompute every world matrix along the traversal buffer
    ///
    /// The root and its direct children take their local matrix as their
    /// world matrix; deeper nodes compose with their parent's world matrix.
    /// Sets [`DirtyFlags::TLAS`] when any local matrix was dirty.
    pub fn propagate(&mut self, world: &mut World) -> PropagationStats {
        let mut stats = PropagationStats::default();
        let mut parent: Option<Entity> = None;
        let mut depth = 0usize;

        for step in &self.traversal {
            let entity = match *step {
                TraversalStep::Node(entity) => entity,
                TraversalStep::EndOfBranch => {
                    parent = None;
                    depth = 0;
                    continue;
                }
            };
            // Paths start at the root, so depth 1 is a root-level node.
            if depth <= 1 {
                parent = None;
            }

            let parent_world = parent
                .and_then(|p| world.get::<WorldTransform>(p))
                .map_or_else(Mat4::identity, |w| w.matrix);

            let local = match world.get_mut::<LocalTransform>(entity) {
                Some(local) => {
                    if local.recompose() {
                        stats.recomposed += 1;
                    }
                    *local.matrix()
                }
                None => Mat4::identity(),
            };

            let matrix = parent_world * local;
            match world.get_mut::<WorldTransform>(entity) {
                Some(world_transform) => world_transform.matrix = matrix,
                None => {
                    if world.insert(entity, WorldTransform { matrix }).is_err() {
                        log::warn!("Traversal refers to despawned {entity}");
                    }
                }
            }

            stats.visits += 1;
            parent = Some(entity);
            depth += 1;
        }

        if stats.recomposed > 0 {
            self.mark(DirtyFlags::TLAS);
        }
        stats
    }
}
