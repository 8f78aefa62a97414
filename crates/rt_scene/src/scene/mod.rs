//! Scene graph and its GPU mirror

pub mod scene;
pub mod scene_graph;

pub use scene::Scene;
pub use scene_graph::{DirtyFlags, SceneGraph, TransformsPropagated, TraversalStep};

use thiserror::Error;
use crate::ecs::Entity;
use crate::resources::ResourceHandle;

/// Scene graph errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// The entity was despawned or never existed
    #[error("{0} does not exist")]
    EntityNotFound(Entity),

    /// The entity exists but is not part of the graph
    #[error("{0} is not in the scene graph")]
    NotInGraph(Entity),

    /// The entity is already attached somewhere in the graph
    #[error("{0} is already in the scene graph")]
    AlreadyInGraph(Entity),

    /// The mesh handle has no built BLAS
    #[error("mesh {0} is not loaded")]
    MeshNotLoaded(ResourceHandle),

    /// The root is fixed for the lifetime of the scene
    #[error("the scene root cannot be removed or reparented")]
    RootIsFixed,

    /// Reparenting would make a node its own ancestor
    #[error("reparenting {entity} under {parent} would create a cycle")]
    CycleDetected {
        /// Node being moved
        entity: Entity,
        /// Requested parent
        parent: Entity,
    },

    /// The scene changed after the propagation that produced the token
    #[error("world transforms changed since propagation; call update() again")]
    StaleTransforms,

    /// The token was produced by a different scene
    #[error("propagation token belongs to another scene")]
    ForeignToken,
}

impl SceneError {
    /// Whether this error reports a TLAS build against unpropagated transforms
    pub const fn is_stale_acceleration(&self) -> bool {
        matches!(self, Self::StaleTransforms | Self::ForeignToken)
    }
}
