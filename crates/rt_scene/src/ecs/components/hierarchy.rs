//! Parent/child links

use crate::ecs::{Component, Entity};

/// Graph membership of an entity
///
/// Only the root has no parent. Children keep insertion order, which is the
/// order the traversal visits them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SceneGraphNode {
    pub parent: Option<Entity>,
    pub children: Vec<Entity>,
}

impl Component for SceneGraphNode {}

impl SceneGraphNode {
    pub fn with_parent(parent: Entity) -> Self {
        Self {
            parent: Some(parent),
            children: Vec::new(),
        }
    }

    /// Drop `child` from the child list, returning whether it was present
    pub fn remove_child(&mut self, child: Entity) -> bool {
        match self.children.iter().position(|c| *c == child) {
            Some(index) => {
                self.children.remove(index);
                true
            }
            None => false,
        }
    }
}
