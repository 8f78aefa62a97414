//! Sparse-set component storage
//!
//! ```text
//! sparse:   [ -, 0, -, 2, 1 ]      indexed by entity id
//! dense:    [ c1, c4, c3 ]         packed components
//! entities: [ e1, e4, e3 ]         owner of each dense slot
//! ```
//!
//! Insert, lookup and remove are O(1); iteration walks the packed arrays.
//! Removal swaps the last element into the hole, so iteration order changes
//! only when components are removed.

use std::any::Any;
use crate::ecs::entity::Entity;

/// Packed storage for one component kind
#[derive(Debug, Clone)]
pub struct SparseSet<T> {
    sparse: Vec<Option<u32>>,
    dense: Vec<T>,
    entities: Vec<Entity>,
}

impl<T> Default for SparseSet<T> {
    fn default() -> Self {
        Self {
            sparse: Vec::new(),
            dense: Vec::new(),
            entities: Vec::new(),
        }
    }
}

impl<T> SparseSet<T> {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn dense_index(&self, entity: Entity) -> Option<usize> {
        let index = (*self.sparse.get(entity.id() as usize)?)? as usize;
        (self.entities[index] == entity).then_some(index)
    }

    /// Insert or replace the component of `entity`, returning the old value
    pub fn insert(&mut self, entity: Entity, value: T) -> Option<T> {
        let id = entity.id() as usize;
        if id >= self.sparse.len() {
            self.sparse.resize(id + 1, None);
        }

        if let Some(index) = self.sparse[id].map(|index| index as usize) {
            if self.entities[index] == entity {
                return Some(std::mem::replace(&mut self.dense[index], value));
            }
            // Stale slot left by an older generation of this id.
            self.remove_at(index);
        }

        self.sparse[id] = Some(self.dense.len() as u32);
        self.dense.push(value);
        self.entities.push(entity);
        None
    }

    fn remove_at(&mut self, index: usize) -> T {
        let removed_entity = self.entities.swap_remove(index);
        let value = self.dense.swap_remove(index);
        self.sparse[removed_entity.id() as usize] = None;
        if let Some(moved) = self.entities.get(index) {
            self.sparse[moved.id() as usize] = Some(index as u32);
        }
        value
    }

    /// Remove the component of `entity`
    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        let index = self.dense_index(entity)?;
        Some(self.remove_at(index))
    }

    /// Component of `entity`
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.dense_index(entity).map(|index| &self.dense[index])
    }

    /// Mutable component of `entity`
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        self.dense_index(entity).map(|index| &mut self.dense[index])
    }

    /// Whether `entity` has a component in this set
    pub fn contains(&self, entity: Entity) -> bool {
        self.dense_index(entity).is_some()
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.dense.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Owners in dense order
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Components with their owners, in dense order
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.entities.iter().copied().zip(self.dense.iter())
    }

    /// Mutable components with their owners, in dense order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Entity, &mut T)> + '_ {
        self.entities.iter().copied().zip(self.dense.iter_mut())
    }
}

/// Type-erased view used by the world to drop every component of a despawned
/// entity without knowing the component types
pub(crate) trait ErasedStorage: Any + Send + Sync {
    fn remove_entity(&mut self, entity: Entity);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static + Send + Sync> ErasedStorage for SparseSet<T> {
    fn remove_entity(&mut self, entity: Entity) {
        self.remove(entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: u32) -> Entity {
        Entity::new(id, 0)
    }

    #[test]
    fn test_insert_get_replace() {
        let mut set = SparseSet::new();
        assert_eq!(set.insert(entity(5), "a"), None);
        assert_eq!(set.insert(entity(5), "b"), Some("a"));
        assert_eq!(set.get(entity(5)), Some(&"b"));
        assert_eq!(set.len(), 1);
        assert!(set.get(entity(4)).is_none());
    }

    #[test]
    fn test_swap_remove_keeps_lookup_consistent() {
        let mut set = SparseSet::new();
        for id in 0..4 {
            set.insert(entity(id), id * 10);
        }
        assert_eq!(set.remove(entity(1)), Some(10));
        assert_eq!(set.remove(entity(1)), None);
        for id in [0, 2, 3] {
            assert_eq!(set.get(entity(id)), Some(&(id * 10)));
        }
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_generation_mismatch_is_absent() {
        let mut set = SparseSet::new();
        set.insert(Entity::new(2, 0), 1);
        assert!(set.get(Entity::new(2, 1)).is_none());
        set.insert(Entity::new(2, 1), 2);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(Entity::new(2, 1)), Some(&2));
        assert!(set.get(Entity::new(2, 0)).is_none());
    }
}
