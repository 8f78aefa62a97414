//! World container
//!
//! Owns entity allocation and one sparse set per component type.

use std::any::TypeId;
use std::collections::HashMap;

use crate::ecs::component::Component;
use crate::ecs::entity::Entity;
use crate::ecs::storage::{ErasedStorage, SparseSet};

/// Entity and component store
#[derive(Default)]
pub struct World {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_ids: Vec<u32>,
    live_count: usize,
    component_storages: HashMap<TypeId, Box<dyn ErasedStorage>>,
}

impl World {
    /// Create a new empty world
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new entity
    pub fn spawn(&mut self) -> Entity {
        self.live_count += 1;
        if let Some(id) = self.free_ids.pop() {
            self.alive[id as usize] = true;
            return Entity::new(id, self.generations[id as usize]);
        }
        let id = self.generations.len() as u32;
        self.generations.push(0);
        self.alive.push(true);
        Entity::new(id, 0)
    }

    /// Destroy an entity and all of its components
    ///
    /// Returns false when the entity was already gone.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        for storage in self.component_storages.values_mut() {
            storage.remove_entity(entity);
        }
        let id = entity.id() as usize;
        self.alive[id] = false;
        self.generations[id] = self.generations[id].wrapping_add(1);
        self.free_ids.push(entity.id());
        self.live_count -= 1;
        true
    }

    /// Whether the entity is alive
    pub fn is_alive(&self, entity: Entity) -> bool {
        let id = entity.id() as usize;
        self.alive.get(id).copied().unwrap_or(false) && self.generations[id] == entity.generation()
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.live_count
    }

    /// Add or replace a component, returning the previous value
    ///
    /// Components cannot be attached to dead entities; the value is handed
    /// back in `Err`.
    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) -> Result<Option<T>, T> {
        if !self.is_alive(entity) {
            return Err(component);
        }
        Ok(self.storage_or_insert::<T>().insert(entity, component))
    }

    /// Remove a component from an entity
    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        self.storage_mut::<T>()?.remove(entity)
    }

    /// Get a component from an entity
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.storage::<T>()?.get(entity)
    }

    /// Get a mutable component from an entity
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        self.storage_mut::<T>()?.get_mut(entity)
    }

    /// Whether the entity has a component of type `T`
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.storage::<T>().is_some_and(|set| set.contains(entity))
    }

    /// Storage for one component type, if any component of it was ever added
    pub fn storage<T: Component>(&self) -> Option<&SparseSet<T>> {
        self.component_storages
            .get(&TypeId::of::<T>())
            .and_then(|storage| storage.as_any().downcast_ref())
    }

    /// Mutable storage for one component type
    pub fn storage_mut<T: Component>(&mut self) -> Option<&mut SparseSet<T>> {
        self.component_storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|storage| storage.as_any_mut().downcast_mut())
    }

    fn storage_or_insert<T: Component>(&mut self) -> &mut SparseSet<T> {
        let storage = self
            .component_storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(SparseSet::<T>::new()));
        match storage.as_any_mut().downcast_mut() {
            Some(set) => set,
            None => unreachable!("storage registered under the TypeId of another type"),
        }
    }

    /// Entities that have both an `A` and a `B`
    ///
    /// Walks the smaller of the two sets and probes the other.
    pub fn join<A: Component, B: Component>(&self) -> Vec<(Entity, &A, &B)> {
        let (Some(a), Some(b)) = (self.storage::<A>(), self.storage::<B>()) else {
            return Vec::new();
        };
        if a.len() <= b.len() {
            a.iter()
                .filter_map(|(entity, a)| b.get(entity).map(|b| (entity, a, b)))
                .collect()
        } else {
            b.iter()
                .filter_map(|(entity, b)| a.get(entity).map(|a| (entity, a, b)))
                .collect()
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.live_count)
            .field("component_types", &self.component_storages.len())
            .finish()
    }
}
