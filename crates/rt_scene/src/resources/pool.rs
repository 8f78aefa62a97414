//! Fixed-capacity slot pool with content-addressed deduplication
//!
//! ```text
//! create(key, ctor)
//!     ├── key already live  → existing handle, ctor not called
//!     ├── no free slot      → PoolError::Exhausted
//!     └── pop free slot     → ctor() → record key ↔ handle
//!
//! free(handle) → resource returned, key forgotten, slot recycled with a new generation
//! ```
//!
//! The pool never grows. Constructors may perform GPU uploads, so `create` is
//! single-threaded by virtue of taking `&mut self`.

use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;
use crate::resources::handle::ResourceHandle;

/// Pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is taken
    #[error("{pool} pool exhausted (capacity {capacity})")]
    Exhausted {
        /// Pool name
        pool: &'static str,
        /// Fixed capacity
        capacity: usize,
    },

    /// Handle is the sentinel, out of range, or refers to a freed slot
    #[error("invalid {pool} handle {handle}")]
    InvalidHandle {
        /// Pool name
        pool: &'static str,
        /// Offending handle
        handle: ResourceHandle,
    },
}

struct Slot<K, T> {
    generation: u32,
    entry: Option<(K, T)>,
}

/// Fixed-capacity, handle-indexed storage keyed by content
pub struct ResourcePool<K, T> {
    name: &'static str,
    slots: Vec<Slot<K, T>>,
    free_list: Vec<u32>,
    key_to_handle: HashMap<K, ResourceHandle>,
}

impl<K: Eq + Hash + Clone, T> ResourcePool<K, T> {
    /// Create a pool with `capacity` slots
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot { generation: 0, entry: None }).collect();
        // Popped from the back, so slot 0 is handed out first.
        let free_list = (0..capacity as u32).rev().collect();
        log::debug!("Created {name} pool with {capacity} slots");
        Self {
            name,
            slots,
            free_list,
            key_to_handle: HashMap::with_capacity(capacity),
        }
    }

    /// Return the handle stored under `key`, constructing the resource if the
    /// key is not live
    ///
    /// `ctor` runs at most once and only when a slot is available. If it fails
    /// the slot goes back to the free list untouched.
    pub fn create<E, F>(&mut self, key: K, ctor: F) -> Result<ResourceHandle, E>
    where
        E: From<PoolError>,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(&handle) = self.key_to_handle.get(&key) {
            log::trace!("{} pool: reusing {handle}", self.name);
            return Ok(handle);
        }

        let Some(index) = self.free_list.pop() else {
            log::warn!("{} pool exhausted at {} slots", self.name, self.slots.len());
            return Err(PoolError::Exhausted {
                pool: self.name,
                capacity: self.slots.len(),
            }
            .into());
        };

        let resource = match ctor() {
            Ok(resource) => resource,
            Err(e) => {
                self.free_list.push(index);
                return Err(e);
            }
        };

        let slot = &mut self.slots[index as usize];
        let handle = ResourceHandle::new(index, slot.generation);
        slot.entry = Some((key.clone(), resource));
        self.key_to_handle.insert(key, handle);
        Ok(handle)
    }

    fn slot(&self, handle: ResourceHandle) -> Option<&Slot<K, T>> {
        self.slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation() && slot.entry.is_some())
    }

    fn invalid(&self, handle: ResourceHandle) -> PoolError {
        PoolError::InvalidHandle {
            pool: self.name,
            handle,
        }
    }

    /// Bounds- and generation-checked lookup
    pub fn get(&self, handle: ResourceHandle) -> Result<&T, PoolError> {
        self.slot(handle)
            .and_then(|slot| slot.entry.as_ref())
            .map(|(_, resource)| resource)
            .ok_or_else(|| self.invalid(handle))
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, handle: ResourceHandle) -> Result<&mut T, PoolError> {
        let name = self.name;
        self.slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.entry.as_mut())
            .map(|(_, resource)| resource)
            .ok_or(PoolError::InvalidHandle { pool: name, handle })
    }

    /// Whether `handle` refers to a live slot
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.slot(handle).is_some()
    }

    /// Live handle stored under `key`
    pub fn handle_for(&self, key: &K) -> Option<ResourceHandle> {
        self.key_to_handle.get(key).copied()
    }

    /// Key a live handle was created with
    pub fn key_of(&self, handle: ResourceHandle) -> Option<&K> {
        self.slot(handle).and_then(|slot| slot.entry.as_ref()).map(|(key, _)| key)
    }

    /// Remove a resource, forget its key and recycle the slot
    ///
    /// Freeing a handle twice returns [`PoolError::InvalidHandle`] and leaves
    /// the pool unchanged.
    pub fn free(&mut self, handle: ResourceHandle) -> Result<T, PoolError> {
        if !self.contains(handle) {
            return Err(self.invalid(handle));
        }
        let slot = &mut self.slots[handle.index() as usize];
        let (key, resource) = slot.entry.take().ok_or(PoolError::InvalidHandle {
            pool: self.name,
            handle,
        })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.key_to_handle.remove(&key);
        self.free_list.push(handle.index());
        Ok(resource)
    }

    /// Remove every resource, returning them for cleanup
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<ResourceHandle> = self.iter().map(|(handle, _)| handle).collect();
        handles.into_iter().filter_map(|handle| self.free(handle).ok()).collect()
    }

    /// Live resources with their handles, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .map(|(_, resource)| (ResourceHandle::new(index as u32, slot.generation), resource))
        })
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    /// Whether no resource is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Pool name used in diagnostics
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn ok<T>(value: T) -> Result<T, PoolError> {
        Ok(value)
    }

    #[test]
    fn test_first_handle_is_slot_zero() {
        let mut pool: ResourcePool<&str, u32> = ResourcePool::new("test", 4);
        let handle = pool.create("a", || ok(1)).unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(*pool.get(handle).unwrap(), 1);
    }

    #[test]
    fn test_dedup_returns_same_handle_without_reconstructing() {
        let mut pool: ResourcePool<String, u32> = ResourcePool::new("test", 4);
        let mut constructions = 0;
        let first = pool
            .create("mesh.obj".to_string(), || {
                constructions += 1;
                ok(7)
            })
            .unwrap();
        let second = pool
            .create("mesh.obj".to_string(), || {
                constructions += 1;
                ok(8)
            })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(constructions, 1);
        assert_eq!(*pool.get(first).unwrap(), 7);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_exhaustion_keeps_existing_handles() {
        let capacity = 3;
        let mut pool: ResourcePool<usize, usize> = ResourcePool::new("test", capacity);
        let handles: Vec<_> = (0..capacity).map(|i| pool.create(i, || ok(i * 10)).unwrap()).collect();

        let result = pool.create(capacity, || ok(0));
        assert_eq!(result, Err(PoolError::Exhausted { pool: "test", capacity }));

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*pool.get(*handle).unwrap(), i * 10);
        }
    }

    #[test]
    fn test_freed_handle_is_stale() {
        let mut pool: ResourcePool<u32, u32> = ResourcePool::new("test", 1);
        let old = pool.create(1, || ok(1)).unwrap();
        assert_eq!(pool.free(old), Ok(1));
        assert!(pool.get(old).is_err());
        assert!(pool.free(old).is_err());
        assert_eq!(pool.handle_for(&1), None);

        let new = pool.create(2, || ok(2)).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new, old);
        assert!(pool.get(old).is_err());
        assert_eq!(*pool.get(new).unwrap(), 2);
    }

    #[test]
    fn test_failed_constructor_returns_slot() {
        let mut pool: ResourcePool<u32, u32> = ResourcePool::new("test", 1);
        let failed: Result<_, PoolError> = pool.create(1, || {
            Err(PoolError::InvalidHandle {
                pool: "test",
                handle: ResourceHandle::INVALID,
            })
        });
        assert!(failed.is_err());
        assert!(pool.is_empty());
        assert!(pool.handle_for(&1).is_none());
        assert!(pool.create(2, || ok(2)).is_ok());
    }

    #[test]
    fn test_invalid_sentinel_rejected() {
        let pool: ResourcePool<u32, u32> = ResourcePool::new("test", 2);
        assert!(!ResourceHandle::INVALID.is_valid());
        assert!(pool.get(ResourceHandle::INVALID).is_err());
    }

    #[test]
    fn test_random_create_free_never_aliases_live_slots() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut pool: ResourcePool<u64, u64> = ResourcePool::new("test", 16);
        let mut live: Vec<(ResourceHandle, u64)> = Vec::new();
        let mut next_key = 0u64;

        for _ in 0..2000 {
            if live.is_empty() || (rng.gen_bool(0.55) && live.len() < pool.capacity()) {
                let key = next_key;
                next_key += 1;
                let handle = pool.create(key, || ok(key)).unwrap();
                live.push((handle, key));
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                assert_eq!(pool.free(victim.0), Ok(victim.1));
                assert!(pool.get(victim.0).is_err());
            }

            let slots: HashSet<u32> = live.iter().map(|(handle, _)| handle.index()).collect();
            assert_eq!(slots.len(), live.len());
            assert_eq!(pool.len(), live.len());
            for (handle, key) in &live {
                assert_eq!(pool.get(*handle), Ok(key));
            }
        }
    }

    #[test]
    fn test_drain_empties_pool() {
        let mut pool: ResourcePool<u32, u32> = ResourcePool::new("test", 4);
        for i in 0..3 {
            pool.create(i, || ok(i)).unwrap();
        }
        let mut drained = pool.drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(pool.is_empty());
        assert_eq!(pool.iter().count(), 0);
    }
}
