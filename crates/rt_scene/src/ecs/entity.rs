//! Entity implementation

use std::fmt;

/// Entity identifier
///
/// Ids are recycled after despawn; the generation tells a recycled id apart
/// from the entity that held it before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    id: u32,
    generation: u32,
}

impl Entity {
    /// Create a new entity with the given ID
    pub(super) const fn new(id: u32, generation: u32) -> Self {
        Self { id, generation }
    }

    /// Get the entity ID (the sparse-set index)
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Generation of the id when the entity was spawned
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.id, self.generation)
    }
}
