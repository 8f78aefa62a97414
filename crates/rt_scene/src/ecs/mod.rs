//! Entity-component store
//!
//! Components live in one typed sparse set per component kind. Queries over
//! two kinds are explicit intersections of two sets.

pub mod component;
pub mod components;
pub mod entity;
pub mod storage;
pub mod world;

pub use component::Component;
pub use entity::Entity;
pub use storage::SparseSet;
pub use world::World;
