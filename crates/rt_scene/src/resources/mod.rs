//! Device resources
//!
//! Meshes, materials and textures live in fixed-capacity pools and are named
//! by generation-checked [`ResourceHandle`]s.

pub mod handle;
pub mod manager;
pub mod material;
pub mod mesh;
pub mod pool;
pub mod texture;

pub use handle::ResourceHandle;
pub use manager::ResourceManager;
pub use material::{Material, MaterialDesc, MaterialFactors};
pub use mesh::{Mesh, Primitive};
pub use pool::{PoolError, ResourcePool};
pub use texture::{DefaultTextures, Texture, TextureKey, TextureType};
