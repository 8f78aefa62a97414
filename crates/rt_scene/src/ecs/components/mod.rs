//! Scene components

pub mod hierarchy;
pub mod render;
pub mod transform;

pub use hierarchy::SceneGraphNode;
pub use render::{Name, RenderComponent};
pub use transform::{LocalTransform, WorldTransform};
