//! Render-related components

use crate::ecs::Component;
use crate::resources::ResourceHandle;

/// Mesh instance of a node
///
/// Every node with a render component and a world transform becomes one
/// top-level instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderComponent {
    pub mesh: ResourceHandle,
}

impl Component for RenderComponent {}

/// Debug name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name(pub String);

impl Component for Name {}
