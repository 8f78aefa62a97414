//! Local and world transform components

use crate::ecs::Component;
use crate::foundation::math::{compose_trs, Mat4, Quat, Vec3};

/// Node transform relative to its parent
///
/// The composed matrix is cached. Every setter marks the transform dirty;
/// propagation recomposes it and clears the flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTransform {
    translation: Vec3,
    rotation: Quat,
    scale: Vec3,
    matrix: Mat4,
    dirty: bool,
}

impl Component for LocalTransform {}

impl Default for LocalTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl LocalTransform {
    /// Identity transform
    pub fn identity() -> Self {
        Self::from_trs(Vec3::zeros(), Quat::identity(), Vec3::new(1.0, 1.0, 1.0))
    }

    /// Create from translation only
    pub fn from_translation(translation: Vec3) -> Self {
        Self::from_trs(translation, Quat::identity(), Vec3::new(1.0, 1.0, 1.0))
    }

    /// Create from translation, rotation and scale
    ///
    /// New transforms start dirty so the first propagation composes them.
    pub fn from_trs(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
            matrix: compose_trs(&translation, &rotation, &scale),
            dirty: true,
        }
    }

    /// Builder: set translation
    pub fn with_translation(mut self, translation: Vec3) -> Self {
        self.set_translation(translation);
        self
    }

    /// Builder: set rotation
    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.set_rotation(rotation);
        self
    }

    /// Builder: set scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.set_scale(scale);
        self
    }

    pub fn translation(&self) -> &Vec3 {
        &self.translation
    }

    pub fn rotation(&self) -> &Quat {
        &self.rotation
    }

    pub fn scale(&self) -> &Vec3 {
        &self.scale
    }

    pub fn set_translation(&mut self, translation: Vec3) {
        self.translation = translation;
        self.dirty = true;
    }

    pub fn set_rotation(&mut self, rotation: Quat) {
        self.rotation = rotation;
        self.dirty = true;
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
        self.dirty = true;
    }

    /// Whether the cached matrix is out of date
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force recomposition on the next propagation
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Cached local matrix; stale while [`is_dirty`](Self::is_dirty) is true
    pub fn matrix(&self) -> &Mat4 {
        &self.matrix
    }

    /// Recompose the cached matrix when dirty
    ///
    /// Returns true if a recomposition happened.
    pub fn recompose(&mut self) -> bool {
        if !self.dirty {
            return false;
        }
        self.matrix = compose_trs(&self.translation, &self.rotation, &self.scale);
        self.dirty = false;
        true
    }
}

/// Composed parent-to-world matrix of a node
#[derive(Debug, Clone, PartialEq)]
pub struct WorldTransform {
    pub matrix: Mat4,
}

impl Component for WorldTransform {}

impl Default for WorldTransform {
    fn default() -> Self {
        Self { matrix: Mat4::identity() }
    }
}

impl WorldTransform {
    /// World-space translation
    pub fn translation(&self) -> Vec3 {
        self.matrix.fixed_view::<3, 1>(0, 3).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_setters_mark_dirty() {
        let mut local = LocalTransform::identity();
        assert!(local.recompose());
        assert!(!local.is_dirty());
        assert!(!local.recompose());

        local.set_translation(Vec3::new(1.0, 2.0, 3.0));
        assert!(local.is_dirty());
        local.recompose();
        assert_relative_eq!(local.matrix()[(0, 3)], 1.0);
        assert_relative_eq!(local.matrix()[(2, 3)], 3.0);
    }

    #[test]
    fn test_builder_composes() {
        let mut local = LocalTransform::identity()
            .with_scale(Vec3::new(2.0, 2.0, 2.0))
            .with_translation(Vec3::new(0.0, 1.0, 0.0));
        local.recompose();
        let world = WorldTransform { matrix: *local.matrix() };
        assert_relative_eq!(world.translation(), Vec3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(local.matrix()[(0, 0)], 2.0);
    }
}
