//! Materials
//!
//! A material is a set of scalar factors plus one texture handle per
//! [`TextureType`]. Slots without a source texture point at the built-in
//! fallbacks, so a live material never carries an unset texture.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use crate::resources::handle::ResourceHandle;
use crate::resources::texture::{DefaultTextures, TextureType};

/// Scalar material parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialFactors {
    /// Linear RGBA multiplier of the base color texture
    pub base_color: [f32; 4],
    /// Metallic multiplier
    pub metallic: f32,
    /// Roughness multiplier
    pub roughness: f32,
    /// Normal map strength
    pub normal_scale: f32,
    /// Occlusion strength
    pub occlusion_strength: f32,
    /// Linear RGB multiplier of the emissive texture
    pub emissive: [f32; 3],
}

impl Default for MaterialFactors {
    fn default() -> Self {
        Self {
            base_color: [1.0, 1.0, 1.0, 1.0],
            metallic: 0.0,
            roughness: 0.5,
            normal_scale: 1.0,
            occlusion_strength: 1.0,
            emissive: [0.0, 0.0, 0.0],
        }
    }
}

/// Material description as authored; loadable from config files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialDesc {
    /// Scalar factors
    pub factors: MaterialFactors,
    /// Base color image
    pub base_color_texture: Option<PathBuf>,
    /// Normal map image
    pub normal_texture: Option<PathBuf>,
    /// Metallic-roughness image
    pub metallic_roughness_texture: Option<PathBuf>,
    /// Occlusion image
    pub occlusion_texture: Option<PathBuf>,
    /// Emissive image
    pub emissive_texture: Option<PathBuf>,
}

impl MaterialDesc {
    /// Builder: set the base color factor
    pub fn with_base_color(mut self, rgba: [f32; 4]) -> Self {
        self.factors.base_color = rgba;
        self
    }

    /// Builder: set metallic and roughness factors
    pub fn with_metallic_roughness(mut self, metallic: f32, roughness: f32) -> Self {
        self.factors.metallic = metallic;
        self.factors.roughness = roughness;
        self
    }

    /// Source image of one slot
    pub fn texture_path(&self, kind: TextureType) -> Option<&PathBuf> {
        match kind {
            TextureType::BaseColor => self.base_color_texture.as_ref(),
            TextureType::Normal => self.normal_texture.as_ref(),
            TextureType::MetallicRoughness => self.metallic_roughness_texture.as_ref(),
            TextureType::Occlusion => self.occlusion_texture.as_ref(),
            TextureType::Emissive => self.emissive_texture.as_ref(),
        }
    }
}

/// A live material
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    factors: MaterialFactors,
    textures: [ResourceHandle; 5],
}

impl Material {
    pub(crate) const fn new(factors: MaterialFactors, textures: [ResourceHandle; 5]) -> Self {
        Self { factors, textures }
    }

    /// Material using only the fallback textures
    pub fn with_defaults(factors: MaterialFactors, defaults: &DefaultTextures) -> Self {
        Self::new(factors, TextureType::ALL.map(|kind| defaults.get(kind)))
    }

    pub fn factors(&self) -> &MaterialFactors {
        &self.factors
    }

    /// Texture bound to one slot
    pub fn texture(&self, kind: TextureType) -> ResourceHandle {
        self.textures[kind.slot()]
    }

    /// Textures in [`TextureType::ALL`] order
    pub fn textures(&self) -> &[ResourceHandle; 5] {
        &self.textures
    }

    /// Whether any slot refers to `texture`
    pub fn uses_texture(&self, texture: ResourceHandle) -> bool {
        self.textures.contains(&texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_parses_from_ron() {
        let desc: MaterialDesc = ron::from_str(
            r#"(factors: (metallic: 1.0), base_color_texture: Some("albedo.png"))"#,
        )
        .unwrap();
        assert_eq!(desc.factors.metallic, 1.0);
        assert_eq!(desc.factors.roughness, 0.5);
        assert_eq!(
            desc.texture_path(TextureType::BaseColor),
            Some(&PathBuf::from("albedo.png"))
        );
        assert!(desc.texture_path(TextureType::Normal).is_none());
    }

    #[test]
    fn test_defaults_fill_every_slot() {
        let handles = [0, 1, 2, 3, 4].map(|i| ResourceHandle::new(i, 0));
        let defaults = DefaultTextures::new(handles);
        let material = Material::with_defaults(MaterialFactors::default(), &defaults);
        for kind in TextureType::ALL {
            assert_eq!(material.texture(kind), defaults.get(kind));
        }
        assert!(material.uses_texture(handles[3]));
    }
}
