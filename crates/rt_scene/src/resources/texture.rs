//! Device textures and the built-in fallbacks

use std::path::PathBuf;
use ash::vk;
use crate::assets::ImageData;
use crate::render::allocator::GpuAllocator;
use crate::render::device::{GpuImage, ImageDesc};
use crate::render::vulkan::VulkanResult;
use crate::resources::handle::ResourceHandle;

/// Material texture slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    /// Base color/albedo texture
    BaseColor,
    /// Tangent-space normal map
    Normal,
    /// Metallic in B, roughness in G
    MetallicRoughness,
    /// Ambient occlusion in R
    Occlusion,
    /// Emission texture
    Emissive,
}

impl TextureType {
    /// Every slot, in material record order
    pub const ALL: [Self; 5] = [
        Self::BaseColor,
        Self::Normal,
        Self::MetallicRoughness,
        Self::Occlusion,
        Self::Emissive,
    ];

    /// Position in [`TextureType::ALL`]
    pub const fn slot(self) -> usize {
        match self {
            Self::BaseColor => 0,
            Self::Normal => 1,
            Self::MetallicRoughness => 2,
            Self::Occlusion => 3,
            Self::Emissive => 4,
        }
    }

    /// Texel of the 1x1 fallback texture
    pub const fn fallback_texel(self) -> [u8; 4] {
        match self {
            Self::BaseColor | Self::Occlusion => [255, 255, 255, 255],
            Self::Normal => [128, 128, 255, 255],
            // Roughness 1, metallic 0; factors scale from there.
            Self::MetallicRoughness => [0, 255, 0, 255],
            Self::Emissive => [0, 0, 0, 255],
        }
    }

    /// Color data is stored in sRGB, everything else is linear
    pub const fn format(self) -> vk::Format {
        match self {
            Self::BaseColor | Self::Emissive => vk::Format::R8G8B8A8_SRGB,
            _ => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// Deduplication key of the texture pool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextureKey {
    /// Built-in 1x1 fallback
    Fallback(TextureType),
    /// Image file, keyed by path as given
    File(PathBuf),
    /// Caller-provided image
    Named(String),
}

/// A sampled device image
#[derive(Debug)]
pub struct Texture {
    image: GpuImage,
}

impl Texture {
    /// Upload decoded RGBA8 pixels
    pub fn upload(allocator: &GpuAllocator, image: &ImageData, format: vk::Format) -> VulkanResult<Self> {
        let desc = ImageDesc::texture(image.width, image.height, format);
        let image = allocator.create_image_with_data(&desc, &image.data)?;
        Ok(Self { image })
    }

    /// Device image
    pub fn image(&self) -> &GpuImage {
        &self.image
    }

    /// Release the image
    pub fn destroy(self, allocator: &GpuAllocator) {
        allocator.destroy_image(self.image);
    }
}

/// Pool handles of the fallback textures, one per [`TextureType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTextures {
    handles: [ResourceHandle; 5],
}

impl DefaultTextures {
    pub(crate) const fn new(handles: [ResourceHandle; 5]) -> Self {
        Self { handles }
    }

    /// Fallback for one slot
    pub const fn get(&self, kind: TextureType) -> ResourceHandle {
        self.handles[kind.slot()]
    }

    /// Whether `handle` is one of the fallbacks
    pub fn contains(&self, handle: ResourceHandle) -> bool {
        self.handles.contains(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_follow_all_order() {
        for (i, kind) in TextureType::ALL.iter().enumerate() {
            assert_eq!(kind.slot(), i);
        }
    }

    #[test]
    fn test_flat_normal_points_up_the_z_axis() {
        let texel = TextureType::Normal.fallback_texel();
        assert_eq!(texel[2], 255);
        assert_eq!(texel[0], texel[1]);
    }
}
