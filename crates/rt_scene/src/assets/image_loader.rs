//! Image decoding for texture data

use std::path::Path;
use crate::assets::AssetError;

/// Decoded RGBA8 image ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    /// Tightly packed RGBA pixels, row by row
    pub data: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl ImageData {
    /// Decode an image file into RGBA8
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AssetError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|e| AssetError::Image(format!("Failed to load {}: {e}", path.display())))?;
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        log::debug!("Loaded image {width}x{height} from {}", path.display());
        Ok(Self {
            data: rgba.into_raw(),
            width,
            height,
        })
    }

    /// Decode an encoded image held in memory
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AssetError> {
        let rgba = image::load_from_memory(bytes)
            .map_err(|e| AssetError::Image(format!("Failed to decode image: {e}")))?
            .to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            data: rgba.into_raw(),
            width,
            height,
        })
    }

    /// A solid-colour image
    pub fn solid_color(width: u32, height: u32, color: [u8; 4]) -> Self {
        let data = color.repeat(width as usize * height as usize);
        Self { data, width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_round_trip_through_decoder() {
        let mut encoded = Vec::new();
        let source = image::RgbaImage::from_raw(2, 1, vec![255, 0, 0, 255, 0, 0, 255, 128]).unwrap();
        source
            .write_to(&mut std::io::Cursor::new(&mut encoded), image::ImageFormat::Png)
            .unwrap();

        let decoded = ImageData::from_bytes(&encoded).unwrap();
        assert_eq!((decoded.width, decoded.height), (2, 1));
        assert_eq!(decoded.data, source.into_raw());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(ImageData::from_bytes(&[1, 2, 3]), Err(AssetError::Image(_))));
    }

    #[test]
    fn test_solid_color() {
        let image = ImageData::solid_color(2, 2, [1, 2, 3, 4]);
        assert_eq!(image.data.len(), 16);
        assert_eq!(&image.data[12..], &[1, 2, 3, 4]);
    }
}
