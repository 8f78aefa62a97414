//! Asset import
//!
//! Produces CPU-side mesh and image data for the resource manager. Nothing in
//! this module touches the device.

pub mod image_loader;
pub mod mesh_data;
pub mod obj_loader;
pub mod tangents;

pub use image_loader::ImageData;
pub use mesh_data::{MeshData, PrimitiveData, PrimitiveRange, Vertex};
pub use obj_loader::ObjLoader;

use thiserror::Error;

/// Asset import errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed source text
    #[error("Parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What went wrong
        message: String,
    },

    /// Mesh data violates a structural rule
    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    /// Image decoding failed
    #[error("Image error: {0}")]
    Image(String),
}
