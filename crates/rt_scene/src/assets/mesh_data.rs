//! CPU-side mesh data

use bytemuck::{Pod, Zeroable};
use crate::assets::AssetError;
use crate::assets::tangents::generate_tangents;

/// Interleaved vertex as stored in device memory
///
/// Position comes first so acceleration-structure builds can read it with the
/// vertex stride as a plain `R32G32B32_SFLOAT` stream.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Position in object space
    pub position: [f32; 3],
    /// Normal vector
    pub normal: [f32; 3],
    /// Texture coordinates
    pub tex_coord: [f32; 2],
    /// Tangent with handedness in `w`
    pub tangent: [f32; 4],
}

impl Vertex {
    /// Size in bytes, used as the vertex stride
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    /// Create a vertex without a tangent
    pub const fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coord,
            tangent: [0.0; 4],
        }
    }
}

/// A draw range inside a mesh's vertex and index buffers
///
/// Index values are relative to `base_vertex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimitiveRange {
    /// First vertex of the range
    pub base_vertex: u32,
    /// Number of vertices
    pub vertex_count: u32,
    /// First index of the range
    pub base_index: u32,
    /// Number of indices, a multiple of 3
    pub index_count: u32,
}

/// A primitive as imported, with its material by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimitiveData {
    /// Draw range
    pub range: PrimitiveRange,
    /// Material name from the source asset, `None` for the default material
    pub material: Option<String>,
}

/// Geometry of one mesh
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    /// Interleaved vertices of every primitive
    pub vertices: Vec<Vertex>,
    /// 32-bit indices of every primitive
    pub indices: Vec<u32>,
    /// Primitive ranges
    pub primitives: Vec<PrimitiveData>,
    /// Whether `vertices` already carry tangents
    pub has_tangents: bool,
}

impl MeshData {
    /// A mesh with a single primitive covering everything
    pub fn single(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        let range = PrimitiveRange {
            base_vertex: 0,
            vertex_count: vertices.len() as u32,
            base_index: 0,
            index_count: indices.len() as u32,
        };
        Self {
            vertices,
            indices,
            primitives: vec![PrimitiveData { range, material: None }],
            has_tangents: false,
        }
    }

    /// Check ranges and indices
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.primitives.is_empty() {
            return Err(AssetError::InvalidMesh("mesh has no primitives".to_string()));
        }
        for (i, primitive) in self.primitives.iter().enumerate() {
            let range = primitive.range;
            if range.index_count == 0 || range.index_count % 3 != 0 {
                return Err(AssetError::InvalidMesh(format!(
                    "primitive {i}: index count {} is not a positive multiple of 3",
                    range.index_count
                )));
            }
            let vertex_end = range.base_vertex as usize + range.vertex_count as usize;
            let index_end = range.base_index as usize + range.index_count as usize;
            if vertex_end > self.vertices.len() || index_end > self.indices.len() {
                return Err(AssetError::InvalidMesh(format!("primitive {i}: range {range:?} out of bounds")));
            }
            let indices = &self.indices[range.base_index as usize..index_end];
            if let Some(bad) = indices.iter().find(|&&index| index >= range.vertex_count) {
                return Err(AssetError::InvalidMesh(format!(
                    "primitive {i}: index {bad} exceeds vertex count {}",
                    range.vertex_count
                )));
            }
        }
        Ok(())
    }

    /// Generate tangents if the source did not provide them
    pub fn ensure_tangents(&mut self) {
        if !self.has_tangents {
            generate_tangents(self);
            self.has_tangents = true;
        }
    }

    /// Primitive ranges without material names
    pub fn ranges(&self) -> Vec<PrimitiveRange> {
        self.primitives.iter().map(|primitive| primitive.range).collect()
    }

    /// Total triangle count
    pub fn triangle_count(&self) -> usize {
        self.primitives.iter().map(|primitive| primitive.range.index_count as usize / 3).sum()
    }

    /// A single triangle in the XY plane facing +Z
    pub fn triangle() -> Self {
        let normal = [0.0, 0.0, 1.0];
        Self::single(
            vec![
                Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 0.0]),
                Vertex::new([0.0, 0.5, 0.0], normal, [0.5, 1.0]),
            ],
            vec![0, 1, 2],
        )
    }

    /// Unit cube centered at the origin with per-face normals
    pub fn cube() -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        let corners = [(-1.0, -1.0, [0.0, 0.0]), (1.0, -1.0, [1.0, 0.0]), (1.0, 1.0, [1.0, 1.0]), (-1.0, 1.0, [0.0, 1.0])];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let base = vertices.len() as u32;
            for (su, sv, uv) in corners {
                let position = [
                    0.5 * (normal[0] + su * u[0] + sv * v[0]),
                    0.5 * (normal[1] + su * u[1] + sv * v[1]),
                    0.5 * (normal[2] + su * u[2] + sv * v[2]),
                ];
                vertices.push(Vertex::new(position, normal, uv));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self::single(vertices, indices)
    }
}
