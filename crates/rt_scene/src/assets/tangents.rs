//! Tangent-space generation
//!
//! Per-triangle tangents and bitangents are accumulated on the triangle's
//! vertices, then each vertex tangent is Gram-Schmidt orthonormalised against
//! its normal and given a handedness sign in `w`. The result depends only on
//! the input order, so repeated imports produce identical buffers.

use nalgebra::Vector3;
use crate::assets::mesh_data::MeshData;

/// Smallest UV-space determinant treated as non-degenerate
const UV_EPSILON: f32 = 1e-8;

/// Fill `tangent` for every vertex of every primitive
pub fn generate_tangents(mesh: &mut MeshData) {
    let mut tangents = vec![Vector3::<f32>::zeros(); mesh.vertices.len()];
    let mut bitangents = vec![Vector3::<f32>::zeros(); mesh.vertices.len()];

    for primitive in &mesh.primitives {
        let range = primitive.range;
        let base = range.base_vertex as usize;
        let start = range.base_index as usize;
        let end = (start + range.index_count as usize).min(mesh.indices.len());

        for triangle in mesh.indices[start..end].chunks_exact(3) {
            let ids = [
                base + triangle[0] as usize,
                base + triangle[1] as usize,
                base + triangle[2] as usize,
            ];
            if ids.iter().any(|&id| id >= mesh.vertices.len()) {
                continue;
            }
            let [v0, v1, v2] = ids.map(|id| mesh.vertices[id]);

            let e1 = Vector3::from(v1.position) - Vector3::from(v0.position);
            let e2 = Vector3::from(v2.position) - Vector3::from(v0.position);
            let duv1 = [v1.tex_coord[0] - v0.tex_coord[0], v1.tex_coord[1] - v0.tex_coord[1]];
            let duv2 = [v2.tex_coord[0] - v0.tex_coord[0], v2.tex_coord[1] - v0.tex_coord[1]];

            let det = duv1[0] * duv2[1] - duv2[0] * duv1[1];
            if det.abs() < UV_EPSILON {
                continue;
            }
            let r = 1.0 / det;
            let tangent = (e1 * duv2[1] - e2 * duv1[1]) * r;
            let bitangent = (e2 * duv1[0] - e1 * duv2[0]) * r;

            for id in ids {
                tangents[id] += tangent;
                bitangents[id] += bitangent;
            }
        }
    }

    for (i, vertex) in mesh.vertices.iter_mut().enumerate() {
        let n = Vector3::from(vertex.normal);
        let t = tangents[i] - n * n.dot(&tangents[i]);

        let tangent = if t.norm_squared() > f32::EPSILON {
            t.normalize()
        } else {
            fallback_tangent(&n)
        };
        let handedness = if n.cross(&tangent).dot(&bitangents[i]) < 0.0 { -1.0 } else { 1.0 };

        vertex.tangent = [tangent.x, tangent.y, tangent.z, handedness];
    }
}

/// Any unit vector perpendicular to `n`, for vertices without usable UVs
fn fallback_tangent(n: &Vector3<f32>) -> Vector3<f32> {
    let axis = if n.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
    let t = axis - n * n.dot(&axis);
    if t.norm_squared() > f32::EPSILON {
        t.normalize()
    } else {
        Vector3::x()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_planar_triangle_tangent_follows_u() {
        let mut mesh = MeshData::triangle();
        generate_tangents(&mut mesh);
        for vertex in &mesh.vertices {
            assert_relative_eq!(vertex.tangent[0], 1.0, epsilon = 1e-5);
            assert_relative_eq!(vertex.tangent[1], 0.0, epsilon = 1e-5);
            assert_relative_eq!(vertex.tangent[2], 0.0, epsilon = 1e-5);
            assert_eq!(vertex.tangent[3], 1.0);
        }
    }

    #[test]
    fn test_mirrored_uvs_flip_handedness() {
        let mut mesh = MeshData::triangle();
        for vertex in &mut mesh.vertices {
            vertex.tex_coord[1] = 1.0 - vertex.tex_coord[1];
        }
        generate_tangents(&mut mesh);
        assert_eq!(mesh.vertices[0].tangent[3], -1.0);
    }

    #[test]
    fn test_tangents_are_unit_and_orthogonal() {
        let mut mesh = MeshData::cube();
        mesh.ensure_tangents();
        for vertex in &mesh.vertices {
            let t = Vector3::new(vertex.tangent[0], vertex.tangent[1], vertex.tangent[2]);
            let n = Vector3::from(vertex.normal);
            assert_relative_eq!(t.norm(), 1.0, epsilon = 1e-5);
            assert_relative_eq!(t.dot(&n), 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_degenerate_uvs_use_fallback() {
        let mut mesh = MeshData::triangle();
        for vertex in &mut mesh.vertices {
            vertex.tex_coord = [0.0, 0.0];
        }
        generate_tangents(&mut mesh);
        let t = Vector3::new(mesh.vertices[0].tangent[0], mesh.vertices[0].tangent[1], mesh.vertices[0].tangent[2]);
        assert_relative_eq!(t.norm(), 1.0, epsilon = 1e-5);
    }
}
