//! OBJ file loader for 3D models
//!
//! Faces are fan-triangulated and grouped into one primitive per `usemtl`
//! material, in order of first use. Each primitive gets its own contiguous
//! vertex range; vertices are shared within a primitive when they reference
//! the same position/texcoord/normal triple.

use std::collections::HashMap;
use std::path::Path;
use crate::assets::mesh_data::{MeshData, PrimitiveData, PrimitiveRange, Vertex};
use crate::assets::AssetError;

type VertexKey = (usize, Option<usize>, Option<usize>);

#[derive(Default)]
struct Group {
    material: Option<String>,
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    lookup: HashMap<VertexKey, u32>,
}

/// Wavefront OBJ importer
pub struct ObjLoader;

impl ObjLoader {
    /// Load an OBJ file
    pub fn load_obj<P: AsRef<Path>>(path: P) -> Result<MeshData, AssetError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mesh = Self::parse(&text)?;
        log::info!(
            "Loaded {}: {} vertices, {} triangles, {} primitives",
            path.display(),
            mesh.vertices.len(),
            mesh.triangle_count(),
            mesh.primitives.len()
        );
        Ok(mesh)
    }

    /// Parse OBJ text
    pub fn parse(text: &str) -> Result<MeshData, AssetError> {
        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut normals: Vec<[f32; 3]> = Vec::new();
        let mut tex_coords: Vec<[f32; 2]> = Vec::new();
        let mut groups: Vec<Group> = vec![Group::default()];
        let mut current = 0;

        for (number, line) in text.lines().enumerate() {
            let line_no = number + 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let Some(keyword) = parts.next() else { continue };
            let args: Vec<&str> = parts.collect();

            match keyword {
                "v" => positions.push(parse_floats::<3>(&args, line_no, "vertex")?),
                "vn" => normals.push(parse_floats::<3>(&args, line_no, "normal")?),
                "vt" => tex_coords.push(parse_floats::<2>(&args, line_no, "texture coordinate")?),
                "usemtl" => {
                    let name = args.first().map(|name| (*name).to_string());
                    current = match groups.iter().position(|group| group.material == name) {
                        Some(index) => index,
                        None => {
                            groups.push(Group {
                                material: name,
                                ..Group::default()
                            });
                            groups.len() - 1
                        }
                    };
                }
                "f" => {
                    if args.len() < 3 {
                        return Err(parse_error(line_no, "face needs at least 3 vertices"));
                    }
                    let group = &mut groups[current];
                    let mut face = Vec::with_capacity(args.len());
                    for corner in &args {
                        let key = parse_corner(corner, line_no, positions.len(), tex_coords.len(), normals.len())?;
                        let index = match group.lookup.get(&key) {
                            Some(&index) => index,
                            None => {
                                let (p, t, n) = key;
                                let vertex = Vertex::new(
                                    positions[p],
                                    n.map_or([0.0, 1.0, 0.0], |n| normals[n]),
                                    t.map_or([0.0, 0.0], |t| tex_coords[t]),
                                );
                                let index = group.vertices.len() as u32;
                                group.vertices.push(vertex);
                                group.lookup.insert(key, index);
                                index
                            }
                        };
                        face.push(index);
                    }
                    for i in 1..face.len() - 1 {
                        group.indices.extend_from_slice(&[face[0], face[i], face[i + 1]]);
                    }
                }
                _ => {}
            }
        }

        let mut mesh = MeshData::default();
        for group in groups.into_iter().filter(|group| !group.indices.is_empty()) {
            let range = PrimitiveRange {
                base_vertex: mesh.vertices.len() as u32,
                vertex_count: group.vertices.len() as u32,
                base_index: mesh.indices.len() as u32,
                index_count: group.indices.len() as u32,
            };
            mesh.vertices.extend(group.vertices);
            mesh.indices.extend(group.indices);
            mesh.primitives.push(PrimitiveData {
                range,
                material: group.material,
            });
        }

        if mesh.primitives.is_empty() {
            return Err(AssetError::InvalidMesh("No faces found in OBJ file".to_string()));
        }
        mesh.validate()?;
        Ok(mesh)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> AssetError {
    AssetError::Parse {
        line,
        message: message.into(),
    }
}

fn parse_floats<const N: usize>(args: &[&str], line: usize, what: &str) -> Result<[f32; N], AssetError> {
    if args.len() < N {
        return Err(parse_error(line, format!("{what} needs {N} components")));
    }
    let mut out = [0.0; N];
    for (slot, arg) in out.iter_mut().zip(args) {
        *slot = arg
            .parse()
            .map_err(|_| parse_error(line, format!("invalid {what} component '{arg}'")))?;
    }
    Ok(out)
}

/// Resolve a 1-based or negative (relative) OBJ index
fn resolve_index(raw: &str, count: usize, line: usize) -> Result<usize, AssetError> {
    let value: i64 = raw
        .parse()
        .map_err(|_| parse_error(line, format!("invalid index '{raw}'")))?;
    let resolved = match value {
        v if v > 0 => v - 1,
        v if v < 0 => count as i64 + v,
        _ => -1,
    };
    usize::try_from(resolved)
        .ok()
        .filter(|&index| index < count)
        .ok_or_else(|| parse_error(line, format!("index {value} out of range (have {count})")))
}

fn parse_corner(
    corner: &str,
    line: usize,
    positions: usize,
    tex_coords: usize,
    normals: usize,
) -> Result<VertexKey, AssetError> {
    let mut fields = corner.split('/');
    let position = resolve_index(fields.next().unwrap_or(""), positions, line)?;
    let tex_coord = match fields.next() {
        Some(raw) if !raw.is_empty() => Some(resolve_index(raw, tex_coords, line)?),
        _ => None,
    };
    let normal = match fields.next() {
        Some(raw) if !raw.is_empty() => Some(resolve_index(raw, normals, line)?),
        _ => None,
    };
    Ok((position, tex_coord, normal))
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD_AND_TRIANGLE: &str = "
        # two materials
        v 0 0 0
        v 1 0 0
        v 1 1 0
        v 0 1 0
        vt 0 0
        vt 1 0
        vt 1 1
        vt 0 1
        vn 0 0 1
        usemtl red
        f 1/1/1 2/2/1 3/3/1 4/4/1
        usemtl blue
        f -4/1/1 -2/3/1 -1/4/1
    ";

    #[test]
    fn test_groups_faces_per_material() {
        let mesh = ObjLoader::parse(QUAD_AND_TRIANGLE).unwrap();
        assert_eq!(mesh.primitives.len(), 2);

        let red = &mesh.primitives[0];
        assert_eq!(red.material.as_deref(), Some("red"));
        assert_eq!(red.range, PrimitiveRange { base_vertex: 0, vertex_count: 4, base_index: 0, index_count: 6 });

        let blue = &mesh.primitives[1];
        assert_eq!(blue.material.as_deref(), Some("blue"));
        assert_eq!(blue.range.base_vertex, 4);
        assert_eq!(blue.range.base_index, 6);
        // Indices are relative to the primitive's base vertex.
        assert_eq!(&mesh.indices[6..9], &[0, 1, 2]);
        assert_eq!(mesh.vertices[4].position, [0.0, 0.0, 0.0]);
        assert_eq!(mesh.vertices[6].position, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_fan_triangulation_and_vertex_sharing() {
        let mesh = ObjLoader::parse(QUAD_AND_TRIANGLE).unwrap();
        assert_eq!(&mesh.indices[0..6], &[0, 1, 2, 0, 2, 3]);
        assert!(!mesh.has_tangents);
    }

    #[test]
    fn test_faces_without_material_use_default() {
        let mesh = ObjLoader::parse("v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").unwrap();
        assert_eq!(mesh.primitives.len(), 1);
        assert_eq!(mesh.primitives[0].material, None);
        assert_eq!(mesh.vertices[0].normal, [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_errors_report_line() {
        let err = ObjLoader::parse("v 0 0 0\nf 1 2 3\n").unwrap_err();
        assert!(matches!(err, AssetError::Parse { line: 2, .. }));

        let err = ObjLoader::parse("v 0 zero 0\n").unwrap_err();
        assert!(matches!(err, AssetError::Parse { line: 1, .. }));

        assert!(matches!(ObjLoader::parse("v 0 0 0\n"), Err(AssetError::InvalidMesh(_))));
    }
}
