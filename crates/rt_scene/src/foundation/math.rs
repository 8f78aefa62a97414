//! Math utilities and types
//!
//! Matrices are column-major `nalgebra` matrices; `(row, col)` indexing is used
//! whenever a row-major layout has to be produced for the device.

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix3, Matrix4,
    Quaternion,
    Unit,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Compose a local matrix in translate · rotate · scale order
pub fn compose_trs(translation: &Vec3, rotation: &Quat, scale: &Vec3) -> Mat4 {
    Mat4::new_translation(translation)
        * rotation.to_homogeneous()
        * Mat4::new_nonuniform_scaling(scale)
}

/// Convert a column-major 4x4 matrix into the row-major 3x4 layout used by
/// acceleration-structure instances (the bottom row is dropped)
pub fn to_row_major_3x4(matrix: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = matrix[(row, col)];
        }
    }
    out
}

/// Row-major 3x4 identity
pub const IDENTITY_3X4: [f32; 12] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
];

/// Round `value` up to the next multiple of `alignment` (power of two or zero)
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}

/// Math utility functions
pub mod utils {
    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees.to_radians()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trs_order_applies_scale_first() {
        let m = compose_trs(
            &Vec3::new(1.0, 0.0, 0.0),
            &Quat::from_axis_angle(&Vec3::z_axis(), std::f32::consts::FRAC_PI_2),
            &Vec3::new(2.0, 2.0, 2.0),
        );
        let p = m.transform_point(&nalgebra::Point3::new(1.0, 0.0, 0.0));
        // scale to (2,0,0), rotate to (0,2,0), translate to (1,2,0)
        assert_relative_eq!(p, nalgebra::Point3::new(1.0, 2.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn test_row_major_export_keeps_translation_in_last_column() {
        let m = Mat4::new_translation(&Vec3::new(3.0, 4.0, 5.0));
        let rows = to_row_major_3x4(&m);
        assert_eq!(rows[3], 3.0);
        assert_eq!(rows[7], 4.0);
        assert_eq!(rows[11], 5.0);
        assert_eq!(to_row_major_3x4(&Mat4::identity()), IDENTITY_3X4);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(300, 0), 300);
    }
}
