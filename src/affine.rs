//! 3D affine transforms and the bounding box geometry derived from them.
//!
//! Transforms map raw view coordinates (voxels, z in slice units) into the shared reference
//! frame. Composition follows the usual convention: `a.concatenate(&b)` applies `b` first.

use crate::error::{Result, SpimError};
use crate::math_tools::make_odd;
use nalgebra::{Matrix4, Point3, Vector3};

/// Affine transform `p' = A p + t` stored as a homogeneous 4x4 matrix with the bottom row
/// fixed to `0 0 0 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform3D {
    matrix: Matrix4<f64>,
}

impl Default for AffineTransform3D {
    fn default() -> Self {
        Self::identity()
    }
}

/// Axis aligned box spanned by transformed corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    pub fn span(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Smallest box enclosing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: [0, 1, 2].map(|d| self.min[d].min(other.min[d])),
            max: [0, 1, 2].map(|d| self.max[d].max(other.max[d])),
        }
    }
}

/// Geometry of a transformed PSF box.
///
/// Output voxel `o` corresponds to the reference frame point `o + offset`. The offset is
/// chosen such that voxel `size / 2` is the image of the input box center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PsfBox {
    pub size: [usize; 3],
    pub offset: [f64; 3],
}

impl AffineTransform3D {
    pub fn identity() -> Self {
        AffineTransform3D {
            matrix: Matrix4::identity(),
        }
    }

    /// Builds a transform from `m00, m01, m02, m03, m10, ..., m23`.
    pub fn from_row_major(values: [f64; 12]) -> Self {
        let mut matrix = Matrix4::identity();
        for (i, v) in values.iter().enumerate() {
            matrix[(i / 4, i % 4)] = *v;
        }
        AffineTransform3D { matrix }
    }

    pub fn to_row_major(&self) -> [f64; 12] {
        std::array::from_fn(|i| self.matrix[(i / 4, i % 4)])
    }

    pub fn scaling(sx: f64, sy: f64, sz: f64) -> Self {
        AffineTransform3D {
            matrix: Matrix4::new_nonuniform_scaling(&Vector3::new(sx, sy, sz)),
        }
    }

    pub fn translation(tx: f64, ty: f64, tz: f64) -> Self {
        AffineTransform3D {
            matrix: Matrix4::new_translation(&Vector3::new(tx, ty, tz)),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.matrix[(row, col)]
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let q = self.matrix.transform_point(&Point3::new(p[0], p[1], p[2]));
        [q.x, q.y, q.z]
    }

    /// `self ∘ other`: the result applies `other` first, then `self`.
    pub fn concatenate(&self, other: &AffineTransform3D) -> Self {
        AffineTransform3D {
            matrix: self.matrix * other.matrix,
        }
    }

    /// `other ∘ self`: the result applies `self` first, then `other`.
    pub fn pre_concatenate(&self, other: &AffineTransform3D) -> Self {
        other.concatenate(self)
    }

    /// Appends an anisotropic z scaling, turning slice coordinates into isotropic ones
    /// before this transform is applied.
    pub fn concatenate_axial_scaling(&self, z_stretching: f64) -> Self {
        self.concatenate(&Self::scaling(1.0, 1.0, z_stretching))
    }

    /// Determinant of the linear part.
    pub fn determinant(&self) -> f64 {
        self.matrix.fixed_view::<3, 3>(0, 0).determinant()
    }

    pub fn inverse(&self) -> Result<Self> {
        let det = self.determinant();
        if !det.is_finite() || det.abs() < 1e-12 {
            return Err(SpimError::NonInvertible(det));
        }
        self.matrix
            .try_inverse()
            .map(|matrix| AffineTransform3D { matrix })
            .ok_or(SpimError::NonInvertible(det))
    }

    /// Bounding box of a raster of `dims` voxels after transformation.
    ///
    /// All eight corners `(0 | dim - 1)` are mapped; extremal corners stay extremal under an
    /// affine map, so this is the exact box of the transformed raster.
    pub fn bounding_box(&self, dims: [usize; 3]) -> BoundingBox {
        let mut bbox = BoundingBox {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        };
        for corner in 0..8 {
            let p = [0, 1, 2].map(|d| {
                if (corner >> d) & 1 == 1 {
                    dims[d].saturating_sub(1) as f64
                } else {
                    0.0
                }
            });
            let q = self.apply(p);
            for d in 0..3 {
                bbox.min[d] = bbox.min[d].min(q[d]);
                bbox.max[d] = bbox.max[d].max(q[d]);
            }
        }
        bbox
    }

    /// Size and placement of a box of `dims` voxels after transformation.
    ///
    /// Every axis gets `ceil(span) + 3` voxels, rounded up to an odd count, and the image of
    /// the input center `dims / 2` lands on the output center `size / 2`.
    pub fn psf_box(&self, dims: [usize; 3]) -> PsfBox {
        let span = self.bounding_box(dims).span();
        let size = span.map(|s| make_odd(s.ceil() as usize + 3));
        let center = self.apply(dims.map(|d| (d / 2) as f64));
        PsfBox {
            size,
            offset: [0, 1, 2].map(|d| center[d] - (size[d] / 2) as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rotation_z(angle: f64) -> AffineTransform3D {
        let (s, c) = angle.sin_cos();
        AffineTransform3D::from_row_major([c, -s, 0.0, 0.0, s, c, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    fn rotation_x(angle: f64) -> AffineTransform3D {
        let (s, c) = angle.sin_cos();
        AffineTransform3D::from_row_major([1.0, 0.0, 0.0, 0.0, 0.0, c, -s, 0.0, 0.0, s, c, 0.0])
    }

    fn sample_transforms() -> Vec<AffineTransform3D> {
        vec![
            AffineTransform3D::identity(),
            AffineTransform3D::scaling(1.0, 1.0, 3.5),
            rotation_z(0.7).concatenate(&AffineTransform3D::translation(12.3, -4.1, 7.9)),
            rotation_x(1.2)
                .concatenate(&rotation_z(-0.4))
                .concatenate_axial_scaling(2.25),
            AffineTransform3D::from_row_major([
                1.1, 0.3, -0.2, 100.0, 0.05, 0.9, 0.4, -3.0, -0.1, 0.2, 2.7, 0.5,
            ]),
        ]
    }

    #[test]
    fn test_inverse_round_trip() {
        for t in sample_transforms() {
            let inv = t.inverse().unwrap();
            let p = [3.0, -7.5, 11.25];
            let q = inv.apply(t.apply(p));
            for d in 0..3 {
                assert_abs_diff_eq!(q[d], p[d], epsilon = 1e-9);
            }
            let identity = t.concatenate(&inv).to_row_major();
            for (a, b) in identity.iter().zip(AffineTransform3D::identity().to_row_major()) {
                assert_abs_diff_eq!(*a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_singular_transform_is_rejected() {
        let flat = AffineTransform3D::scaling(1.0, 0.0, 1.0);
        assert!(matches!(flat.inverse(), Err(SpimError::NonInvertible(_))));
    }

    #[test]
    fn test_concatenate_applies_argument_first() {
        let scale = AffineTransform3D::scaling(2.0, 2.0, 2.0);
        let shift = AffineTransform3D::translation(1.0, 0.0, 0.0);
        assert_eq!(scale.concatenate(&shift).apply([1.0, 1.0, 1.0]), [4.0, 2.0, 2.0]);
        assert_eq!(scale.pre_concatenate(&shift).apply([1.0, 1.0, 1.0]), [3.0, 2.0, 2.0]);
    }

    #[test]
    fn test_axial_scaling_only_touches_z() {
        let t = AffineTransform3D::identity().concatenate_axial_scaling(4.0);
        assert_eq!(t.apply([1.0, 2.0, 3.0]), [1.0, 2.0, 12.0]);
    }

    #[test]
    fn test_bounding_box_uses_all_corners() {
        let bbox = rotation_z(std::f64::consts::FRAC_PI_4).bounding_box([11, 11, 5]);
        let diagonal = 10.0 * std::f64::consts::SQRT_2;
        assert_abs_diff_eq!(bbox.span()[0], diagonal, epsilon = 1e-9);
        assert_abs_diff_eq!(bbox.span()[1], diagonal, epsilon = 1e-9);
        assert_abs_diff_eq!(bbox.span()[2], 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_psf_box_is_odd_and_centered() {
        for t in sample_transforms() {
            for dims in [[17, 17, 17], [17, 17, 33], [9, 13, 21], [16, 16, 16]] {
                let psf_box = t.psf_box(dims);
                assert!(psf_box.size.iter().all(|s| s % 2 == 1), "{psf_box:?}");
                let center = t.apply(dims.map(|d| (d / 2) as f64));
                for d in 0..3 {
                    let voxel = center[d] - psf_box.offset[d];
                    assert_abs_diff_eq!(voxel, (psf_box.size[d] / 2) as f64, epsilon = 1e-9);
                }
                let span = t.bounding_box(dims).span();
                for d in 0..3 {
                    assert!(psf_box.size[d] as f64 >= span[d] + 3.0);
                }
            }
        }
    }

    #[test]
    fn test_psf_box_of_identity_grows_by_three_and_stays_odd() {
        let psf_box = AffineTransform3D::identity().psf_box([17, 17, 17]);
        // span 16 + 3 = 19
        assert_eq!(psf_box.size, [19, 19, 19]);
        assert_eq!(psf_box.offset, [-1.0, -1.0, -1.0]);
    }
}
