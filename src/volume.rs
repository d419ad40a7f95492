//! Dense 3D floating point volumes.
//!
//! A [`Volume`] wraps an `Array3<f32>` indexed `[x, y, z]` that is always kept in standard
//! layout, so the raster order of [`Volume::values`] is identical for all volumes of the
//! same shape. Passes that walk several volumes in lockstep go through a [`RasterIndex`]
//! which checks the shapes once up front.

use crate::error::{Result, SpimError};
use crate::math_tools::{mirror_index, periodic_index, RealSum};
use ndarray::{Array2, Array3, ArrayView3, ArrayViewMut3, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Value returned for coordinates outside of a volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutOfBounds {
    /// A constant.
    Value(f32),
    /// Reflection at the border without repeating the border voxel.
    Mirror,
    /// The volume repeats itself.
    Periodic,
}

/// Intensity range recorded by a min/max normalization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f32,
    pub max: f32,
}

impl Bounds {
    pub fn range(&self) -> f32 {
        self.max - self.min
    }

    fn is_degenerate(&self) -> bool {
        let range = self.range();
        !range.is_finite() || range == 0.0
    }
}

/// A calibrated 3D raster of `f32` samples.
///
/// # Fields
/// - `data`: Samples indexed `[x, y, z]`, standard layout.
/// - `calibration`: Physical voxel spacing along x, y and z.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array3<f32>,
    calibration: [f32; 3],
}

impl Volume {
    pub fn zeros(dims: [usize; 3]) -> Self {
        Self::filled(dims, 0.0)
    }

    pub fn filled(dims: [usize; 3], value: f32) -> Self {
        Self::from_array(Array3::from_elem((dims[0], dims[1], dims[2]), value))
    }

    pub fn from_shape_fn<F>(dims: [usize; 3], f: F) -> Self
    where
        F: FnMut((usize, usize, usize)) -> f32,
    {
        Self::from_array(Array3::from_shape_fn((dims[0], dims[1], dims[2]), f))
    }

    /// Takes ownership of `data`, copying it into standard layout if necessary.
    ///
    /// Every constructor goes through here and `data` is never reshaped in place, so the
    /// raster slices of [`Volume::values`] always exist.
    pub fn from_array(data: Array3<f32>) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Volume {
            data,
            calibration: [1.0; 3],
        }
    }

    pub fn with_calibration(mut self, calibration: [f32; 3]) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn calibration(&self) -> [f32; 3] {
        self.calibration
    }

    pub fn dims(&self) -> [usize; 3] {
        let (x, y, z) = self.data.dim();
        [x, y, z]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Integer center voxel, `dims / 2` along every axis.
    pub fn center(&self) -> [usize; 3] {
        self.dims().map(|d| d / 2)
    }

    pub fn raster(&self) -> RasterIndex {
        RasterIndex::new(self.dims())
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut3<'_, f32> {
        self.data.view_mut()
    }

    pub fn array(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }

    /// Samples in raster order.
    pub fn values(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("volumes are kept in standard layout")
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        self.data
            .as_slice_mut()
            .expect("volumes are kept in standard layout")
    }

    /// Value at an integer position, resolving positions outside the volume with `oob`.
    pub fn get(&self, pos: [isize; 3], oob: OutOfBounds) -> f32 {
        let dims = self.dims();
        let mut idx = [0usize; 3];
        for d in 0..3 {
            let (p, n) = (pos[d], dims[d]);
            idx[d] = if p >= 0 && (p as usize) < n {
                p as usize
            } else {
                match oob {
                    OutOfBounds::Value(v) => return v,
                    _ if n == 0 => return 0.0,
                    OutOfBounds::Mirror => mirror_index(p, n),
                    OutOfBounds::Periodic => periodic_index(p, n),
                }
            };
        }
        self.data[(idx[0], idx[1], idx[2])]
    }

    /// Trilinear interpolation at a sub-voxel position.
    ///
    /// Corners with zero interpolation weight are never read, so sampling exactly on the
    /// grid returns the stored value bit for bit.
    pub fn sample_linear(&self, pos: [f64; 3], oob: OutOfBounds) -> f32 {
        let base = pos.map(f64::floor);
        let frac = [pos[0] - base[0], pos[1] - base[1], pos[2] - base[2]];
        let origin = base.map(|b| b as isize);

        let mut value = 0.0f64;
        for corner in 0..8 {
            let mut weight = 1.0;
            let mut p = origin;
            for d in 0..3 {
                if (corner >> d) & 1 == 1 {
                    p[d] += 1;
                    weight *= frac[d];
                } else {
                    weight *= 1.0 - frac[d];
                }
            }
            if weight != 0.0 {
                value += weight * self.get(p, oob) as f64;
            }
        }
        value as f32
    }

    pub fn sum(&self) -> f64 {
        self.data
            .iter()
            .map(|v| *v as f64)
            .collect::<RealSum>()
            .sum()
    }

    pub fn min_max(&self) -> Bounds {
        if self.is_empty() {
            return Bounds { min: 0.0, max: 0.0 };
        }
        self.data.iter().fold(
            Bounds {
                min: f32::INFINITY,
                max: f32::NEG_INFINITY,
            },
            |b, v| Bounds {
                min: b.min.min(*v),
                max: b.max.max(*v),
            },
        )
    }

    /// Maps the intensities to [0, 1] and returns the original bounds.
    ///
    /// A constant volume (or one holding non-finite values) cannot be mapped and is left
    /// unchanged.
    pub fn normalize_min_max(&mut self) -> Bounds {
        let bounds = self.min_max();
        if bounds.is_degenerate() {
            log::warn!(
                "cannot normalize volume with intensity range [{}, {}], leaving it unchanged",
                bounds.min,
                bounds.max
            );
            return bounds;
        }
        let range = bounds.range();
        self.data.par_mapv_inplace(|v| (v - bounds.min) / range);
        bounds
    }

    /// Inverse of [`Volume::normalize_min_max`].
    pub fn unnormalize_min_max(&mut self, bounds: Bounds) {
        if bounds.is_degenerate() {
            return;
        }
        let range = bounds.range();
        self.data.par_mapv_inplace(|v| v * range + bounds.min);
    }

    /// Scales the volume to unit sum and returns the sum it had before.
    ///
    /// Zero or non-finite sums leave the volume untouched.
    pub fn normalize_sum(&mut self) -> f64 {
        let sum = self.sum();
        if sum == 0.0 || !sum.is_finite() {
            log::warn!("cannot normalize volume with sum {sum}, leaving it unchanged");
            return sum;
        }
        self.data.par_mapv_inplace(|v| (v as f64 / sum) as f32);
        sum
    }

    /// Restores the intensities of a volume normalized by [`Volume::normalize_sum`].
    pub fn unnormalize_sum(&mut self, sum: f64) {
        if sum == 0.0 || !sum.is_finite() {
            return;
        }
        self.data.par_mapv_inplace(|v| (v as f64 * sum) as f32);
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.par_mapv_inplace(|v| v * factor);
    }

    /// Index of the axis with the fewest voxels, the first one on ties.
    pub fn shortest_axis(&self) -> usize {
        let dims = self.dims();
        (0..3).fold(0, |best, d| if dims[d] < dims[best] { d } else { best })
    }

    /// Maximum intensity projection along `axis`.
    pub fn max_projection(&self, axis: usize) -> Array2<f32> {
        self.data
            .fold_axis(Axis(axis), f32::NEG_INFINITY, |acc, v| acc.max(*v))
    }
}

/// Raster index shared by several volumes of identical shape.
///
/// Constructing it with [`RasterIndex::shared`] is the single place where lockstep passes
/// verify their inputs agree in shape; afterwards every participating volume can be read
/// with the same linear index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterIndex {
    dims: [usize; 3],
}

impl RasterIndex {
    pub fn new(dims: [usize; 3]) -> Self {
        RasterIndex { dims }
    }

    /// Index over the shape of the first volume, failing if any other volume differs.
    pub fn shared<'a, I>(volumes: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Volume>,
    {
        let mut volumes = volumes.into_iter();
        let first = volumes.next().ok_or(SpimError::NoViews)?;
        let index = RasterIndex::new(first.dims());
        for volume in volumes {
            index.check(volume)?;
        }
        Ok(index)
    }

    pub fn check(&self, volume: &Volume) -> Result<()> {
        if volume.dims() == self.dims {
            Ok(())
        } else {
            Err(SpimError::ShapeMismatch {
                expected: self.dims,
                found: volume.dims(),
            })
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Range<usize> {
        0..self.len()
    }

    pub fn linear(&self, pos: [usize; 3]) -> usize {
        (pos[0] * self.dims[1] + pos[1]) * self.dims[2] + pos[2]
    }

    pub fn coordinates(&self, index: usize) -> [usize; 3] {
        let z = index % self.dims[2];
        let y = (index / self.dims[2]) % self.dims[1];
        let x = index / (self.dims[1] * self.dims[2]);
        [x, y, z]
    }
}
