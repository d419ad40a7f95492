//! Transformation of registered views into the common reference frame.
//!
//! The fusion frame is the axis aligned box enclosing every transformed view. Each view is
//! resampled into that frame by pulling every output voxel back through the inverse view
//! transform, which yields the view image in reference coordinates together with a weight
//! volume telling where the view has data. These pairs are the input of the multi-view
//! deconvolution.

use crate::affine::{AffineTransform3D, BoundingBox};
use crate::config::CropRegion;
use crate::error::{Result, SpimError};
use crate::math_tools::blending_weight;
use crate::volume::{OutOfBounds, RasterIndex, Volume};
use cancellable_loops::par_for_each_cancellable;
use ndarray::{Array3, Axis, Zip};
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;

/// Output geometry of a fusion.
///
/// Voxel `o` of the frame is the reference point `o + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionFrame {
    pub dims: [usize; 3],
    pub offset: [f64; 3],
}

impl FusionFrame {
    /// Smallest frame containing all transformed views.
    ///
    /// # Arguments
    /// - `views`: Image size and transform of every view.
    pub fn enclosing<'a, I>(views: I) -> Result<Self>
    where
        I: IntoIterator<Item = ([usize; 3], &'a AffineTransform3D)>,
    {
        let bbox = views
            .into_iter()
            .map(|(dims, transform)| transform.bounding_box(dims))
            .reduce(|a, b| a.union(&b))
            .ok_or(SpimError::NoViews)?;
        Ok(FusionFrame::from_bounding_box(&bbox))
    }

    pub fn from_bounding_box(bbox: &BoundingBox) -> Self {
        FusionFrame {
            dims: bbox.span().map(|s| s.ceil() as usize + 1),
            offset: bbox.min,
        }
    }

    /// Restricts the frame to `region`, given in voxels of this frame.
    ///
    /// Sizes of 0 and sizes reaching past the frame end at the frame border.
    ///
    /// # Errors
    /// `SpimError::Config` if the region starts outside of the frame.
    pub fn crop(&self, region: &CropRegion) -> Result<Self> {
        if let Some(axis) = (0..3).find(|&d| region.offset[d] >= self.dims[d]) {
            return Err(SpimError::Config(format!(
                "crop offset {:?} lies outside of the {:?} voxel frame (axis {axis})",
                region.offset, self.dims
            )));
        }
        let dims = [0, 1, 2].map(|d| {
            let available = self.dims[d] - region.offset[d];
            match region.size[d] {
                0 => available,
                size => size.min(available),
            }
        });
        Ok(FusionFrame {
            dims,
            offset: [0, 1, 2].map(|d| self.offset[d] + region.offset[d] as f64),
        })
    }

    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A view resampled into the fusion frame.
///
/// # Fields
/// - `image`: Background corrected intensities, 0 where the view has no data.
/// - `weight`: 1 inside the view (lowered towards its borders when blending), 0 outside.
#[derive(Debug, Clone)]
pub struct TransformedView {
    pub view_id: u32,
    pub image: Volume,
    pub weight: Volume,
}

/// Resamples `image` into `frame`.
///
/// # Arguments
/// - `transform`: Maps raw image coordinates to the reference frame.
/// - `blending_border`: Width of the cosine weight ramp at the image borders, 0 disables it.
/// - `background`: Subtracted from every sample, results are clamped at 0.
/// - `abort_flag`: Checked before every x slice, a raised flag fails with
///   `SpimError::Cancelled`.
pub fn transform_view(
    view_id: u32,
    image: &Volume,
    transform: &AffineTransform3D,
    frame: &FusionFrame,
    blending_border: f64,
    background: f32,
    abort_flag: &AtomicBool,
) -> Result<TransformedView> {
    let inverse = transform.inverse()?;
    let dims = image.dims();
    let limits = dims.map(|d| d as f64 - 1.0);
    let offset = frame.offset;
    let [d0, d1, d2] = frame.dims;
    let mut data = Array3::<f32>::zeros((d0, d1, d2));
    let mut weights = Array3::<f32>::zeros((d0, d1, d2));

    let slices = (data.axis_iter_mut(Axis(0)), weights.axis_iter_mut(Axis(0)))
        .into_par_iter()
        .enumerate();
    par_for_each_cancellable(slices, abort_flag, |(x, (data_slice, weight_slice))| {
        Zip::indexed(data_slice)
            .and(weight_slice)
            .for_each(|(y, z), value, weight| {
                let q = inverse.apply([
                    x as f64 + offset[0],
                    y as f64 + offset[1],
                    z as f64 + offset[2],
                ]);
                let inside = (0..3).all(|d| {
                    let r = q[d].round();
                    r >= 0.0 && r <= limits[d]
                });
                if !inside {
                    return;
                }
                let distance = (0..3)
                    .map(|d| q[d].min(limits[d] - q[d]))
                    .fold(f64::INFINITY, f64::min);
                *weight = blending_weight(distance, blending_border);
                *value = (image.sample_linear(q, OutOfBounds::Value(0.0)) - background)
                    .max(0.0);
            });
    })?;

    Ok(TransformedView {
        view_id,
        image: Volume::from_array(data),
        weight: Volume::from_array(weights),
    })
}

/// Scales the weights of all views so they sum to at most 1 at every voxel.
pub fn normalize_weights(weights: &mut [&mut Volume]) -> Result<()> {
    if weights.is_empty() {
        return Ok(());
    }
    let raster = RasterIndex::shared(weights.iter().map(|w| &**w))?;
    let mut slices: Vec<&mut [f32]> = weights.iter_mut().map(|w| w.values_mut()).collect();
    for i in raster.iter() {
        let sum: f32 = slices.iter().map(|s| s[i]).sum();
        if sum > 1.0 {
            for slice in slices.iter_mut() {
                slice[i] /= sum;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    static RUNNING: AtomicBool = AtomicBool::new(false);

    fn ramp(dims: [usize; 3]) -> Volume {
        Volume::from_shape_fn(dims, |(x, y, z)| (1 + x + 10 * y + 100 * z) as f32)
    }

    #[test]
    fn test_frame_encloses_all_views() {
        let identity = AffineTransform3D::identity();
        let frame = FusionFrame::enclosing([([4, 5, 6], &identity)]).unwrap();
        assert_eq!(frame.dims, [4, 5, 6]);
        assert_eq!(frame.offset, [0.0, 0.0, 0.0]);

        let shifted = AffineTransform3D::translation(-2.0, 0.0, 3.0);
        let frame = FusionFrame::enclosing([([4, 5, 6], &identity), ([4, 5, 6], &shifted)]).unwrap();
        assert_eq!(frame.dims, [6, 5, 9]);
        assert_eq!(frame.offset, [-2.0, 0.0, 0.0]);

        let stretched = AffineTransform3D::identity().concatenate_axial_scaling(2.0);
        let frame = FusionFrame::enclosing([([4, 5, 6], &stretched)]).unwrap();
        assert_eq!(frame.dims, [4, 5, 11]);

        assert!(matches!(
            FusionFrame::enclosing(std::iter::empty::<([usize; 3], &AffineTransform3D)>()),
            Err(SpimError::NoViews)
        ));
    }

    #[test]
    fn test_identity_keeps_image() {
        let image = ramp([4, 5, 6]);
        let identity = AffineTransform3D::identity();
        let frame = FusionFrame::enclosing([(image.dims(), &identity)]).unwrap();
        let view = transform_view(0, &image, &identity, &frame, 0.0, 0.0, &RUNNING).unwrap();
        assert_eq!(view.image, image);
        assert!(view.weight.values().iter().all(|w| *w == 1.0));
    }

    #[test]
    fn test_translated_view_and_background() {
        let image = ramp([4, 4, 4]);
        let identity = AffineTransform3D::identity();
        let shifted = AffineTransform3D::translation(2.0, 0.0, 0.0);
        let frame =
            FusionFrame::enclosing([(image.dims(), &identity), (image.dims(), &shifted)]).unwrap();
        assert_eq!(frame.dims, [6, 4, 4]);

        let view = transform_view(1, &image, &shifted, &frame, 0.0, 2.0, &RUNNING).unwrap();
        for ((x, y, z), w) in view.weight.array().indexed_iter() {
            if x < 2 {
                assert_eq!(*w, 0.0);
                assert_eq!(view.image.array()[(x, y, z)], 0.0);
            } else {
                assert_eq!(*w, 1.0);
                let raw = image.array()[(x - 2, y, z)];
                assert_abs_diff_eq!(view.image.array()[(x, y, z)], (raw - 2.0).max(0.0));
            }
        }
    }

    #[test]
    fn test_blending_lowers_border_weights() {
        let image = Volume::filled([9, 9, 9], 1.0);
        let identity = AffineTransform3D::identity();
        let frame = FusionFrame::enclosing([(image.dims(), &identity)]).unwrap();
        let view = transform_view(0, &image, &identity, &frame, 3.0, 0.0, &RUNNING).unwrap();
        let weight = |p: [isize; 3]| view.weight.get(p, OutOfBounds::Value(-1.0));
        assert_eq!(weight([0, 4, 4]), 0.0);
        assert_eq!(weight([4, 4, 4]), 1.0);
        assert!(weight([1, 4, 4]) > 0.0 && weight([1, 4, 4]) < weight([2, 4, 4]));
        assert_eq!(weight([4, 4, 8]), 0.0);
    }

    #[test]
    fn test_cropped_frame_is_sub_block_of_full_frame() {
        let image = ramp([8, 7, 6]);
        let identity = AffineTransform3D::identity();
        let moved = AffineTransform3D::translation(-1.5, 0.25, 2.0).concatenate_axial_scaling(1.5);
        let full = FusionFrame::enclosing([(image.dims(), &identity), (image.dims(), &moved)])
            .unwrap();
        let region = CropRegion {
            offset: [2, 1, 3],
            size: [4, 0, 100],
        };
        let cropped = full.crop(&region).unwrap();
        assert_eq!(
            cropped.dims,
            [4, full.dims[1] - 1, full.dims[2] - 3]
        );

        let whole = transform_view(1, &image, &moved, &full, 2.0, 0.0, &RUNNING).unwrap();
        let part = transform_view(1, &image, &moved, &cropped, 2.0, 0.0, &RUNNING).unwrap();
        for ((x, y, z), value) in part.image.array().indexed_iter() {
            let p = (x + 2, y + 1, z + 3);
            assert_abs_diff_eq!(*value, whole.image.array()[p], epsilon = 1e-5);
            assert_abs_diff_eq!(part.weight.array()[(x, y, z)], whole.weight.array()[p], epsilon = 1e-5);
        }

        let outside = CropRegion {
            offset: [0, full.dims[1], 0],
            size: [0; 3],
        };
        assert!(matches!(full.crop(&outside), Err(SpimError::Config(_))));
    }

    #[test]
    fn test_raised_flag_stops_resampling() {
        let image = ramp([4, 4, 4]);
        let identity = AffineTransform3D::identity();
        let frame = FusionFrame::enclosing([(image.dims(), &identity)]).unwrap();
        let result = transform_view(0, &image, &identity, &frame, 0.0, 0.0, &AtomicBool::new(true));
        assert!(matches!(result, Err(SpimError::Cancelled)));
    }

    #[test]
    fn test_normalize_weights() {
        let mut a = Volume::from_shape_fn([2, 1, 1], |(x, _, _)| if x == 0 { 1.0 } else { 0.3 });
        let mut b = Volume::from_shape_fn([2, 1, 1], |(x, _, _)| if x == 0 { 3.0 } else { 0.4 });
        normalize_weights(&mut [&mut a, &mut b]).unwrap();
        assert_abs_diff_eq!(a.values()[0], 0.25);
        assert_abs_diff_eq!(b.values()[0], 0.75);
        assert_abs_diff_eq!(a.values()[1], 0.3);
        assert_abs_diff_eq!(b.values()[1], 0.4);

        let mut c = Volume::zeros([1, 1, 1]);
        assert!(matches!(
            normalize_weights(&mut [&mut a, &mut c]),
            Err(SpimError::ShapeMismatch { .. })
        ));
    }
}
