//! Point spread functions measured from fluorescent beads.
//!
//! Every view contributes the mean of small windows cut around its RANSAC confirmed beads.
//! That window lives in the raw pixel space of the view; it is mapped into the reference
//! frame with the view transform so the PSFs of all views can be compared, averaged and
//! used as deconvolution kernels for the fused volumes.

use crate::affine::AffineTransform3D;
use crate::config::{KernelChoice, PsfWindow};
use crate::error::{Result, SpimError};
use crate::io::{read_volume, NpzBundle};
use crate::math_tools::make_odd;
use crate::view::Bead;
use crate::volume::{OutOfBounds, Volume};
use ndarray::{s, Array2, Zip};
use std::path::{Path, PathBuf};

/// Size of the extraction window for a view.
///
/// An explicit `size3d` wins. Otherwise the window is a cube of `size`; when it is not
/// isotropic the z extent grows for views whose slices are close together, so roughly the
/// same physical depth is covered.
pub fn psf_window_size(window: &PsfWindow, z_stretching: f64) -> [usize; 3] {
    if let Some(size3d) = window.size3d {
        return size3d;
    }
    let s = window.size;
    if window.isotropic {
        [s, s, s]
    } else {
        let z = (s as f64 * (5.0 / z_stretching).max(1.0)) as usize;
        [s, s, make_odd(z)]
    }
}

fn is_degenerate(psf: &Volume) -> bool {
    let sum = psf.sum();
    sum == 0.0 || !sum.is_finite()
}

/// Sums the windows around every bead with a RANSAC correspondence and divides by their
/// count.
///
/// Window voxel `o` samples the image at `bead.position + o - size / 2` with linear
/// interpolation; positions outside the image wrap around periodically.
///
/// # Returns
/// The mean window and the number of beads in it. Without any qualifying bead the window
/// is all zero.
pub fn average_bead_windows(image: &Volume, beads: &[Bead], size: [usize; 3]) -> (Volume, usize) {
    let mut window = Volume::zeros(size);
    let half = size.map(|s| (s / 2) as f64);
    let mut count = 0usize;

    for bead in beads.iter().filter(|bead| bead.is_true_correspondence()) {
        let origin = [0, 1, 2].map(|d| bead.position[d] - half[d]);
        Zip::indexed(window.view_mut()).par_for_each(|(x, y, z), v| {
            *v += image.sample_linear(
                [origin[0] + x as f64, origin[1] + y as f64, origin[2] + z as f64],
                OutOfBounds::Periodic,
            );
        });
        count += 1;
    }

    if count == 0 {
        log::warn!("no bead with a RANSAC correspondence, PSF window stays empty");
    } else {
        window.scale(1.0 / count as f32);
    }
    (window, count)
}

/// Mean bead window of one view.
///
/// # Fields
/// - `psf`: Sum normalized mean window, all zero if `bead_count` is 0.
/// - `bead_count`: Number of beads averaged.
#[derive(Debug, Clone)]
pub struct ExtractedWindow {
    pub psf: Volume,
    pub bead_count: usize,
}

/// [`average_bead_windows`] followed by sum normalization.
pub fn extract_psf(image: &Volume, beads: &[Bead], size: [usize; 3]) -> ExtractedWindow {
    let (mut psf, bead_count) = average_bead_windows(image, beads, size);
    if bead_count > 0 {
        psf.normalize_sum();
    }
    ExtractedWindow { psf, bead_count }
}

/// Maps a PSF into the reference frame.
///
/// The output geometry comes from [`AffineTransform3D::psf_box`]: its center voxel is the
/// image of the input center. Every output voxel is pulled back through the inverse
/// transform and interpolated linearly, outside the input box the PSF is 0.
pub fn transform_psf(psf: &Volume, transform: &AffineTransform3D) -> Result<Volume> {
    let psf_box = transform.psf_box(psf.dims());
    let inverse = transform.inverse()?;
    let offset = psf_box.offset;

    let mut transformed = Volume::zeros(psf_box.size);
    Zip::indexed(transformed.view_mut()).par_for_each(|(x, y, z), v| {
        let q = inverse.apply([
            x as f64 + offset[0],
            y as f64 + offset[1],
            z as f64 + offset[2],
        ]);
        *v = psf.sample_linear(q, OutOfBounds::Value(0.0));
    });
    if !is_degenerate(&transformed) {
        transformed.normalize_sum();
    }
    Ok(transformed)
}

/// Per-axis maximum size.
pub fn common_size<'a>(psfs: impl IntoIterator<Item = &'a Volume>) -> [usize; 3] {
    psfs.into_iter().fold([0; 3], |size, psf| {
        let dims = psf.dims();
        [0, 1, 2].map(|d| size[d].max(dims[d]))
    })
}

fn usable<'a>(psfs: impl IntoIterator<Item = &'a Volume>) -> Vec<&'a Volume> {
    psfs.into_iter()
        .enumerate()
        .filter_map(|(i, psf)| {
            if is_degenerate(psf) {
                log::warn!("PSF #{i} has no energy, excluded from the average");
                None
            } else {
                Some(psf)
            }
        })
        .collect()
}

/// Mean of PSFs of possibly different size, aligned at their centers.
///
/// Every PSF is added as is: voxel `p` lands on `p - center + average_center`, it is not
/// mirrored through its center first.
///
/// # Errors
/// `SpimError::MissingPsf` if no PSF with energy is given.
pub fn average_centered<'a>(psfs: impl IntoIterator<Item = &'a Volume>) -> Result<Volume> {
    let psfs = usable(psfs);
    if psfs.is_empty() {
        return Err(SpimError::MissingPsf(
            "none of the PSFs can be averaged".to_string(),
        ));
    }

    let mut average = Volume::zeros(common_size(psfs.iter().copied()));
    let center = average.center();
    for psf in &psfs {
        let [d0, d1, d2] = psf.dims();
        let c = psf.center();
        let [s0, s1, s2] = [0, 1, 2].map(|d| center[d] - c[d]);
        let mut region = average
            .view_mut()
            .slice_move(s![s0..s0 + d0, s1..s1 + d1, s2..s2 + d2]);
        region += &psf.view();
    }
    average.scale(1.0 / psfs.len() as f32);
    average.normalize_sum();
    Ok(average)
}

/// Mean of the untransformed PSFs.
///
/// Only possible if all of them have the same shape. Otherwise, or if none is usable, a
/// warning is logged and `None` returned.
pub fn average_original<'a>(psfs: impl IntoIterator<Item = &'a Volume>) -> Option<Volume> {
    let psfs = usable(psfs);
    let first = psfs.first()?;
    let dims = first.dims();
    if let Some(other) = psfs.iter().find(|psf| psf.dims() != dims) {
        log::warn!(
            "original PSFs differ in size ({:?} vs {:?}), skipping their average",
            dims,
            other.dims()
        );
        return None;
    }

    let mut average = Volume::zeros(dims);
    for psf in &psfs {
        let mut region = average.view_mut();
        region += &psf.view();
    }
    average.scale(1.0 / psfs.len() as f32);
    average.normalize_sum();
    Some(average)
}

/// The PSF of one view.
///
/// # Fields
/// - `view_id`: Id of the view it was measured in.
/// - `original`: PSF in raw pixel space, absent for PSFs loaded in the reference frame.
/// - `transformed`: PSF in the reference frame.
/// - `bead_count`: Beads averaged, `None` for loaded PSFs.
#[derive(Debug, Clone)]
pub struct ExtractedPsf {
    pub view_id: u32,
    pub original: Option<Volume>,
    pub transformed: Volume,
    pub bead_count: Option<usize>,
}

impl ExtractedPsf {
    /// Extracts the PSF of one view from its image and beads.
    pub fn extract(
        view_id: u32,
        image: &Volume,
        beads: &[Bead],
        size: [usize; 3],
        transform: &AffineTransform3D,
    ) -> Result<Self> {
        let window = extract_psf(image, beads, size);
        let transformed = if window.bead_count == 0 {
            Volume::zeros(transform.psf_box(size).size)
        } else {
            transform_psf(&window.psf, transform)?
        };
        log::info!(
            "extracted PSF of view {view_id} from {} beads, {:?} -> {:?}",
            window.bead_count,
            size,
            transformed.dims()
        );
        Ok(ExtractedPsf {
            view_id,
            original: Some(window.psf),
            transformed,
            bead_count: Some(window.bead_count),
        })
    }

    pub fn is_degenerate(&self) -> bool {
        is_degenerate(&self.transformed)
    }
}

/// Reads the PSF of every view from its own file.
///
/// # Arguments
/// - `views`: Id, transform and `.npy` file of every view that needs a PSF.
/// - `already_transformed`: The files are in the reference frame.
///
/// # Errors
/// `SpimError::MissingInput` if the file of a view does not exist.
pub fn load_psfs(
    views: &[(u32, AffineTransform3D, PathBuf)],
    already_transformed: bool,
) -> Result<Vec<ExtractedPsf>> {
    views
        .iter()
        .map(|(view_id, transform, path)| {
            if !path.exists() {
                return Err(SpimError::MissingInput {
                    view: format!("view {view_id}"),
                    path: path.clone(),
                });
            }
            let mut psf = read_volume(path)?;
            psf.normalize_sum();
            log::info!("loaded PSF of view {view_id} from {path:?}");
            if already_transformed {
                Ok(ExtractedPsf {
                    view_id: *view_id,
                    original: None,
                    transformed: psf,
                    bead_count: None,
                })
            } else {
                Ok(ExtractedPsf {
                    view_id: *view_id,
                    transformed: transform_psf(&psf, transform)?,
                    original: Some(psf),
                    bead_count: None,
                })
            }
        })
        .collect()
}

/// PSFs of all fused views of a run together with their averages.
#[derive(Debug, Clone)]
pub struct PsfSet {
    psfs: Vec<ExtractedPsf>,
    average: Volume,
    average_original: Option<Volume>,
}

impl PsfSet {
    /// Averages the PSFs. Degenerate ones are kept per view but left out of the averages.
    ///
    /// # Errors
    /// `SpimError::MissingPsf` if no view has a usable PSF.
    pub fn new(psfs: Vec<ExtractedPsf>) -> Result<Self> {
        let average = average_centered(psfs.iter().map(|psf| &psf.transformed))?;
        let average_original = if psfs.iter().all(|psf| psf.original.is_some()) {
            average_original(psfs.iter().filter_map(|psf| psf.original.as_ref()))
        } else {
            None
        };
        Ok(PsfSet {
            psfs,
            average,
            average_original,
        })
    }

    pub fn psfs(&self) -> &[ExtractedPsf] {
        &self.psfs
    }

    pub fn average(&self) -> &Volume {
        &self.average
    }

    pub fn average_original(&self) -> Option<&Volume> {
        self.average_original.as_ref()
    }

    /// Maximum intensity projection of the average along its shortest axis.
    pub fn max_projection(&self) -> Array2<f32> {
        self.average.max_projection(self.average.shortest_axis())
    }

    /// Deconvolution kernel of the view at `index`.
    ///
    /// A view without a usable PSF of its own falls back to the average.
    pub fn kernel(&self, index: usize, choice: KernelChoice) -> &Volume {
        match (choice, self.psfs.get(index)) {
            (KernelChoice::PerView, Some(psf)) if !psf.is_degenerate() => &psf.transformed,
            (KernelChoice::PerView, _) => {
                log::warn!("view #{index} has no usable PSF, deconvolving it with the average");
                &self.average
            }
            (KernelChoice::Average, _) => &self.average,
        }
    }

    /// Writes all PSFs into one `.npz` archive.
    ///
    /// Entries: `view_<id>`, `view_<id>_original`, `average`, `average_original` and
    /// `average_mip`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bundle = NpzBundle::create(path)?;
        for psf in &self.psfs {
            bundle.add(&format!("view_{}", psf.view_id), psf.transformed.array())?;
            if let Some(original) = &psf.original {
                bundle.add(&format!("view_{}_original", psf.view_id), original.array())?;
            }
        }
        bundle.add("average", self.average.array())?;
        if let Some(original) = &self.average_original {
            bundle.add("average_original", original.array())?;
        }
        bundle.add("average_mip", &self.max_projection())?;
        bundle.finish()?;
        log::info!("saved PSFs to {path:?}");
        Ok(())
    }
}
