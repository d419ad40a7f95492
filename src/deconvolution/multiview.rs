//! Weighted multi-view Lucy-Richardson deconvolution.
//!
//! All views are registered into one frame and share a single estimate `psi`. Every
//! iteration has two phases:
//!
//! 1. For every view, in parallel: blur `psi` with the view kernel, divide the view image by
//!    it and blur that ratio with the same kernel again. This is the contribution of the
//!    view, each view only reads `psi` and writes its own buffer.
//! 2. Sequentially: fold the contributions of all views into `psi` voxel by voxel, using
//!    the view weights. The update either multiplies the weighted geometric mean or the
//!    weighted arithmetic mean of the contributions into `psi`.
//!
//! Voxels no view has a weight for are set to `min_value` instead of collapsing to 0, from
//! which a multiplicative update could never recover.

use super::fourier::FourierConvolver;
use crate::config::{DeconvolutionSettings, UpdateMode};
use crate::error::{Result, SpimError};
use crate::math_tools::RealSum;
use crate::volume::{RasterIndex, Volume};
use cancellable_loops::{check_abort, par_map_cancellable};
use ndarray::Zip;
use serde::Serialize;
use std::iter::once;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// One registered view as seen by the deconvolution.
///
/// # Fields
/// - `image`: The view transformed into the reference frame.
/// - `weight`: Where and how much the view is trusted, `None` means 1 everywhere.
/// - `kernel`: Its PSF in the reference frame. Normalized to unit sum on construction of
///   the deconvolver.
#[derive(Debug, Clone)]
pub struct DeconvolutionView {
    pub image: Volume,
    pub weight: Option<Volume>,
    pub kernel: Volume,
}

impl DeconvolutionView {
    fn weight_at(&self, index: usize) -> f32 {
        self.weight.as_ref().map_or(1.0, |weight| weight.values()[index])
    }
}

/// Parameters of the iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct DeconvolutionParams {
    pub min_iterations: usize,
    pub max_iterations: usize,
    pub update_mode: UpdateMode,
    pub lambda: f64,
    pub min_value: f32,
    pub threads: usize,
    pub debug_interval: Option<usize>,
    pub convergence_threshold: Option<f64>,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        DeconvolutionParams::from(&DeconvolutionSettings::default())
    }
}

impl From<&DeconvolutionSettings> for DeconvolutionParams {
    fn from(settings: &DeconvolutionSettings) -> Self {
        DeconvolutionParams {
            min_iterations: settings.min_iterations,
            max_iterations: settings.max_iterations,
            update_mode: settings.update_mode,
            lambda: settings.lambda,
            min_value: settings.min_value,
            threads: settings.threads,
            debug_interval: settings.debug_interval,
            convergence_threshold: settings.convergence_threshold,
        }
    }
}

/// Change of the estimate during one iteration.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct IterationStats {
    pub iteration: usize,
    /// Sum over all voxels of `|new - old|`.
    pub sum_change: f64,
    pub max_change: f64,
    /// `sum_change` per voxel.
    pub mean_change: f64,
    pub seconds: f64,
}

#[derive(Debug, Clone)]
pub struct DeconvolutionResult {
    pub psi: Volume,
    pub stats: Vec<IterationStats>,
    /// Whether the run stopped on the convergence threshold.
    pub converged: bool,
}

/// Tikhonov regularized value, `(sqrt(1 + 2λf) - 1) / λ`.
pub fn tikhonov(value: f64, lambda: f64) -> f64 {
    if lambda > 0.0 {
        ((1.0 + 2.0 * lambda * value).sqrt() - 1.0) / lambda
    } else {
        value
    }
}

fn shared_raster(views: &[DeconvolutionView]) -> Result<RasterIndex> {
    RasterIndex::shared(
        views
            .iter()
            .flat_map(|view| once(&view.image).chain(view.weight.as_ref())),
    )
}

/// Mean intensity of the views in the region where at least two of them overlap.
///
/// A view covers a voxel if its weight there is not 0. Returns 1 if no two views overlap
/// anywhere.
pub fn overlap_average_intensity(views: &[DeconvolutionView]) -> Result<f64> {
    let raster = shared_raster(views)?;
    let mut sum = RealSum::new();
    let mut count = 0u64;

    for i in raster.iter() {
        let mut local = 0.0;
        let mut covering = 0u64;
        for view in views {
            if view.weight_at(i) != 0.0 {
                local += view.image.values()[i] as f64;
                covering += 1;
            }
        }
        if covering >= 2 {
            sum.add(local);
            count += covering;
        }
    }

    if count == 0 {
        log::warn!("views do not overlap, starting from an estimate of 1");
        Ok(1.0)
    } else {
        Ok(sum.sum() / count as f64)
    }
}

/// Change of the estimate caused by [`aggregate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Change {
    pub sum: f64,
    pub max: f64,
}

/// Folds the contributions of all views into `psi`.
///
/// Only views with a positive weight at a voxel take part there. With `num = Σ w`:
/// - multiplicative: `psi * (∏ c^w)^(1 / num)`
/// - additive: `psi * (Σ c * w) / num`
///
/// Voxels with `num == 0` become `min_value`. The result is regularized with
/// [`tikhonov`], NaN is replaced by `min_value` and every voxel is floored at `min_value`.
///
/// # Arguments
/// - `weights`: One entry per contribution, `None` meaning weight 1 everywhere.
pub fn aggregate(
    psi: &mut Volume,
    contributions: &[Volume],
    weights: &[Option<&Volume>],
    mode: UpdateMode,
    lambda: f64,
    min_value: f32,
) -> Result<Change> {
    if weights.len() != contributions.len() {
        return Err(SpimError::Config(format!(
            "{} weights given for {} contributions",
            weights.len(),
            contributions.len()
        )));
    }
    let raster = RasterIndex::shared(
        once(&*psi)
            .chain(contributions)
            .chain(weights.iter().flatten().copied()),
    )?;

    let contributions: Vec<&[f32]> = contributions.iter().map(Volume::values).collect();
    let weights: Vec<Option<&[f32]>> = weights.iter().map(|w| w.map(Volume::values)).collect();
    let psi = psi.values_mut();

    let mut sum_change = RealSum::new();
    let mut max_change = 0.0f64;
    for i in raster.iter() {
        let participating = contributions
            .iter()
            .zip(&weights)
            .map(|(c, w)| (c[i] as f64, w.map_or(1.0, |w| w[i] as f64)))
            .filter(|(_, w)| *w > 0.0);

        let mut num = 0.0;
        let factor = match mode {
            UpdateMode::Multiplicative => {
                let mut value = 1.0;
                for (c, w) in participating {
                    value *= c.powf(w);
                    num += w;
                }
                value.powf(1.0 / num)
            }
            UpdateMode::Additive => {
                let mut value = 0.0;
                for (c, w) in participating {
                    value += c * w;
                    num += w;
                }
                value / num
            }
        };

        let old = psi[i];
        let mut new = if num > 0.0 {
            tikhonov(old as f64 * factor, lambda) as f32
        } else {
            min_value
        };
        if new.is_nan() || new < min_value {
            new = min_value;
        }

        let change = (new as f64 - old as f64).abs();
        sum_change.add(change);
        max_change = max_change.max(change);
        psi[i] = new;
    }

    Ok(Change {
        sum: sum_change.sum(),
        max: max_change,
    })
}

/// Deconvolves a set of registered views into one volume.
pub struct MultiViewDeconvolver {
    views: Vec<DeconvolutionView>,
    convolvers: Vec<FourierConvolver>,
    raster: RasterIndex,
    params: DeconvolutionParams,
    pool: rayon::ThreadPool,
}

impl MultiViewDeconvolver {
    /// Checks that all images and weights share one shape, normalizes the kernels and plans
    /// one convolution per view.
    ///
    /// # Errors
    /// - `SpimError::NoViews` for an empty view list.
    /// - `SpimError::ShapeMismatch` if images or weights differ in shape.
    /// - `SpimError::MissingPsf` for a kernel without energy.
    pub fn new(mut views: Vec<DeconvolutionView>, params: DeconvolutionParams) -> Result<Self> {
        if views.is_empty() {
            return Err(SpimError::NoViews);
        }
        let raster = shared_raster(&views)?;

        for (i, view) in views.iter_mut().enumerate() {
            let sum = view.kernel.sum();
            if sum == 0.0 || !sum.is_finite() {
                return Err(SpimError::MissingPsf(format!(
                    "kernel of view #{i} sums to {sum}"
                )));
            }
            view.kernel.normalize_sum();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads)
            .build()
            .map_err(|err| SpimError::Config(format!("cannot start worker threads: {err}")))?;

        let convolvers = pool.install(|| {
            views
                .iter()
                .map(|view| FourierConvolver::new(raster.dims(), &view.kernel))
                .collect::<Result<Vec<_>>>()
        })?;
        log::info!(
            "deconvolving {} views of {:?} voxels on {} threads, FFT size {:?}",
            views.len(),
            raster.dims(),
            pool.current_num_threads(),
            convolvers[0].padded_dims()
        );

        Ok(MultiViewDeconvolver {
            views,
            convolvers,
            raster,
            params,
            pool,
        })
    }

    pub fn views(&self) -> &[DeconvolutionView] {
        &self.views
    }

    pub fn params(&self) -> &DeconvolutionParams {
        &self.params
    }

    /// `conv(image / conv(psi, k), k)` for the view at `index`.
    pub fn view_contribution(&self, index: usize, psi: &Volume) -> Result<Volume> {
        let convolver = &self.convolvers[index];
        let mut ratio = convolver.convolve(psi)?;
        Zip::from(ratio.view_mut())
            .and(self.views[index].image.view())
            .par_for_each(|blurred, image| {
                *blurred = if *blurred > 0.0 { *image / *blurred } else { 0.0 };
            });
        convolver.convolve(&ratio)
    }

    /// Runs the iteration.
    ///
    /// # Arguments
    /// - `abort_flag`: Checked before every iteration and every view, a set flag ends the
    ///   run with `SpimError::Cancelled`.
    /// - `progress_lock`: Fraction of iterations done, reset to `None` at the end.
    /// - `observer`: Called with the current estimate every `debug_interval` iterations.
    pub fn run<F>(
        &self,
        abort_flag: &AtomicBool,
        progress_lock: &Arc<RwLock<Option<f32>>>,
        mut observer: F,
    ) -> Result<DeconvolutionResult>
    where
        F: FnMut(usize, &Volume) -> Result<()>,
    {
        let start = Instant::now();
        let initial = overlap_average_intensity(&self.views)?;
        log::info!("average intensity in overlapping areas: {initial:.6}");

        let mut psi = Volume::filled(self.raster.dims(), initial as f32)
            .with_calibration(self.views[0].image.calibration());
        let weights: Vec<Option<&Volume>> =
            self.views.iter().map(|view| view.weight.as_ref()).collect();
        let max_iterations = self.params.max_iterations;
        let mut stats = Vec::with_capacity(max_iterations);
        let mut converged = false;

        for iteration in 1..=max_iterations {
            check_abort(abort_flag)?;
            let iteration_start = Instant::now();

            let contributions = self
                .pool
                .install(|| {
                    par_map_cancellable(0..self.views.len(), abort_flag, |i| {
                        self.view_contribution(i, &psi)
                    })
                })?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;

            let change = aggregate(
                &mut psi,
                &contributions,
                &weights,
                self.params.update_mode,
                self.params.lambda,
                self.params.min_value,
            )?;
            drop(contributions);

            let iteration_stats = IterationStats {
                iteration,
                sum_change: change.sum,
                max_change: change.max,
                mean_change: change.sum / self.raster.len() as f64,
                seconds: iteration_start.elapsed().as_secs_f64(),
            };
            log::info!(
                "{} iteration {iteration}/{max_iterations}: sum change {:.6}, max change {:.6}, {:.2}s",
                chrono::Local::now().format("%H:%M:%S%.3f"),
                iteration_stats.sum_change,
                iteration_stats.max_change,
                iteration_stats.seconds
            );
            stats.push(iteration_stats);

            if let Ok(mut progress) = progress_lock.write() {
                *progress = Some(iteration as f32 / max_iterations as f32);
            }
            if let Some(interval) = self.params.debug_interval {
                if iteration % interval == 0 {
                    observer(iteration, &psi)?;
                }
            }
            if let Some(threshold) = self.params.convergence_threshold {
                if iteration >= self.params.min_iterations
                    && iteration_stats.mean_change < threshold
                {
                    log::info!(
                        "mean change {:.3e} below {threshold:.3e}, stopping after {iteration} iterations",
                        iteration_stats.mean_change
                    );
                    converged = true;
                    break;
                }
            }
        }

        if let Ok(mut progress) = progress_lock.write() {
            *progress = None;
        }
        log::info!(
            "deconvolution finished after {:.2}s",
            start.elapsed().as_secs_f64()
        );
        Ok(DeconvolutionResult {
            psi,
            stats,
            converged,
        })
    }
}
