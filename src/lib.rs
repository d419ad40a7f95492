//! Multi-view deconvolution of SPIM acquisitions.
//!
//! A specimen imaged from several angles yields one volume per view. Once the views are
//! registered to each other, their point spread functions are measured from fluorescent
//! beads, all views are transformed into a common frame and a weighted multi-view
//! Lucy-Richardson iteration reconstructs a single, sharper volume.
//!
//! # Stages
//!
//! * **Views**: [`view_structure::ViewStructure`] scans an acquisition ([`config`]),
//!   reads image dimensions, bead detections and registrations ([`io`]).
//!
//! * **PSFs**: [`deconvolution::psf`] averages bead windows per view, transforms and
//!   averages them.
//!
//! * **Fusion**: [`fusion`] resamples the views into the common frame with weights.
//!
//! * **Deconvolution**: [`deconvolution::multiview`] runs the iteration with FFT based
//!   convolutions from [`deconvolution::fourier`].
//!
//! [`pipeline`] ties the stages together for the command line front end.

/// 3D affine transforms, bounding boxes and the geometry of transformed PSFs.
pub mod affine;

/// Run configuration, acquisition layout and stored preferences.
pub mod config;

/// PSF extraction, FFT convolution and the multi-view iteration.
pub mod deconvolution;

/// The error type of the crate.
pub mod error;

/// Resampling of registered views into the common frame.
pub mod fusion;

/// Volume files and the text files that accompany every view.
pub mod io;

/// Index helpers, compensated sums and pattern parsing.
pub mod math_tools;

/// Stage orchestration, progress reporting and output files.
pub mod pipeline;

/// Views, their keys and bead detections.
pub mod view;

/// All views of a timepoint, typed by registration state.
pub mod view_structure;

/// Dense 3D volumes.
pub mod volume;

pub use error::{Result, SpimError};
