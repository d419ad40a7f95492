//! Multi-view deconvolution of registered SPIM acquisitions.
//!
//! The modules build on each other in the order they are used during a run:
//!
//! * **PSF**: Point spread functions are measured from beads in every view, mapped into
//!   the reference frame and averaged.
//!
//! * **Fourier**: Each PSF becomes a convolution operator that is planned once and then
//!   applied twice per view and iteration.
//!
//! * **Multi-view**: The Lucy-Richardson iteration that combines all views into one
//!   estimate.

/// Convolution of volumes with a fixed kernel via FFT.
pub mod fourier;

/// Weighted Lucy-Richardson iteration over several views sharing one estimate.
pub mod multiview;

/// Extraction, transformation and averaging of point spread functions.
pub mod psf;

pub use fourier::FourierConvolver;
pub use multiview::{
    DeconvolutionParams, DeconvolutionResult, DeconvolutionView, IterationStats,
    MultiViewDeconvolver,
};
pub use psf::{ExtractedPsf, PsfSet};
