//! Convolution of volumes with a fixed kernel in the Fourier domain.
//!
//! The image is embedded into a padded grid of at least `image + kernel - 1` voxels per
//! axis (rounded up to an FFT friendly length) and the padding is filled by mirroring the
//! image, so the circular convolution never wraps around and borders behave like a
//! continuation of the data rather than a drop to zero. The kernel is stored with its
//! center wrapped to the origin and transformed once; every call to
//! [`FourierConvolver::convolve`] then costs one forward and one inverse transform.
//!
//! Transforms are separable: a real-to-complex pass along z (`realfft`) followed by
//! complex passes along y and x (`rustfft`), each parallelized over the lanes of the axis.

use crate::error::{Result, SpimError};
use crate::math_tools::{next_fast_len, periodic_index};
use crate::volume::{OutOfBounds, Volume};
use ndarray::{s, Array3, Axis, Zip};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex};

/// Convolution operator for one kernel and one image shape.
///
/// # Fields
/// - `image_dims`: Shape of the volumes this operator accepts.
/// - `kernel_dims`: Shape of the kernel, its center is `kernel_dims / 2`.
/// - `padded_dims`: Shape of the FFT grid.
/// - `kernel_spectrum`: Half spectrum of the wrapped kernel, `padded_dims[2] / 2 + 1` along z.
/// - `r2c`, `c2r`: Real transforms along z.
/// - `forward`, `inverse`: Complex transforms along x and y.
pub struct FourierConvolver {
    image_dims: [usize; 3],
    kernel_dims: [usize; 3],
    padded_dims: [usize; 3],
    kernel_spectrum: Array3<Complex32>,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
    forward: [Arc<dyn Fft<f32>>; 2],
    inverse: [Arc<dyn Fft<f32>>; 2],
}

impl std::fmt::Debug for FourierConvolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FourierConvolver")
            .field("image_dims", &self.image_dims)
            .field("kernel_dims", &self.kernel_dims)
            .field("padded_dims", &self.padded_dims)
            .finish()
    }
}

fn record_failure(failure: &Mutex<Option<String>>, err: impl std::fmt::Display) {
    if let Ok(mut slot) = failure.lock() {
        slot.get_or_insert_with(|| err.to_string());
    }
}

fn check_failure(failure: Mutex<Option<String>>) -> Result<()> {
    match failure.into_inner() {
        Ok(Some(message)) => Err(SpimError::Fft(message)),
        Ok(None) => Ok(()),
        Err(_) => Err(SpimError::Fft("fft worker panicked".to_string())),
    }
}

impl FourierConvolver {
    /// Plans the transforms and precomputes the kernel spectrum.
    ///
    /// # Arguments
    /// - `image_dims`: Shape of the volumes that will be convolved.
    /// - `kernel`: The kernel, used as is (no normalization happens here).
    pub fn new(image_dims: [usize; 3], kernel: &Volume) -> Result<Self> {
        let kernel_dims = kernel.dims();
        if image_dims.contains(&0) || kernel_dims.contains(&0) {
            return Err(SpimError::Fft(format!(
                "cannot convolve {image_dims:?} with kernel {kernel_dims:?}"
            )));
        }
        let padded_dims = [0, 1, 2].map(|d| next_fast_len(image_dims[d] + kernel_dims[d] - 1));

        let mut real_planner = RealFftPlanner::<f32>::new();
        let mut planner = FftPlanner::<f32>::new();
        let mut convolver = FourierConvolver {
            image_dims,
            kernel_dims,
            padded_dims,
            kernel_spectrum: Array3::zeros((0, 0, 0)),
            r2c: real_planner.plan_fft_forward(padded_dims[2]),
            c2r: real_planner.plan_fft_inverse(padded_dims[2]),
            forward: [
                planner.plan_fft_forward(padded_dims[0]),
                planner.plan_fft_forward(padded_dims[1]),
            ],
            inverse: [
                planner.plan_fft_inverse(padded_dims[0]),
                planner.plan_fft_inverse(padded_dims[1]),
            ],
        };

        let center = kernel.center();
        let mut wrapped = Array3::<f32>::zeros((padded_dims[0], padded_dims[1], padded_dims[2]));
        for ((x, y, z), v) in kernel.array().indexed_iter() {
            let p = [x, y, z];
            let idx = [0, 1, 2]
                .map(|d| periodic_index(p[d] as isize - center[d] as isize, padded_dims[d]));
            wrapped[(idx[0], idx[1], idx[2])] = *v;
        }
        convolver.kernel_spectrum = convolver.forward_transform(wrapped)?;
        Ok(convolver)
    }

    pub fn image_dims(&self) -> [usize; 3] {
        self.image_dims
    }

    pub fn kernel_dims(&self) -> [usize; 3] {
        self.kernel_dims
    }

    pub fn padded_dims(&self) -> [usize; 3] {
        self.padded_dims
    }

    /// Convolves `image` with the kernel, returning a volume of the same shape.
    pub fn convolve(&self, image: &Volume) -> Result<Volume> {
        if image.dims() != self.image_dims {
            return Err(SpimError::ShapeMismatch {
                expected: self.image_dims,
                found: image.dims(),
            });
        }
        let offset = self.kernel_dims.map(|k| (k / 2) as isize);
        let [n0, n1, n2] = self.padded_dims;

        let mut padded = Array3::<f32>::zeros((n0, n1, n2));
        Zip::indexed(&mut padded).par_for_each(|(x, y, z), v| {
            *v = image.get(
                [
                    x as isize - offset[0],
                    y as isize - offset[1],
                    z as isize - offset[2],
                ],
                OutOfBounds::Mirror,
            );
        });

        let mut spectrum = self.forward_transform(padded)?;
        Zip::from(&mut spectrum)
            .and(&self.kernel_spectrum)
            .par_for_each(|s, k| *s *= *k);
        let result = self.inverse_transform(spectrum)?;

        let [d0, d1, d2] = self.image_dims;
        let [o0, o1, o2] = offset.map(|o| o as usize);
        let cropped = result
            .slice(s![o0..o0 + d0, o1..o1 + d1, o2..o2 + d2])
            .to_owned();
        Ok(Volume::from_array(cropped).with_calibration(image.calibration()))
    }

    fn forward_transform(&self, real: Array3<f32>) -> Result<Array3<Complex32>> {
        let [n0, n1, n2] = self.padded_dims;
        let mut spectrum = Array3::<Complex32>::zeros((n0, n1, n2 / 2 + 1));
        let failure = Mutex::new(None);

        Zip::from(real.lanes(Axis(2)))
            .and(spectrum.lanes_mut(Axis(2)))
            .par_for_each(|lane, mut out| {
                let mut input = lane.to_vec();
                let mut buffer = self.r2c.make_output_vec();
                match self.r2c.process(&mut input, &mut buffer) {
                    Ok(()) => out.iter_mut().zip(buffer).for_each(|(o, b)| *o = b),
                    Err(err) => record_failure(&failure, err),
                }
            });
        check_failure(failure)?;

        self.complex_pass(&mut spectrum, &self.forward);
        Ok(spectrum)
    }

    fn inverse_transform(&self, mut spectrum: Array3<Complex32>) -> Result<Array3<f32>> {
        self.complex_pass(&mut spectrum, &self.inverse);

        let [n0, n1, n2] = self.padded_dims;
        let norm = 1.0 / (n0 * n1 * n2) as f32;
        let mut real = Array3::<f32>::zeros((n0, n1, n2));
        let failure = Mutex::new(None);

        Zip::from(spectrum.lanes(Axis(2)))
            .and(real.lanes_mut(Axis(2)))
            .par_for_each(|lane, mut out| {
                let mut buffer = lane.to_vec();
                // c2r rejects imaginary parts in the bins that must be real
                buffer[0].im = 0.0;
                if n2 % 2 == 0 {
                    if let Some(last) = buffer.last_mut() {
                        last.im = 0.0;
                    }
                }
                let mut output = self.c2r.make_output_vec();
                match self.c2r.process(&mut buffer, &mut output) {
                    Ok(()) => out.iter_mut().zip(output).for_each(|(o, v)| *o = v * norm),
                    Err(err) => record_failure(&failure, err),
                }
            });
        check_failure(failure)?;
        Ok(real)
    }

    /// In place complex transforms along x and y.
    fn complex_pass(&self, spectrum: &mut Array3<Complex32>, plans: &[Arc<dyn Fft<f32>>; 2]) {
        for (axis, plan) in plans.iter().enumerate() {
            Zip::from(spectrum.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
                let mut buffer = lane.to_vec();
                plan.process(&mut buffer);
                lane.iter_mut().zip(buffer).for_each(|(dst, src)| *dst = src);
            });
        }
    }
}

/// Convolves `image` with `kernel` using a one-off [`FourierConvolver`].
pub fn convolve(image: &Volume, kernel: &Volume) -> Result<Volume> {
    FourierConvolver::new(image.dims(), kernel)?.convolve(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn test_image(dims: [usize; 3]) -> Volume {
        Volume::from_shape_fn(dims, |(x, y, z)| {
            ((x * 31 + y * 17 + z * 7) % 13) as f32 + 0.5 * x as f32
        })
    }

    /// Direct evaluation of the convolution with the same mirror boundary.
    fn direct(image: &Volume, kernel: &Volume) -> Volume {
        let center = kernel.center().map(|c| c as isize);
        Volume::from_shape_fn(image.dims(), |(x, y, z)| {
            let mut sum = 0.0f64;
            for ((i, j, k), w) in kernel.array().indexed_iter() {
                let p = [
                    x as isize - (i as isize - center[0]),
                    y as isize - (j as isize - center[1]),
                    z as isize - (k as isize - center[2]),
                ];
                sum += *w as f64 * image.get(p, OutOfBounds::Mirror) as f64;
            }
            sum as f32
        })
    }

    #[test]
    fn test_delta_kernel_is_identity() {
        let image = test_image([9, 8, 7]);
        let mut kernel = Volume::zeros([3, 3, 3]);
        kernel.values_mut()[13] = 1.0;
        let result = convolve(&image, &kernel).unwrap();
        for (a, b) in result.values().iter().zip(image.values()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_matches_direct_convolution_with_asymmetric_kernel() {
        let image = test_image([10, 7, 6]);
        let kernel = Volume::from_shape_fn([3, 5, 2], |(x, y, z)| (1 + x + 2 * y + 3 * z) as f32);
        let result = convolve(&image, &kernel).unwrap();
        let expected = direct(&image, &kernel);
        for (a, b) in result.values().iter().zip(expected.values()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_unit_sum_kernel_keeps_constant_volume() {
        let image = Volume::filled([6, 6, 6], 3.0);
        let kernel = Volume::filled([5, 5, 5], 1.0 / 125.0);
        let result = convolve(&image, &kernel).unwrap();
        assert!(result.values().iter().all(|v| (v - 3.0).abs() < 1e-4));
    }

    #[test]
    fn test_operator_is_reusable_and_checks_shape() {
        let kernel = Volume::filled([3, 3, 3], 1.0 / 27.0);
        let convolver = FourierConvolver::new([8, 8, 8], &kernel).unwrap();
        assert_eq!(convolver.padded_dims(), [10, 10, 10]);
        let a = convolver.convolve(&test_image([8, 8, 8])).unwrap();
        let b = convolver.convolve(&test_image([8, 8, 8])).unwrap();
        assert_eq!(a, b);
        assert!(matches!(
            convolver.convolve(&Volume::zeros([8, 8, 9])),
            Err(SpimError::ShapeMismatch { .. })
        ));
    }
}
