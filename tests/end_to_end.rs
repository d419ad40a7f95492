use spim_deconvolution::config::UpdateMode;
use spim_deconvolution::deconvolution::fourier::convolve;
use spim_deconvolution::deconvolution::multiview::{
    DeconvolutionParams, DeconvolutionView, MultiViewDeconvolver,
};
use spim_deconvolution::volume::Volume;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

const DIMS: [usize; 3] = [16, 16, 16];
const CENTER: [usize; 3] = [8, 8, 8];

fn ground_truth() -> Volume {
    Volume::from_shape_fn(DIMS, |(x, y, z)| {
        let r2 = [x, y, z]
            .iter()
            .zip(CENTER)
            .map(|(p, c)| (*p as f64 - c as f64).powi(2))
            .sum::<f64>();
        (10.0 * (-r2 / (2.0 * 1.5 * 1.5)).exp()) as f32
    })
}

fn peak(volume: &Volume) -> [usize; 3] {
    let (index, _) = volume
        .values()
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, v)| {
            if *v > best.1 { (i, *v) } else { best }
        });
    volume.raster().coordinates(index)
}

#[test]
fn two_identical_views_recover_blob() {
    let truth = ground_truth();
    let kernel = Volume::filled([5, 5, 5], 1.0 / 125.0);
    let blurred = convolve(&truth, &kernel).unwrap();

    let views = (0..2)
        .map(|_| DeconvolutionView {
            image: blurred.clone(),
            weight: Some(Volume::filled(DIMS, 1.0)),
            kernel: kernel.clone(),
        })
        .collect();
    let params = DeconvolutionParams {
        min_iterations: 50,
        max_iterations: 50,
        update_mode: UpdateMode::Multiplicative,
        lambda: 0.0,
        threads: 2,
        debug_interval: None,
        convergence_threshold: None,
        ..DeconvolutionParams::default()
    };
    let deconvolver = MultiViewDeconvolver::new(views, params).unwrap();
    let abort = AtomicBool::new(false);
    let progress = Arc::new(RwLock::new(None));
    let result = deconvolver.run(&abort, &progress, |_, _| Ok(())).unwrap();

    assert_eq!(result.stats.len(), 50);
    let found = peak(&result.psi);
    for d in 0..3 {
        assert!(
            found[d].abs_diff(CENTER[d]) <= 1,
            "peak at {found:?}, expected {CENTER:?}"
        );
    }

    let energy = truth.sum();
    let recovered = result.psi.sum();
    assert!(
        ((recovered - energy) / energy).abs() < 0.05,
        "energy {recovered} vs {energy}"
    );

    // deconvolution concentrates the blurred blob again
    let center = truth.raster().linear(CENTER);
    assert!(result.psi.values()[center] > blurred.values()[center]);
}
