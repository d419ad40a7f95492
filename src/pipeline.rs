//! Orchestration of a reconstruction run.
//!
//! For every timepoint the views are scanned, their dimensions, beads and registrations
//! resolved. Then, channel by channel, every fused view is loaded once: its PSF is
//! extracted, the image is transformed into the fusion frame and closed again. The
//! transformed views and their PSFs are handed to the multi-view deconvolution and the
//! result is written to the output directory together with the PSFs and a run summary.
//!
//! Work runs on the calling thread. The command line front end starts it on a worker
//! thread and watches the shared [`RunHandles`].

use crate::affine::AffineTransform3D;
use crate::config::{DeconvolutionSettings, PsfSource, RunConfig, SpimConfiguration};
use crate::deconvolution::multiview::{
    DeconvolutionParams, DeconvolutionResult, DeconvolutionView, IterationStats,
    MultiViewDeconvolver,
};
use crate::deconvolution::psf::{load_psfs, psf_window_size, ExtractedPsf, PsfSet};
use crate::error::{Result, SpimError};
use crate::fusion::{normalize_weights, transform_view, FusionFrame, TransformedView};
use crate::io::{read_volume, write_json, write_volume};
use crate::view::{Bead, View};
use crate::view_structure::{Registered, ViewStructure};
use crate::volume::Volume;
use cancellable_loops::{check_abort, try_for_each_cancellable};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared between a running reconstruction and its observer.
///
/// # Fields
/// - `abort_flag`: Set to stop the run at the next check, it then fails with
///   `SpimError::Cancelled`.
/// - `progress_lock`: Fraction of the current deconvolution done, `None` outside of it.
/// - `stage_lock`: Human readable description of what is being done.
#[derive(Debug, Clone, Default)]
pub struct RunHandles {
    pub abort_flag: Arc<AtomicBool>,
    pub progress_lock: Arc<RwLock<Option<f32>>>,
    pub stage_lock: Arc<RwLock<String>>,
}

impl RunHandles {
    fn set_stage(&self, stage: String) {
        log::info!("{stage}");
        if let Ok(mut current) = self.stage_lock.write() {
            *current = stage;
        }
    }
}

/// What a deconvolved channel looks like on disk.
#[derive(Serialize, Debug, Clone)]
pub struct RunSummary {
    pub timepoint: i32,
    pub channel: i32,
    pub view_ids: Vec<u32>,
    pub frame_dims: [usize; 3],
    pub frame_offset: [f64; 3],
    pub output: PathBuf,
    pub psf_file: Option<PathBuf>,
    pub converged: bool,
    pub iterations: Vec<IterationStats>,
    /// Local start time, RFC 3339.
    pub started: String,
    pub seconds: f64,
}

/// `DC(l=<lambda>)_t<timepoint>_ch<channel>`
pub fn output_stem(lambda: f64, timepoint: i32, channel: i32) -> String {
    format!("DC(l={lambda})_t{timepoint}_ch{channel}")
}

/// File name of the estimate written after `iteration` iterations.
pub fn debug_file(output_dir: &Path, stem: &str, iteration: usize) -> PathBuf {
    output_dir.join(format!("{stem}_it{iteration:04}.npy"))
}

pub fn psf_file(output_dir: &Path, timepoint: i32, channel: i32) -> PathBuf {
    output_dir.join(format!("psf_t{timepoint}_ch{channel}.npz"))
}

/// Scans the views of `timepoint` and resolves their registration.
pub fn prepare_views(
    conf: &SpimConfiguration,
    timepoint: i32,
) -> Result<ViewStructure<Registered>> {
    let mut structure = ViewStructure::from_configuration(conf, timepoint)?;
    structure.load_dimensions();
    structure.load_segmentation();
    Ok(structure.resolve_registration(conf.registration_source, conf.fuse_unregistered_views))
}

/// Extracts the PSF of a view from its normalized image. The image stays cached.
fn view_psf(
    view: &mut View,
    transform: &AffineTransform3D,
    settings: &DeconvolutionSettings,
) -> Result<ExtractedPsf> {
    let id = view.id();
    let size = psf_window_size(&settings.psf_window, view.z_stretching());
    let beads: Vec<Bead> = view.true_correspondences().cloned().collect();
    let image = view.image(true)?;
    ExtractedPsf::extract(id, image, &beads, size, transform)
}

/// Reads the configured PSF files of the views at `indices`.
///
/// `files` holds one entry per view of the timepoint in scan order, so every view keeps its
/// own file whichever subset of a channel is fused.
fn configured_psfs(
    structure: &ViewStructure<Registered>,
    indices: &[usize],
    files: &[PathBuf],
    already_transformed: bool,
) -> Result<Vec<ExtractedPsf>> {
    if files.len() != structure.len() {
        return Err(SpimError::Config(format!(
            "{} PSF files given for {} views of timepoint {}",
            files.len(),
            structure.len(),
            structure.timepoint()
        )));
    }
    let targets: Vec<_> = indices
        .iter()
        .map(|&i| (structure.view(i).id(), *structure.transform(i), files[i].clone()))
        .collect();
    load_psfs(&targets, already_transformed)
}

/// Views of one channel in the fusion frame, ready for deconvolution.
#[derive(Debug)]
pub struct PreparedChannel {
    pub channel: i32,
    pub frame: FusionFrame,
    pub views: Vec<TransformedView>,
    pub psfs: PsfSet,
}

/// Transforms all fused views of `channel` and collects their PSFs.
///
/// Every image is loaded once and closed as soon as its transformed copy exists.
///
/// # Errors
/// `SpimError::NoViews` if no view of the channel can be fused, `SpimError::MissingInput`
/// if the image of a fused view is missing, `SpimError::MissingPsf` if no PSF is usable.
pub fn prepare_channel(
    structure: &mut ViewStructure<Registered>,
    channel: i32,
    settings: &DeconvolutionSettings,
    abort_flag: &AtomicBool,
) -> Result<PreparedChannel> {
    let indices: Vec<usize> = structure
        .fusion_views(channel)
        .into_iter()
        .filter(|&i| structure.view(i).image_size().is_some())
        .collect();
    if indices.is_empty() {
        return Err(SpimError::NoViews);
    }

    let geometry: Vec<_> = indices
        .iter()
        .filter_map(|&i| {
            let view = structure.view(i);
            view.image_size().map(|dims| (dims, *structure.transform(i)))
        })
        .collect();
    let mut frame = FusionFrame::enclosing(geometry.iter().map(|(dims, t)| (*dims, t)))?;
    if let Some(region) = &settings.crop {
        frame = frame.crop(region)?;
    }
    log::info!(
        "channel {channel}: fusing {} views into {:?} voxels at {:?}",
        indices.len(),
        frame.dims,
        frame.offset
    );

    let extract = settings.psf_source == PsfSource::Extract;
    let mut views = Vec::with_capacity(indices.len());
    let mut psfs = Vec::with_capacity(indices.len());
    for &index in &indices {
        check_abort(abort_flag)?;
        let transform = *structure.transform(index);
        let view = structure.view_mut(index);
        if extract {
            psfs.push(view_psf(view, &transform, settings)?);
        }
        let id = view.id();
        let image = view.image(true)?;
        views.push(transform_view(
            id,
            image,
            &transform,
            &frame,
            settings.blending_border,
            settings.background,
            abort_flag,
        )?);
        view.close_image();
        log::info!("transformed view {} ({})", view.name(), view.key());
    }

    if let PsfSource::Load {
        files,
        already_transformed,
    } = &settings.psf_source
    {
        psfs = configured_psfs(structure, &indices, files, *already_transformed)?;
    }

    normalize_weights(&mut views.iter_mut().map(|v| &mut v.weight).collect::<Vec<_>>())?;
    Ok(PreparedChannel {
        channel,
        frame,
        views,
        psfs: PsfSet::new(psfs)?,
    })
}

/// Deconvolves a prepared channel.
///
/// With a `debug_interval` the estimate is written to `<output_dir>/<stem>_it<nnnn>.npy`.
pub fn deconvolve_channel(
    prepared: PreparedChannel,
    settings: &DeconvolutionSettings,
    handles: &RunHandles,
    stem: &str,
) -> Result<DeconvolutionResult> {
    let PreparedChannel { views, psfs, .. } = prepared;
    let views = views
        .into_iter()
        .enumerate()
        .map(|(i, view)| DeconvolutionView {
            image: view.image,
            weight: Some(view.weight),
            kernel: psfs.kernel(i, settings.kernel).clone(),
        })
        .collect();
    run_deconvolution(views, settings, handles, &settings.output_dir, stem)
}

fn run_deconvolution(
    views: Vec<DeconvolutionView>,
    settings: &DeconvolutionSettings,
    handles: &RunHandles,
    output_dir: &Path,
    stem: &str,
) -> Result<DeconvolutionResult> {
    let deconvolver = MultiViewDeconvolver::new(views, DeconvolutionParams::from(settings))?;
    deconvolver.run(
        &handles.abort_flag,
        &handles.progress_lock,
        |iteration, psi| {
            let path = debug_file(output_dir, stem, iteration);
            log::debug!("writing estimate of iteration {iteration} to {path:?}");
            write_volume(&path, psi)
        },
    )
}

fn create_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|err| SpimError::io(dir, err))
}

/// Runs the complete reconstruction described by `config`.
pub fn run(config: &RunConfig, handles: &RunHandles) -> Result<Vec<RunSummary>> {
    config.validate()?;
    let settings = &config.deconvolution;
    let output_dir = &settings.output_dir;
    create_output_dir(output_dir)?;

    let mut summaries = Vec::new();
    for timepoint in config.acquisition.timepoint_list()? {
        handles.set_stage(format!("timepoint {timepoint}: reading views"));
        let mut structure = prepare_views(&config.acquisition, timepoint)?;

        for channel in config.acquisition.channel_list()? {
            let started = chrono::Local::now();
            let start = Instant::now();
            handles.set_stage(format!(
                "timepoint {timepoint}, channel {channel}: transforming views"
            ));
            let prepared = prepare_channel(&mut structure, channel, settings, &handles.abort_flag)?;
            let stem = output_stem(settings.lambda, timepoint, channel);

            let psf_path = if settings.save_psfs {
                let path = psf_file(output_dir, timepoint, channel);
                prepared.psfs.save(&path)?;
                Some(path)
            } else {
                None
            };
            let view_ids = prepared.views.iter().map(|v| v.view_id).collect();
            let frame = prepared.frame;

            handles.set_stage(format!(
                "timepoint {timepoint}, channel {channel}: deconvolving"
            ));
            let result = deconvolve_channel(prepared, settings, handles, &stem)?;
            let output = output_dir.join(format!("{stem}.npy"));
            write_volume(&output, &result.psi)?;

            let summary = RunSummary {
                timepoint,
                channel,
                view_ids,
                frame_dims: frame.dims,
                frame_offset: frame.offset,
                output,
                psf_file: psf_path,
                converged: result.converged,
                iterations: result.stats,
                started: started.to_rfc3339(),
                seconds: start.elapsed().as_secs_f64(),
            };
            write_json(&output_dir.join(format!("{stem}.json")), &summary)?;
            log::info!(
                "wrote {:?} after {} iterations ({:.1}s)",
                summary.output,
                summary.iterations.len(),
                summary.seconds
            );
            summaries.push(summary);
        }
    }
    handles.set_stage("done".to_string());
    Ok(summaries)
}

/// Extracts and saves the PSFs of every timepoint and channel without deconvolving.
///
/// # Returns
/// The written `.npz` files.
pub fn extract_psfs(config: &RunConfig, handles: &RunHandles) -> Result<Vec<PathBuf>> {
    config.validate()?;
    let settings = &config.deconvolution;
    create_output_dir(&settings.output_dir)?;

    let mut written = Vec::new();
    for timepoint in config.acquisition.timepoint_list()? {
        let mut structure = prepare_views(&config.acquisition, timepoint)?;
        for channel in config.acquisition.channel_list()? {
            handles.set_stage(format!(
                "timepoint {timepoint}, channel {channel}: extracting PSFs"
            ));
            let indices = structure.fusion_views(channel);
            if indices.is_empty() {
                return Err(SpimError::NoViews);
            }
            let psfs = match &settings.psf_source {
                PsfSource::Extract => {
                    let mut psfs = Vec::with_capacity(indices.len());
                    try_for_each_cancellable(&indices, &handles.abort_flag, |&index| {
                        let transform = *structure.transform(index);
                        let view = structure.view_mut(index);
                        psfs.push(view_psf(view, &transform, settings)?);
                        view.close_image();
                        Ok::<_, SpimError>(())
                    })??;
                    psfs
                }
                PsfSource::Load {
                    files,
                    already_transformed,
                } => configured_psfs(&structure, &indices, files, *already_transformed)?,
            };
            let path = psf_file(&settings.output_dir, timepoint, channel);
            PsfSet::new(psfs)?.save(&path)?;
            written.push(path);
        }
    }
    Ok(written)
}

fn read_input(label: &str, path: &Path) -> Result<Volume> {
    if !path.exists() {
        return Err(SpimError::MissingInput {
            view: label.to_string(),
            path: path.to_path_buf(),
        });
    }
    read_volume(path)
}

/// Deconvolves volumes that are already in a common frame.
///
/// # Arguments
/// - `images`: One `.npy` file per view.
/// - `psfs`: One kernel for all views or one per view, in the reference frame.
/// - `weights`: Empty, or one weight volume per view.
/// - `output`: Where the estimate is written. The iteration statistics go next to it as
///   `.json`, debug estimates into the same directory.
pub fn deconvolve_files(
    images: &[PathBuf],
    psfs: &[PathBuf],
    weights: &[PathBuf],
    output: &Path,
    settings: &DeconvolutionSettings,
    handles: &RunHandles,
) -> Result<DeconvolutionResult> {
    settings.validate()?;
    if images.is_empty() {
        return Err(SpimError::NoViews);
    }
    if psfs.len() != 1 && psfs.len() != images.len() {
        return Err(SpimError::Config(format!(
            "expected 1 or {} PSFs, got {}",
            images.len(),
            psfs.len()
        )));
    }
    if !weights.is_empty() && weights.len() != images.len() {
        return Err(SpimError::Config(format!(
            "expected {} weights, got {}",
            images.len(),
            weights.len()
        )));
    }

    handles.set_stage(format!("reading {} views", images.len()));
    let views = images
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let label = format!("image #{i}");
            let kernel = &psfs[if psfs.len() == 1 { 0 } else { i }];
            Ok(DeconvolutionView {
                image: read_input(&label, path)?,
                weight: weights.get(i).map(|w| read_input(&label, w)).transpose()?,
                kernel: read_input(&label, kernel)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let output_dir = output
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    if !output_dir.as_os_str().is_empty() {
        create_output_dir(&output_dir)?;
    }
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "deconvolved".to_string());

    handles.set_stage("deconvolving".to_string());
    let result = run_deconvolution(views, settings, handles, &output_dir, &stem)?;
    write_volume(output, &result.psi)?;
    write_json(&output.with_extension("json"), &result.stats)?;
    handles.set_stage("done".to_string());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CropRegion, KernelChoice, PsfWindow, RegistrationSource};
    use crate::io::write_segmentation;
    use crate::view::BeadLink;
    use std::sync::atomic::Ordering;

    fn blob(dims: [usize; 3], center: [f64; 3]) -> Volume {
        Volume::from_shape_fn(dims, |(x, y, z)| {
            let r2 = (x as f64 - center[0]).powi(2)
                + (y as f64 - center[1]).powi(2)
                + (z as f64 - center[2]).powi(2);
            (0.05 + (-r2 / 3.0).exp()) as f32
        })
    }

    fn settings(output_dir: &Path) -> DeconvolutionSettings {
        DeconvolutionSettings {
            min_iterations: 1,
            max_iterations: 3,
            lambda: 0.0,
            psf_window: PsfWindow {
                size: 5,
                ..PsfWindow::default()
            },
            threads: 2,
            debug_interval: Some(2),
            output_dir: output_dir.to_path_buf(),
            ..DeconvolutionSettings::default()
        }
    }

    /// Two views of a blob with one confirmed bead each.
    fn acquisition(dir: &Path) -> SpimConfiguration {
        let registration_dir = dir.join("registration");
        fs::create_dir_all(&registration_dir).unwrap();
        for angle in [0, 90] {
            let name = format!("spim_TL1_Angle{angle}");
            write_volume(&dir.join(format!("{name}.npy")), &blob([12, 12, 12], [6.0, 6.0, 6.0]))
                .unwrap();
            let mut bead = Bead::new(0, angle as u32, [6.0, 6.0, 6.0]);
            bead.ransac_correspondences.push(BeadLink {
                bead_id: 0,
                view_id: 90 - angle as u32,
            });
            write_segmentation(&registration_dir.join(format!("{name}.beads.txt")), &[bead])
                .unwrap();
        }
        SpimConfiguration {
            input_dir: dir.to_path_buf(),
            file_pattern: "spim_TL{t}_Angle{a}.npy".to_string(),
            timepoints: "1".to_string(),
            angles: "0,90".to_string(),
            registration_source: RegistrationSource::Identity,
            ..SpimConfiguration::default()
        }
    }

    #[test]
    fn test_output_names() {
        assert_eq!(output_stem(0.006, 1, 0), "DC(l=0.006)_t1_ch0");
        assert_eq!(
            debug_file(Path::new("/out"), "DC(l=0)_t1_ch0", 7),
            PathBuf::from("/out/DC(l=0)_t1_ch0_it0007.npy")
        );
        assert_eq!(
            psf_file(Path::new("/out"), 3, 1),
            PathBuf::from("/out/psf_t3_ch1.npz")
        );
    }

    #[test]
    fn test_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        let config = RunConfig {
            acquisition: acquisition(dir.path()),
            deconvolution: settings(&output_dir),
        };
        let handles = RunHandles::default();
        let summaries = run(&config, &handles).unwrap();

        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.view_ids, vec![0, 1]);
        assert_eq!(summary.frame_dims, [12, 12, 12]);
        assert_eq!(summary.iterations.len(), 3);
        assert!(summary.output.ends_with("DC(l=0)_t1_ch0.npy"));
        let psi = read_volume(&summary.output).unwrap();
        assert_eq!(psi.dims(), [12, 12, 12]);
        assert!(psi.values().iter().all(|v| v.is_finite() && *v > 0.0));

        assert!(output_dir.join("psf_t1_ch0.npz").exists());
        assert!(output_dir.join("DC(l=0)_t1_ch0.json").exists());
        assert!(output_dir.join("DC(l=0)_t1_ch0_it0002.npy").exists());
        assert!(dir.path().join("registration/spim_TL1_Angle0.dim").exists());
        assert_eq!(*handles.progress_lock.read().unwrap(), None);
    }

    #[test]
    fn test_cropped_run() {
        let dir = tempfile::tempdir().unwrap();
        let output_dir = dir.path().join("out");
        let config = RunConfig {
            acquisition: acquisition(dir.path()),
            deconvolution: DeconvolutionSettings {
                crop: Some(CropRegion {
                    offset: [2, 3, 4],
                    size: [6, 0, 5],
                }),
                ..settings(&output_dir)
            },
        };
        let summaries = run(&config, &RunHandles::default()).unwrap();
        assert_eq!(summaries[0].frame_dims, [6, 9, 5]);
        assert_eq!(summaries[0].frame_offset, [2.0, 3.0, 4.0]);
        let psi = read_volume(&summaries[0].output).unwrap();
        assert_eq!(psi.dims(), [6, 9, 5]);
    }

    #[test]
    fn test_extract_psfs_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            acquisition: acquisition(dir.path()),
            deconvolution: DeconvolutionSettings {
                kernel: KernelChoice::Average,
                ..settings(&dir.path().join("out"))
            },
        };
        let written = extract_psfs(&config, &RunHandles::default()).unwrap();
        assert_eq!(written, vec![dir.path().join("out/psf_t1_ch0.npz")]);
        assert!(written[0].exists());
    }

    #[test]
    fn test_missing_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut acquisition = acquisition(dir.path());
        acquisition.angles = "0,90,180".to_string();
        let config = RunConfig {
            acquisition,
            deconvolution: settings(&dir.path().join("out")),
        };
        // the view without image is dropped while reading dimensions, the others are fused
        let summaries = run(&config, &RunHandles::default()).unwrap();
        assert_eq!(summaries[0].view_ids, vec![0, 1]);

        fs::remove_file(dir.path().join("spim_TL1_Angle90.npy")).unwrap();
        let mut structure = prepare_views(&config.acquisition, 1).unwrap();
        // dimensions are known from the .dim file, so the missing image surfaces on loading
        let result = prepare_channel(
            &mut structure,
            0,
            &config.deconvolution,
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(SpimError::MissingInput { .. })));
    }

    #[test]
    fn test_loaded_psfs_follow_their_views() {
        let dir = tempfile::tempdir().unwrap();
        let mut acquisition = acquisition(dir.path());
        acquisition.channels = "0,1".to_string();
        acquisition.angles = "0,90,180".to_string();
        fs::remove_file(dir.path().join("spim_TL1_Angle90.npy")).unwrap();
        write_volume(
            &dir.path().join("spim_TL1_Angle180.npy"),
            &blob([12, 12, 12], [6.0, 6.0, 6.0]),
        )
        .unwrap();

        // channel major: (c0, a0), (c0, a90), (c0, a180), (c1, a0), ...
        let files: Vec<PathBuf> = [3, 5, 7, 9, 11, 13]
            .iter()
            .map(|&size| {
                let path = dir.path().join(format!("psf_{size}.npy"));
                write_volume(&path, &Volume::filled([size, size, size], 1.0)).unwrap();
                path
            })
            .collect();
        let mut settings = DeconvolutionSettings {
            psf_source: PsfSource::Load {
                files: files.clone(),
                already_transformed: true,
            },
            ..settings(&dir.path().join("out"))
        };

        let mut structure = prepare_views(&acquisition, 1).unwrap();
        let abort = AtomicBool::new(false);
        for (channel, expected) in [(0, [(0, 3), (2, 7)]), (1, [(3, 9), (5, 13)])] {
            let prepared = prepare_channel(&mut structure, channel, &settings, &abort).unwrap();
            let loaded: Vec<_> = prepared
                .psfs
                .psfs()
                .iter()
                .map(|psf| (psf.view_id, psf.transformed.dims()[0]))
                .collect();
            assert_eq!(loaded, expected);
        }

        settings.psf_source = PsfSource::Load {
            files: files[..3].to_vec(),
            already_transformed: true,
        };
        assert!(matches!(
            prepare_channel(&mut structure, 0, &settings, &abort),
            Err(SpimError::Config(_))
        ));
    }

    #[test]
    fn test_deconvolve_files_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image.npy");
        let psf = dir.path().join("psf.npy");
        write_volume(&image, &blob([8, 8, 8], [4.0, 4.0, 4.0])).unwrap();
        write_volume(&psf, &Volume::filled([3, 3, 3], 1.0)).unwrap();
        let output = dir.path().join("result/deconvolved.npy");
        let settings = settings(dir.path());

        let handles = RunHandles::default();
        let result = deconvolve_files(
            &[image.clone(), image.clone()],
            &[psf.clone()],
            &[],
            &output,
            &settings,
            &handles,
        )
        .unwrap();
        assert_eq!(result.stats.len(), 3);
        assert!(output.exists());
        assert!(output.with_extension("json").exists());
        assert!(dir.path().join("result/deconvolved_it0002.npy").exists());

        let missing = deconvolve_files(
            &[dir.path().join("nope.npy")],
            &[psf.clone()],
            &[],
            &output,
            &settings,
            &handles,
        );
        assert!(matches!(missing, Err(SpimError::MissingInput { .. })));

        handles.abort_flag.store(true, Ordering::Relaxed);
        let cancelled = deconvolve_files(&[image], &[psf], &[], &output, &settings, &handles);
        assert!(matches!(cancelled, Err(SpimError::Cancelled)));
    }
}
