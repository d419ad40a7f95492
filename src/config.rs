//! Configuration of a reconstruction run.
//!
//! A run is described by a [`RunConfig`] JSON file: where the views of the acquisition
//! live ([`SpimConfiguration`]) and how they are deconvolved ([`DeconvolutionSettings`]).
//! The deconvolution settings of the last successful run are stored with `preferences`
//! and serve as defaults for sections missing from the run file.

use crate::error::{Result, SpimError};
use crate::math_tools::parse_integer_pattern;
use crate::view::ViewKey;
use preferences::{AppInfo, Preferences};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const APP_INFO: AppInfo = AppInfo {
    name: "SPIM Deconvolution",
    author: "spim-deconvolution",
};

/// Preferences key of the stored deconvolution settings.
pub const SETTINGS_KEY: &str = "config/deconvolution";

/// How the per-view contributions are combined into the next estimate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Weighted geometric mean of the contributions.
    #[default]
    Multiplicative,
    /// Weighted arithmetic mean of the contributions.
    Additive,
}

/// Where the transformations of the views come from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationSource {
    /// `<name>.registration` files in the registration directory.
    #[default]
    Files,
    /// All views are already aligned, only the axial scaling is applied.
    Identity,
}

/// Window used to cut PSFs out of the bead images.
///
/// # Fields
/// - `size`: Edge length in voxels.
/// - `isotropic`: If false, the z extent is enlarged for small z-stretching factors.
/// - `size3d`: Explicit per-axis size, overrides both fields above.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PsfWindow {
    pub size: usize,
    pub isotropic: bool,
    pub size3d: Option<[usize; 3]>,
}

impl Default for PsfWindow {
    fn default() -> Self {
        PsfWindow {
            size: 17,
            isotropic: true,
            size3d: None,
        }
    }
}

/// Origin of the point spread functions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PsfSource {
    /// Average the RANSAC confirmed beads of every view.
    #[default]
    Extract,
    /// Read one `.npy` PSF per view of a timepoint, ordered by channel, angle and
    /// illumination like the views themselves. Every timepoint uses the same files.
    Load {
        files: Vec<PathBuf>,
        /// The files are already in the reference frame and are not transformed again.
        already_transformed: bool,
    },
}

/// Kernel every view is deconvolved with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelChoice {
    /// The transformed PSF of the view itself.
    #[default]
    PerView,
    /// The average of all transformed PSFs.
    Average,
}

/// Part of the fusion frame that is reconstructed, in voxels of the frame.
///
/// A size of 0 extends the region to the end of the frame along that axis.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRegion {
    pub offset: [usize; 3],
    pub size: [usize; 3],
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct DeconvolutionSettings {
    pub min_iterations: usize,
    pub max_iterations: usize,
    pub update_mode: UpdateMode,
    /// Tikhonov regularization, 0 disables it.
    pub lambda: f64,
    pub psf_window: PsfWindow,
    pub psf_source: PsfSource,
    pub kernel: KernelChoice,
    /// Worker threads, 0 uses every core.
    pub threads: usize,
    /// Write the current estimate every n iterations.
    pub debug_interval: Option<usize>,
    /// Stop early once the mean change per voxel drops below this value.
    pub convergence_threshold: Option<f64>,
    /// Lower bound of every voxel of the estimate.
    pub min_value: f32,
    /// Width of the cosine ramp at view borders in voxels, 0 disables blending.
    pub blending_border: f64,
    /// Subtracted from every normalized intensity before deconvolution.
    pub background: f32,
    /// Reconstruct only this part of the fusion frame.
    pub crop: Option<CropRegion>,
    pub output_dir: PathBuf,
    pub save_psfs: bool,
}

impl Default for DeconvolutionSettings {
    fn default() -> Self {
        DeconvolutionSettings {
            min_iterations: 20,
            max_iterations: 50,
            update_mode: UpdateMode::default(),
            lambda: 0.006,
            psf_window: PsfWindow::default(),
            psf_source: PsfSource::default(),
            kernel: KernelChoice::default(),
            threads: 0,
            debug_interval: None,
            convergence_threshold: None,
            min_value: 1e-4,
            blending_border: 0.0,
            background: 0.0,
            crop: None,
            output_dir: home::home_dir()
                .unwrap_or_default()
                .join("spim-deconvolution"),
            save_psfs: true,
        }
    }
}

impl DeconvolutionSettings {
    /// Loads the settings of the last run, falling back to (and storing) the defaults.
    pub fn load_preferences() -> Self {
        match DeconvolutionSettings::load(&APP_INFO, SETTINGS_KEY) {
            Ok(settings) => settings,
            Err(err) => {
                log::debug!("no stored settings ({err:?}), using defaults");
                let settings = DeconvolutionSettings::default();
                settings.store_preferences();
                settings
            }
        }
    }

    pub fn store_preferences(&self) {
        if let Err(err) = self.save(&APP_INFO, SETTINGS_KEY) {
            log::error!("error in saving settings: {err:?}");
        }
    }

    /// Number of worker threads to use.
    pub fn thread_count(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| Err(SpimError::Config(message.to_string()));
        if self.max_iterations == 0 {
            return fail("max_iterations must be at least 1");
        }
        if self.min_iterations > self.max_iterations {
            return fail("min_iterations must not exceed max_iterations");
        }
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return fail("lambda must be a non-negative number");
        }
        if !(self.min_value > 0.0) {
            return fail("min_value must be positive");
        }
        if self.psf_window.size == 0 || self.psf_window.size3d.is_some_and(|s| s.contains(&0)) {
            return fail("PSF window sizes must be positive");
        }
        if self.debug_interval == Some(0) {
            return fail("debug_interval must be positive");
        }
        if self.convergence_threshold.is_some_and(|t| !(t > 0.0)) {
            return fail("convergence_threshold must be positive");
        }
        if let PsfSource::Load { files, .. } = &self.psf_source {
            if files.is_empty() {
                return fail("loading PSFs requires at least one file");
            }
        }
        Ok(())
    }
}

/// Acquisition layout: which files make up the views of each timepoint.
///
/// The file pattern contains placeholders `{t..}`, `{c..}`, `{a..}` and `{i..}` for
/// timepoint, channel, angle and illumination; the number of letters is the zero padded
/// width, e.g. `spim_TL{tt}_Angle{aaa}.npy`.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct SpimConfiguration {
    pub input_dir: PathBuf,
    pub file_pattern: String,
    pub timepoints: String,
    pub channels: String,
    pub angles: String,
    pub illuminations: String,
    /// Defaults to `<input_dir>/registration`.
    pub registration_dir: Option<PathBuf>,
    /// Ratio of z spacing to xy spacing.
    pub z_stretching: f64,
    pub registration_source: RegistrationSource,
    /// Views without a readable registration are still fused with the axial scaling only.
    pub fuse_unregistered_views: bool,
}

impl Default for SpimConfiguration {
    fn default() -> Self {
        SpimConfiguration {
            input_dir: home::home_dir().unwrap_or_default(),
            file_pattern: "spim_TL{tt}_Angle{a}.npy".to_string(),
            timepoints: "1".to_string(),
            channels: String::new(),
            angles: "0-270:45".to_string(),
            illuminations: String::new(),
            registration_dir: None,
            z_stretching: 1.0,
            registration_source: RegistrationSource::default(),
            fuse_unregistered_views: false,
        }
    }
}

impl SpimConfiguration {
    fn pattern(name: &str, pattern: &str, default: Option<i32>) -> Result<Vec<i32>> {
        let values = parse_integer_pattern(pattern).map_err(SpimError::Config)?;
        match (values.is_empty(), default) {
            (true, Some(value)) => Ok(vec![value]),
            (true, None) => Err(SpimError::Config(format!("no {name} given"))),
            (false, _) => Ok(values),
        }
    }

    pub fn timepoint_list(&self) -> Result<Vec<i32>> {
        Self::pattern("timepoints", &self.timepoints, None)
    }

    pub fn channel_list(&self) -> Result<Vec<i32>> {
        Self::pattern("channels", &self.channels, Some(0))
    }

    pub fn angle_list(&self) -> Result<Vec<i32>> {
        Self::pattern("angles", &self.angles, None)
    }

    pub fn illumination_list(&self) -> Result<Vec<i32>> {
        Self::pattern("illuminations", &self.illuminations, Some(0))
    }

    pub fn registration_dir(&self) -> PathBuf {
        self.registration_dir
            .clone()
            .unwrap_or_else(|| self.input_dir.join("registration"))
    }

    /// All views of one timepoint, ordered by channel, angle and illumination.
    pub fn view_keys(&self, timepoint: i32) -> Result<Vec<ViewKey>> {
        let mut keys = Vec::new();
        for channel in self.channel_list()? {
            for angle in self.angle_list()? {
                for illumination in self.illumination_list()? {
                    keys.push(ViewKey {
                        timepoint,
                        channel,
                        angle,
                        illumination,
                    });
                }
            }
        }
        Ok(keys)
    }

    pub fn file_for(&self, key: &ViewKey) -> PathBuf {
        self.input_dir.join(fill_pattern(&self.file_pattern, key))
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.z_stretching > 0.0) || !self.z_stretching.is_finite() {
            return Err(SpimError::Config(
                "z_stretching must be a positive number".to_string(),
            ));
        }
        self.timepoint_list()?;
        self.channel_list()?;
        self.angle_list()?;
        self.illumination_list()?;
        Ok(())
    }
}

/// Replaces `{t..}`, `{c..}`, `{a..}` and `{i..}` placeholders with zero padded values.
/// Anything else in braces is kept verbatim.
pub fn fill_pattern(pattern: &str, key: &ViewKey) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('}') else {
            break;
        };
        let inner = &tail[1..close];
        let value = match inner.chars().next() {
            Some(letter) if inner.chars().all(|c| c == letter) => match letter {
                't' => Some(key.timepoint),
                'c' => Some(key.channel),
                'a' => Some(key.angle),
                'i' => Some(key.illumination),
                _ => None,
            },
            _ => None,
        };
        match value {
            Some(value) => out.push_str(&format!("{value:0width$}", width = inner.len())),
            None => out.push_str(&tail[..=close]),
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Everything a run needs, as read from a JSON file.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(default)]
pub struct RunConfig {
    pub acquisition: SpimConfiguration,
    pub deconvolution: DeconvolutionSettings,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        self.acquisition.validate()?;
        self.deconvolution.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ViewKey {
        ViewKey {
            timepoint: 7,
            channel: 1,
            angle: 45,
            illumination: 0,
        }
    }

    #[test]
    fn test_fill_pattern_pads_placeholders() {
        assert_eq!(
            fill_pattern("spim_TL{tt}_Angle{aaa}_Ch{c}.npy", &key()),
            "spim_TL07_Angle045_Ch1.npy"
        );
        assert_eq!(fill_pattern("{x}_{a}{", &key()), "{x}_45{");
        assert_eq!(fill_pattern("ill{ii}", &key()), "ill00");
    }

    #[test]
    fn test_view_keys_cover_every_combination() {
        let conf = SpimConfiguration {
            angles: "0-90:45".to_string(),
            illuminations: "0,1".to_string(),
            ..SpimConfiguration::default()
        };
        let keys = conf.view_keys(3).unwrap();
        assert_eq!(keys.len(), 6);
        assert!(keys.iter().all(|k| k.timepoint == 3 && k.channel == 0));
        assert_eq!(keys[1].illumination, 1);
        assert_eq!(keys[2].angle, 45);
    }

    #[test]
    fn test_missing_timepoints_is_config_error() {
        let conf = SpimConfiguration {
            timepoints: " ".to_string(),
            ..SpimConfiguration::default()
        };
        assert!(matches!(conf.timepoint_list(), Err(SpimError::Config(_))));
    }

    #[test]
    fn test_default_settings_are_valid() {
        assert!(DeconvolutionSettings::default().validate().is_ok());
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = DeconvolutionSettings {
            min_iterations: 10,
            max_iterations: 5,
            ..DeconvolutionSettings::default()
        };
        assert!(settings.validate().is_err());
        let settings = DeconvolutionSettings {
            psf_source: PsfSource::Load {
                files: vec![],
                already_transformed: true,
            },
            ..DeconvolutionSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_run_file_uses_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"acquisition": {"angles": "0,90"}, "deconvolution": {"update_mode": "additive",
                "psf_source": {"kind": "load", "files": ["a.npy"], "already_transformed": false}}}"#,
        )
        .unwrap();
        assert_eq!(config.acquisition.angle_list().unwrap(), vec![0, 90]);
        assert_eq!(config.deconvolution.update_mode, UpdateMode::Additive);
        assert_eq!(config.deconvolution.max_iterations, 50);
        assert!(matches!(
            config.deconvolution.psf_source,
            PsfSource::Load {
                already_transformed: false,
                ..
            }
        ));
    }
}
