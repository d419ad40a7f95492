//! A single acquisition of the specimen and the bead detections that come with it.

use crate::affine::AffineTransform3D;
use crate::error::{Result, SpimError};
use crate::io;
use crate::volume::{Bounds, Volume};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Position of a view in the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewKey {
    pub timepoint: i32,
    pub channel: i32,
    pub angle: i32,
    pub illumination: i32,
}

impl Display for ViewKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "t{} ch{} angle{} ill{}",
            self.timepoint, self.channel, self.angle, self.illumination
        )
    }
}

/// Reference to a bead of another view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadLink {
    pub bead_id: u32,
    pub view_id: u32,
}

/// A detected bead.
///
/// # Fields
/// - `position`: Location in raw image coordinates (z in slices).
/// - `world`: Location in the reference frame after registration.
/// - `descriptor_correspondences`: Candidate matches from descriptor similarity.
/// - `ransac_correspondences`: Matches confirmed by RANSAC. Only beads with at least one of
///   these take part in PSF extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Bead {
    pub id: u32,
    pub view_id: u32,
    pub position: [f64; 3],
    pub world: [f64; 3],
    pub weight: f64,
    pub descriptor_correspondences: Vec<BeadLink>,
    pub ransac_correspondences: Vec<BeadLink>,
}

impl Bead {
    pub fn new(id: u32, view_id: u32, position: [f64; 3]) -> Self {
        Bead {
            id,
            view_id,
            position,
            world: position,
            weight: 1.0,
            descriptor_correspondences: Vec::new(),
            ransac_correspondences: Vec::new(),
        }
    }

    pub fn is_true_correspondence(&self) -> bool {
        !self.ransac_correspondences.is_empty()
    }
}

/// One acquisition: angle, channel and illumination of a timepoint.
///
/// The raw image is read lazily and cached. It is kept either raw or normalized to [0, 1];
/// the bounds of the raw intensities are remembered so both representations can be
/// reached from each other without reading the file again.
#[derive(Debug)]
pub struct View {
    id: u32,
    key: ViewKey,
    name: String,
    file: PathBuf,
    z_stretching: f64,
    transform: AffineTransform3D,
    beads: Vec<Bead>,
    image_size: Option<[usize; 3]>,
    image: Option<Volume>,
    bounds: Option<Bounds>,
    normalized: bool,
    use_for_registration: bool,
    use_for_fusion: bool,
}

impl View {
    pub fn new(id: u32, key: ViewKey, file: PathBuf, z_stretching: f64) -> Self {
        let name = file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("view{id}"));
        View {
            id,
            key,
            name,
            file,
            z_stretching,
            transform: AffineTransform3D::identity(),
            beads: Vec::new(),
            image_size: None,
            image: None,
            bounds: None,
            normalized: false,
            use_for_registration: true,
            use_for_fusion: true,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key(&self) -> ViewKey {
        self.key
    }

    /// File stem of the image, base name of all per-view side files.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn z_stretching(&self) -> f64 {
        self.z_stretching
    }

    pub fn beads(&self) -> &[Bead] {
        &self.beads
    }

    pub fn set_beads(&mut self, beads: Vec<Bead>) {
        self.beads = beads;
    }

    /// Beads confirmed by RANSAC.
    pub fn true_correspondences(&self) -> impl Iterator<Item = &Bead> {
        self.beads.iter().filter(|b| b.is_true_correspondence())
    }

    pub fn image_size(&self) -> Option<[usize; 3]> {
        self.image_size
    }

    pub fn set_image_size(&mut self, size: [usize; 3]) {
        self.image_size = Some(size);
    }

    pub fn use_for_registration(&self) -> bool {
        self.use_for_registration
    }

    pub fn set_use_for_registration(&mut self, value: bool) {
        self.use_for_registration = value;
    }

    pub fn use_for_fusion(&self) -> bool {
        self.use_for_fusion
    }

    pub fn set_use_for_fusion(&mut self, value: bool) {
        self.use_for_fusion = value;
    }

    /// Transform into the reference frame. Only meaningful once the owning structure has
    /// been registered, which is why it is exposed publicly through
    /// [`ViewStructure::transform`](crate::view_structure::ViewStructure::transform).
    pub(crate) fn transform(&self) -> &AffineTransform3D {
        &self.transform
    }

    pub(crate) fn set_transform(&mut self, transform: AffineTransform3D) {
        self.transform = transform;
    }

    /// Intensity bounds of the raw image, known once it has been normalized.
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn is_image_loaded(&self) -> bool {
        self.image.is_some()
    }

    /// Returns the cached image, reading it on first access.
    ///
    /// # Arguments
    /// - `normalized`: Whether the image should be mapped to [0, 1]. Switching between
    ///   raw and normalized reuses the cached data.
    ///
    /// # Errors
    /// `SpimError::MissingInput` if the image file does not exist, read errors otherwise.
    pub fn image(&mut self, normalized: bool) -> Result<&Volume> {
        let volume = match self.image.take() {
            Some(volume) => volume,
            None => {
                self.normalized = false;
                self.load_image()?
            }
        };
        self.image_size = Some(volume.dims());
        let volume = self.image.insert(volume);

        if normalized && !self.normalized {
            self.bounds = Some(volume.normalize_min_max());
            self.normalized = true;
        } else if !normalized && self.normalized {
            if let Some(bounds) = self.bounds {
                volume.unnormalize_min_max(bounds);
            }
            self.normalized = false;
        }
        Ok(&*volume)
    }

    /// Releases the cached image.
    pub fn close_image(&mut self) {
        if self.image.take().is_some() {
            log::debug!("closed image of view {}", self.name);
        }
        self.normalized = false;
    }

    fn load_image(&self) -> Result<Volume> {
        if !self.file.exists() {
            return Err(SpimError::MissingInput {
                view: self.name.clone(),
                path: self.file.clone(),
            });
        }
        log::info!("loading image of view {} ({})", self.name, self.key);
        let volume = io::read_volume(&self.file)?;
        Ok(volume.with_calibration([1.0, 1.0, self.z_stretching as f32]))
    }
}
