//! All views of one timepoint and the registration state they are in.
//!
//! A [`ViewStructure`] starts out [`Pending`]: views are known, their dimensions and bead
//! detections can be loaded, but their transforms are not trusted yet. Resolving the
//! registration consumes it and yields a [`Registered`] structure, the only state that
//! exposes transforms to PSF extraction and fusion.

use crate::affine::AffineTransform3D;
use crate::config::{RegistrationSource, SpimConfiguration};
use crate::error::{Result, SpimError};
use crate::io::{self, DIMENSION_EXTENSION, REGISTRATION_EXTENSION, SEGMENTATION_EXTENSION};
use crate::view::View;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Transforms are not resolved yet.
#[derive(Debug)]
pub struct Pending;

/// Every view carries its final transform into the reference frame.
#[derive(Debug)]
pub struct Registered;

#[derive(Debug)]
pub struct ViewStructure<S = Pending> {
    timepoint: i32,
    views: Vec<View>,
    registration_dir: PathBuf,
    state: PhantomData<S>,
}

impl<S> ViewStructure<S> {
    pub fn timepoint(&self) -> i32 {
        self.timepoint
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn view(&self, index: usize) -> &View {
        &self.views[index]
    }

    pub fn view_mut(&mut self, index: usize) -> &mut View {
        &mut self.views[index]
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Position of the view with the given id.
    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.views.iter().position(|v| v.id() == id)
    }

    pub fn registration_dir(&self) -> &Path {
        &self.registration_dir
    }

    fn side_file(&self, view: &View, extension: &str) -> PathBuf {
        io::side_file(&self.registration_dir, view.name(), extension)
    }
}

impl ViewStructure<Pending> {
    pub fn new(timepoint: i32, views: Vec<View>, registration_dir: PathBuf) -> Self {
        ViewStructure {
            timepoint,
            views,
            registration_dir,
            state: PhantomData,
        }
    }

    /// One view per channel, angle and illumination of `timepoint`.
    pub fn from_configuration(conf: &SpimConfiguration, timepoint: i32) -> Result<Self> {
        let views: Vec<View> = conf
            .view_keys(timepoint)?
            .into_iter()
            .enumerate()
            .map(|(id, key)| View::new(id as u32, key, conf.file_for(&key), conf.z_stretching))
            .collect();
        if views.is_empty() {
            return Err(SpimError::NoViews);
        }
        log::info!("timepoint {timepoint}: {} views", views.len());
        Ok(Self::new(timepoint, views, conf.registration_dir()))
    }

    /// Reads the image dimensions of every view.
    ///
    /// Views without a readable `.dim` file have their image opened instead and the file is
    /// written for the next run. Views whose image cannot be opened either are excluded
    /// from registration and fusion.
    pub fn load_dimensions(&mut self) {
        for index in 0..self.views.len() {
            let path = self.side_file(&self.views[index], DIMENSION_EXTENSION);
            let view = &mut self.views[index];
            match io::read_dimensions(&path) {
                Ok(dims) => view.set_image_size(dims),
                Err(err) => {
                    log::warn!(
                        "cannot read dimensions of view {}: {err}, opening the image instead",
                        view.name()
                    );
                    let dims = match view.image(false) {
                        Ok(image) => image.dims(),
                        Err(err) => {
                            log::error!("view {} is unusable: {err}", view.name());
                            view.set_use_for_registration(false);
                            view.set_use_for_fusion(false);
                            continue;
                        }
                    };
                    view.close_image();
                    if let Err(err) = io::write_dimensions(&path, dims) {
                        log::warn!("cannot write {path:?}: {err}");
                    }
                }
            }
        }
    }

    /// Reads the bead detections of every view.
    ///
    /// A missing or malformed segmentation excludes the view from registration only.
    pub fn load_segmentation(&mut self) {
        for index in 0..self.views.len() {
            let path = self.side_file(&self.views[index], SEGMENTATION_EXTENSION);
            let view = &mut self.views[index];
            match io::read_segmentation(&path) {
                Ok(beads) => {
                    log::info!(
                        "view {}: {} beads, {} with RANSAC correspondences",
                        view.name(),
                        beads.len(),
                        beads.iter().filter(|b| b.is_true_correspondence()).count()
                    );
                    view.set_beads(beads);
                }
                Err(err) => {
                    log::warn!("cannot read segmentation of view {}: {err}", view.name());
                    view.set_use_for_registration(false);
                }
            }
        }
    }

    /// Fixes the transform of every view.
    ///
    /// Registration files hold models on z-scaled coordinates, the axial scaling of the
    /// view is appended to them. A view whose registration cannot be read keeps the axial
    /// scaling only, is excluded from registration, and takes part in fusion only if
    /// `fuse_unregistered` is set.
    pub fn resolve_registration(
        mut self,
        source: RegistrationSource,
        fuse_unregistered: bool,
    ) -> ViewStructure<Registered> {
        for index in 0..self.views.len() {
            let path = self.side_file(&self.views[index], REGISTRATION_EXTENSION);
            let view = &mut self.views[index];
            let z = view.z_stretching();
            let axial = AffineTransform3D::identity().concatenate_axial_scaling(z);

            let transform = match source {
                RegistrationSource::Identity => axial,
                RegistrationSource::Files => match io::read_registration(&path) {
                    Ok(record) => {
                        if let Some(stored) = record.z_scaling {
                            if (stored - z).abs() > 1e-3 * z {
                                log::warn!(
                                    "view {} was registered with z-scaling {stored}, using {z}",
                                    view.name()
                                );
                            }
                        }
                        record.transform.concatenate_axial_scaling(z)
                    }
                    Err(err) => {
                        log::warn!("cannot read registration of view {}: {err}", view.name());
                        view.set_use_for_registration(false);
                        if !fuse_unregistered {
                            view.set_use_for_fusion(false);
                        }
                        axial
                    }
                },
            };
            view.set_transform(transform);
        }

        ViewStructure {
            timepoint: self.timepoint,
            views: self.views,
            registration_dir: self.registration_dir,
            state: PhantomData,
        }
    }
}

impl ViewStructure<Registered> {
    /// Transform of a view from raw image coordinates into the reference frame.
    pub fn transform(&self, index: usize) -> &AffineTransform3D {
        self.views[index].transform()
    }

    /// Indices of the views of `channel` that take part in fusion.
    pub fn fusion_views(&self, channel: i32) -> Vec<usize> {
        self.views
            .iter()
            .enumerate()
            .filter(|(_, v)| v.use_for_fusion() && v.key().channel == channel)
            .map(|(i, _)| i)
            .collect()
    }
}
