//! Error type shared by every stage of the reconstruction.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors of a reconstruction run.
///
/// Per-view problems that the pipeline can work around (a missing registration or bead
/// file, a degenerate PSF) are logged as warnings instead and never show up here.
#[derive(Debug, Error)]
pub enum SpimError {
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read volume {path:?}: {message}")]
    ReadVolume { path: PathBuf, message: String },
    #[error("failed to write {path:?}: {message}")]
    WriteVolume { path: PathBuf, message: String },
    #[error("malformed {kind} file {path:?}, line {line}: {message}")]
    Parse {
        kind: &'static str,
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("input volume for view '{view}' not found at {path:?}")]
    MissingInput { view: String, path: PathBuf },
    #[error("volume shapes differ: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("affine transform is not invertible (determinant {0:e})")]
    NonInvertible(f64),
    #[error("fft failed: {0}")]
    Fft(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no view is usable for this operation")]
    NoViews,
    #[error("no usable point spread function: {0}")]
    MissingPsf(String),
    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SpimError>;

impl From<cancellable_loops::Cancelled> for SpimError {
    fn from(_: cancellable_loops::Cancelled) -> Self {
        SpimError::Cancelled
    }
}

impl SpimError {
    /// Process exit code reported by the command line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            SpimError::Config(_) => 2,
            SpimError::Io { .. } | SpimError::ReadVolume { .. } | SpimError::MissingInput { .. } => 3,
            SpimError::Parse { .. } => 4,
            SpimError::NoViews | SpimError::MissingPsf(_) => 5,
            SpimError::ShapeMismatch { .. } | SpimError::NonInvertible(_) | SpimError::Fft(_) => 6,
            SpimError::WriteVolume { .. } => 7,
            SpimError::Cancelled => 130,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpimError::Io {
            path: path.into(),
            source,
        }
    }
}
