use fidreg_math::{CpdError, ImRefError, TransformError, WarpError};
use thiserror::Error;

use crate::mode::TransformMode;

/// Errors surfaced by bead detection, matching and registration
///
/// Per-bead fit failures never show up here; they are filtered out while a
/// cloud is built (see [`crate::fit::FitError`]).
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Invalid argument: {0}")]
    ArgumentError(String),

    #[error(
        "unknown transform mode '{0}', expected one of: {names}",
        names = TransformMode::NAMES.join(", ")
    )]
    UnknownMode(String),

    #[error("unknown channel label '{label}', known labels: [{}]", .known.join(", "))]
    UnknownLabel { label: String, known: Vec<String> },

    #[error("got {clouds} clouds but {labels} labels")]
    LabelCountMismatch { clouds: usize, labels: usize },

    #[error("duplicate channel label '{0}'")]
    DuplicateLabel(String),

    #[error("no points survived matching between channels [{}]", .labels.join(", "))]
    NoMatchingPoints { labels: Vec<String> },

    #[error("cloud has no image data attached")]
    NoImageData,

    #[error("invalid volume: {0}")]
    InvalidVolume(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Cpd(#[from] CpdError),

    #[error(transparent)]
    ImRef(#[from] ImRefError),

    #[error(transparent)]
    Warp(#[from] WarpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
