use std::path::PathBuf;

use thiserror::Error;

use crate::mapper::MappingIntegrityError;
use crate::mapping::MappingError;
use crate::merger::MergeError;
use crate::resolver::{CandidateFailure, PathResolutionError};
use crate::volume_loader::VolumeLoaderError;

pub type Result<T> = std::result::Result<T, Error>;

/// Anything that aborts processing of a subject.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Resolution(#[from] PathResolutionError),

    #[error("Given files don't pair up")]
    Pairing(#[from] CandidateFailure),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Mapping {} doesn't fit its segmentation", .path.display())]
    Integrity {
        path: PathBuf,
        #[source]
        source: MappingIntegrityError,
    },

    #[error("Failed to merge subject {subject}")]
    Merge {
        subject: String,
        #[source]
        source: MergeError,
    },

    #[error(transparent)]
    Volume(#[from] VolumeLoaderError),

    #[error("No region pairs to process")]
    NoRegions,
}
