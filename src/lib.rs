//! # dental-label-merge
//!
//! This crate remaps per-region dental segmentations to a canonical tooth
//! numbering and merges them into a single labeled volume.
//!
//! Segmentations come as NIfTI files, one per region (inferior `inf` and
//! superior `sup`), each with a JSON mapping from the acquisition's raw
//! codes to canonical codes:
//!  - 1, 2, 3 for the special classes
//!  - 11 to 48 for the teeth (ISO 3950)
//!
//! Subjects are laid out as `<subject>/labels/<rater>/`, with the mappings
//! either next to the volumes or in a `json_mappings/` folder. The folder
//! handed in may be at any of those three depths; [`PathResolver`] works
//! its way back until it finds the pairs.
//!
//! Per subject the [`SubjectPipeline`]
//!  - remaps every region, refusing mappings that name codes the
//!    segmentation doesn't contain
//!  - merges the regions in order, the inferior region winning any voxel
//!    both regions label
//!  - keeps the affine and header of the first region for the output
//!
//! Differing affines are only reported; nothing is resampled.
//!
//! # Examples
//!
//! ## Merging a subject folder
//!
//! ```no_run
//! # use dental_label_merge::{PathResolver, PipelineConfig, SubjectPipeline, VolumeIo, VolumeLoader};
//! let loader = VolumeLoader::new();
//! let pipeline = SubjectPipeline::new(&loader, PipelineConfig::default().with_skip([1]));
//! let merged = pipeline
//!     .process_folder(&PathResolver::default(), "data/006_/labels")
//!     .expect("should have merged the subject");
//! let out = merged.default_output_path().expect("should have found a volume");
//! loader.save(&merged.volume, &out).expect("should have written the result");
//! ```

pub mod enums;
pub mod error;
pub mod mapper;
pub mod mapping;
pub mod merger;
pub mod pipeline;
pub mod resolver;
pub mod volume;
pub mod volume_loader;

pub use enums::{FileKind, FilePattern, Matching, OverlapPolicy, Region};
pub use error::{Error, Result};
pub use mapper::{LabelMapper, MappingIntegrityError, SkipSet};
pub use mapping::{LabelMapping, MappingError, MappingIssue};
pub use merger::{MergeError, MergeOutcome, OverlapReport, RegionMerger};
pub use pipeline::{MergedSubject, PipelineConfig, PipelineWarning, SubjectPipeline};
pub use resolver::{PathResolutionError, PathResolver, RegionPair, ResolverConfig};
pub use volume::{AffineTolerance, LabelVolume};
pub use volume_loader::{VolumeIo, VolumeLoader, VolumeLoaderError};
