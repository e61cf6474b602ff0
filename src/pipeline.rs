use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::enums::{OverlapPolicy, Region};
use crate::error::{Error, Result};
use crate::mapper::{LabelMapper, SkipSet};
use crate::mapping::{LabelMapping, MappingError, MappingIssue};
use crate::merger::{MergeError, OverlapReport, RegionMerger};
use crate::resolver::{PathResolver, RegionPair};
use crate::volume::{AffineTolerance, LabelVolume, orientation_codes};
use crate::volume_loader::VolumeIo;

/// File name used when no output path is given
pub const DEFAULT_OUTPUT_NAME: &str = "labels_mapped.nii.gz";

/// Rewrite of several canonical codes into one, applied after merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collapse {
    pub codes: BTreeSet<u16>,
    pub into: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub skip: Option<SkipSet>,
    pub overlap_policy: OverlapPolicy,
    /// Where to write the overlap mask when [`OverlapPolicy::Abort`] trips
    pub overlap_mask: Option<PathBuf>,
    /// Treat canonical codes outside the taxonomy as fatal
    pub strict_taxonomy: bool,
    pub affine_tolerance: AffineTolerance,
    pub collapse: Option<Collapse>,
}

impl PipelineConfig {
    pub fn with_skip(mut self, skip: impl IntoIterator<Item = u16>) -> Self {
        self.skip = Some(skip.into_iter().collect());
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn with_overlap_mask(mut self, path: impl Into<PathBuf>) -> Self {
        self.overlap_mask = Some(path.into());
        self
    }

    pub fn with_strict_taxonomy(mut self, strict: bool) -> Self {
        self.strict_taxonomy = strict;
        self
    }

    pub fn with_collapse(mut self, codes: impl IntoIterator<Item = u16>, into: u16) -> Self {
        self.collapse = Some(Collapse {
            codes: codes.into_iter().collect(),
            into,
        });
        self
    }
}

/// Recoverable problem noticed while processing a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineWarning {
    Mapping {
        path: PathBuf,
        issue: MappingIssue,
    },
    SpatialMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    Overlap {
        path: PathBuf,
        region: Region,
        report: OverlapReport,
    },
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::Mapping { path, issue } => {
                write!(f, "{}: {issue}; it's up to you if this is a problem", path.display())
            }
            PipelineWarning::SpatialMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "Affine of {} doesn't match the first segmentation, proceed with caution. \
                 Observed orientations: \"{expected}\" and \"{found}\"",
                path.display()
            ),
            PipelineWarning::Overlap {
                path,
                region,
                report,
            } => write!(
                f,
                "Overlap between segmentations, emptied the {region} region ({}) where \
                 already labeled: {report}",
                path.display()
            ),
        }
    }
}

/// Merged volume of one subject, ready to be written.
#[derive(Debug)]
pub struct MergedSubject {
    /// Carries the affine and header of the first region
    pub volume: LabelVolume,
    pub subject: String,
    pub pairs: Vec<RegionPair>,
    pub warnings: Vec<PipelineWarning>,
}

impl MergedSubject {
    /// `labels_mapped.nii.gz` next to the first region's volume
    pub fn default_output_path(&self) -> Option<PathBuf> {
        default_output_path(&self.pairs)
    }
}

pub fn default_output_path(pairs: &[RegionPair]) -> Option<PathBuf> {
    let first = pairs.first()?;
    let folder = first.volume.parent().unwrap_or(Path::new(""));
    Some(folder.join(DEFAULT_OUTPUT_NAME))
}

/// Region being built up; the first region loaded fixes the output frame.
struct Accumulator {
    volume: LabelVolume,
    subject: String,
}

pub struct SubjectPipeline<'a, Io: VolumeIo> {
    io: &'a Io,
    config: PipelineConfig,
}

impl<'a, Io: VolumeIo> SubjectPipeline<'a, Io> {
    pub fn new(io: &'a Io, config: PipelineConfig) -> Self {
        Self { io, config }
    }

    /// Resolve `folder` and process the pairs found there
    pub fn process_folder(
        &self,
        resolver: &PathResolver,
        folder: impl AsRef<Path>,
    ) -> Result<MergedSubject> {
        let pairs = resolver.resolve(folder)?;
        self.run(&pairs)
    }

    /// Remap every pair and merge them in order, earlier regions winning overlaps
    ///
    /// # Errors
    ///
    /// Fails on unreadable inputs, incomplete mappings, shape mismatches and,
    /// under [`OverlapPolicy::Abort`], on any overlap
    pub fn run(&self, pairs: &[RegionPair]) -> Result<MergedSubject> {
        let mut warnings = Vec::new();
        let mut accumulator: Option<Accumulator> = None;

        for pair in pairs {
            let (volume, mapping) = self.load_region(pair, &mut warnings)?;
            accumulator = Some(match accumulator.take() {
                None => Accumulator {
                    volume: self.remap(pair, &volume, &mapping)?,
                    subject: mapping.subject().to_string(),
                },
                Some(accumulator) => {
                    self.merge_region(accumulator, pair, volume, &mapping, &mut warnings)?
                }
            });
        }

        let Accumulator { volume, subject } = accumulator.ok_or(Error::NoRegions)?;
        let volume = match &self.config.collapse {
            Some(collapse) => LabelMapper::collapse(volume, &collapse.codes, collapse.into),
            None => volume,
        };

        log::info!(
            "Subject {subject}: merged {} region(s), {} labeled voxel(s)",
            pairs.len(),
            volume.count_labeled()
        );
        Ok(MergedSubject {
            volume,
            subject,
            pairs: pairs.to_vec(),
            warnings,
        })
    }

    fn load_region(
        &self,
        pair: &RegionPair,
        warnings: &mut Vec<PipelineWarning>,
    ) -> Result<(LabelVolume, LabelMapping)> {
        log::info!("Processing file {}", pair.volume.display());
        let volume = self.io.load(&pair.volume)?;
        let mapping = LabelMapping::load(&pair.mapping)?;

        for issue in mapping.sanity_check() {
            if let (MappingIssue::NonCanonicalValues(codes), true) =
                (&issue, self.config.strict_taxonomy)
            {
                return Err(MappingError::Taxonomy {
                    path: pair.mapping.clone(),
                    codes: codes.clone(),
                }
                .into());
            }
            warn(
                warnings,
                PipelineWarning::Mapping {
                    path: pair.mapping.clone(),
                    issue,
                },
            );
        }

        Ok((volume, mapping))
    }

    fn remap(
        &self,
        pair: &RegionPair,
        volume: &LabelVolume,
        mapping: &LabelMapping,
    ) -> Result<LabelVolume> {
        LabelMapper::remap(volume, mapping, self.config.skip.as_ref()).map_err(|source| {
            Error::Integrity {
                path: pair.mapping.clone(),
                source,
            }
        })
    }

    fn merge_region(
        &self,
        accumulator: Accumulator,
        pair: &RegionPair,
        volume: LabelVolume,
        mapping: &LabelMapping,
        warnings: &mut Vec<PipelineWarning>,
    ) -> Result<Accumulator> {
        let Accumulator {
            volume: merged,
            subject,
        } = accumulator;

        if !self
            .config
            .affine_tolerance
            .is_close(&merged.affine, &volume.affine)
        {
            warn(
                warnings,
                PipelineWarning::SpatialMismatch {
                    path: pair.volume.clone(),
                    expected: orientation_codes(&merged.affine),
                    found: orientation_codes(&volume.affine),
                },
            );
        }

        let mapped = self.remap(pair, &volume, mapping)?;
        drop(volume);

        let frame = (merged.affine, merged.header.clone());
        match RegionMerger::merge(merged, mapped, self.config.overlap_policy) {
            Ok(outcome) => {
                if let Some(report) = outcome.overlap {
                    warn(
                        warnings,
                        PipelineWarning::Overlap {
                            path: pair.volume.clone(),
                            region: pair.region,
                            report,
                        },
                    );
                }
                Ok(Accumulator {
                    volume: outcome.volume,
                    subject,
                })
            }
            Err(MergeError::Overlap { report, mask }) => {
                if let Some(path) = &self.config.overlap_mask {
                    let (affine, header) = frame;
                    let debug = LabelVolume::new(mask.mapv(u16::from), affine, header);
                    self.io.save(&debug, path)?;
                    log::error!("Wrote overlap mask of subject {subject} to {}", path.display());
                }
                Err(Error::Merge {
                    subject,
                    source: MergeError::Overlap { report, mask },
                })
            }
            Err(source) => Err(Error::Merge { subject, source }),
        }
    }
}

fn warn(warnings: &mut Vec<PipelineWarning>, warning: PipelineWarning) {
    log::warn!("{warning}");
    warnings.push(warning);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::IDENTITY_AFFINE;
    use crate::volume_loader::VolumeLoaderError;
    use ndarray::Array3;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemoryIo {
        volumes: RefCell<HashMap<PathBuf, LabelVolume>>,
    }

    impl MemoryIo {
        fn insert(&self, path: &Path, volume: LabelVolume) {
            self.volumes.borrow_mut().insert(path.to_path_buf(), volume);
        }

        fn get(&self, path: &Path) -> Option<LabelVolume> {
            self.volumes.borrow().get(path).cloned()
        }
    }

    impl VolumeIo for MemoryIo {
        fn load(&self, path: &Path) -> std::result::Result<LabelVolume, VolumeLoaderError> {
            self.get(path)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound).into())
        }

        fn save(
            &self,
            volume: &LabelVolume,
            path: &Path,
        ) -> std::result::Result<(), VolumeLoaderError> {
            self.insert(path, volume.clone());
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        io: MemoryIo,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                io: MemoryIo::default(),
            }
        }

        fn region(
            &self,
            region: Region,
            codes: &[([usize; 3], u16)],
            mapping_json: &str,
        ) -> RegionPair {
            let mut data = Array3::<u16>::zeros((5, 5, 5));
            for &(index, code) in codes {
                data[index] = code;
            }
            let volume = self.dir.path().join(format!("{region}.nii.gz"));
            let mapping = self.dir.path().join(format!("{region}.json"));
            self.io.insert(&volume, LabelVolume::from_data(data));
            fs::write(&mapping, mapping_json).unwrap();
            RegionPair {
                region,
                volume,
                mapping,
            }
        }
    }

    #[test]
    fn test_single_region_is_remapped_only() {
        let fixture = Fixture::new();
        let inf = fixture.region(
            Region::Inferior,
            &[([0, 0, 0], 7), ([1, 0, 0], 8)],
            r#"{"labels_mapping": {"7": 31, "8": 32}, "patient_name": "006"}"#,
        );

        let pipeline = SubjectPipeline::new(&fixture.io, PipelineConfig::default());
        let merged = pipeline.run(&[inf]).unwrap();

        assert_eq!(merged.subject, "006");
        assert_eq!(merged.volume.data[[0, 0, 0]], 31);
        assert_eq!(merged.volume.data[[1, 0, 0]], 32);
        assert!(merged.warnings.is_empty());
        assert_eq!(
            merged.default_output_path(),
            Some(fixture.dir.path().join(DEFAULT_OUTPUT_NAME))
        );
    }

    #[test]
    fn test_overlap_prefers_first_region() {
        let fixture = Fixture::new();
        let inf = fixture.region(
            Region::Inferior,
            &[([0, 0, 0], 7)],
            r#"{"labels_mapping": {"7": 21}}"#,
        );
        let sup = fixture.region(
            Region::Superior,
            &[([0, 0, 0], 9), ([4, 4, 4], 9)],
            r#"{"labels_mapping": {"9": 21}}"#,
        );

        let pipeline = SubjectPipeline::new(&fixture.io, PipelineConfig::default());
        let merged = pipeline.run(&[inf, sup.clone()]).unwrap();

        assert_eq!(merged.volume.data[[0, 0, 0]], 21);
        assert_eq!(merged.volume.data[[4, 4, 4]], 21);
        assert_eq!(merged.subject, "unknown");
        assert!(merged.warnings.iter().any(|w| matches!(
            w,
            PipelineWarning::Overlap { region: Region::Superior, path, .. } if *path == sup.volume
        )));
    }

    #[test]
    fn test_spatial_mismatch_is_warning_only() {
        let fixture = Fixture::new();
        let inf = fixture.region(Region::Inferior, &[([0, 0, 0], 1)], r#"{"labels_mapping": {"1": 31}}"#);
        let sup = fixture.region(Region::Superior, &[([1, 1, 1], 1)], r#"{"labels_mapping": {"1": 11}}"#);

        let mut shifted = fixture.io.get(&sup.volume).unwrap();
        shifted.affine = IDENTITY_AFFINE;
        shifted.affine[0][0] = -1.0;
        fixture.io.insert(&sup.volume, shifted);

        let pipeline = SubjectPipeline::new(&fixture.io, PipelineConfig::default());
        let merged = pipeline.run(&[inf, sup]).unwrap();

        assert_eq!(merged.volume.data[[1, 1, 1]], 11);
        assert_eq!(merged.volume.affine, IDENTITY_AFFINE);
        assert!(merged.warnings.contains(&PipelineWarning::SpatialMismatch {
            path: fixture.dir.path().join("sup.nii.gz"),
            expected: "RAS".to_string(),
            found: "LAS".to_string(),
        }));
    }

    #[test]
    fn test_skip_and_collapse() {
        let fixture = Fixture::new();
        let inf = fixture.region(
            Region::Inferior,
            &[([0, 0, 0], 1), ([1, 0, 0], 3), ([2, 0, 0], 4)],
            r#"{"labels_mapping": {"1": 40, "3": 40, "4": 31}}"#,
        );
        let sup = fixture.region(
            Region::Superior,
            &[([3, 0, 0], 2)],
            r#"{"labels_mapping": {"2": 11}}"#,
        );

        let config = PipelineConfig::default()
            .with_skip([40])
            .with_collapse([31, 11], 1);
        let pipeline = SubjectPipeline::new(&fixture.io, config);
        let merged = pipeline.run(&[inf, sup]).unwrap();

        let data = &merged.volume.data;
        assert_eq!((data[[0, 0, 0]], data[[1, 0, 0]]), (0, 0));
        assert_eq!((data[[2, 0, 0]], data[[3, 0, 0]]), (1, 1));
        assert!(merged.warnings.iter().any(|w| matches!(
            w,
            PipelineWarning::Mapping { issue: MappingIssue::DuplicateValues(v), .. } if *v == vec![40]
        )));
    }

    #[test]
    fn test_integrity_error_aborts() {
        let fixture = Fixture::new();
        let inf = fixture.region(Region::Inferior, &[([0, 0, 0], 1)], r#"{"labels_mapping": {"2": 31}}"#);

        let pipeline = SubjectPipeline::new(&fixture.io, PipelineConfig::default());
        let err = pipeline.run(&[inf.clone()]).unwrap_err();
        match err {
            Error::Integrity { path, source } => {
                assert_eq!(path, inf.mapping);
                assert_eq!(source.missing, vec![(2, 31)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_strict_taxonomy() {
        let fixture = Fixture::new();
        let inf = fixture.region(Region::Inferior, &[([0, 0, 0], 1)], r#"{"labels_mapping": {"1": 99}}"#);

        let lenient = SubjectPipeline::new(&fixture.io, PipelineConfig::default());
        let merged = lenient.run(std::slice::from_ref(&inf)).unwrap();
        assert_eq!(merged.volume.data[[0, 0, 0]], 99);
        assert_eq!(merged.warnings.len(), 1);

        let strict =
            SubjectPipeline::new(&fixture.io, PipelineConfig::default().with_strict_taxonomy(true));
        let err = strict.run(&[inf]).unwrap_err();
        assert!(matches!(err, Error::Mapping(MappingError::Taxonomy { .. })));
    }

    #[test]
    fn test_abort_policy_writes_mask() {
        let fixture = Fixture::new();
        let inf = fixture.region(Region::Inferior, &[([0, 0, 0], 7)], r#"{"labels_mapping": {"7": 31}}"#);
        let sup = fixture.region(Region::Superior, &[([0, 0, 0], 9)], r#"{"labels_mapping": {"9": 11}}"#);
        let mask_path = fixture.dir.path().join("overlap.nii.gz");

        let config = PipelineConfig::default()
            .with_overlap_policy(OverlapPolicy::Abort)
            .with_overlap_mask(&mask_path);
        let pipeline = SubjectPipeline::new(&fixture.io, config);
        let err = pipeline.run(&[inf, sup]).unwrap_err();

        assert!(matches!(
            err,
            Error::Merge {
                source: MergeError::Overlap { .. },
                ..
            }
        ));
        let mask = fixture.io.get(&mask_path).unwrap();
        assert_eq!(mask.data[[0, 0, 0]], 1);
        assert_eq!(mask.count_labeled(), 1);
    }

    #[test]
    fn test_no_pairs() {
        let io = MemoryIo::default();
        let pipeline = SubjectPipeline::new(&io, PipelineConfig::default());
        assert!(matches!(pipeline.run(&[]), Err(Error::NoRegions)));
    }
}
