//! Locating volume/mapping pairs under a subject folder of unknown depth.
//!
//! Three layouts are accepted for the folder handed in:
//!
//!  - `<subject>/labels/<rater>` (assumed first)
//!  - `<subject>/labels`
//!  - `<subject>`
//!
//! Each layout is a named [`Strategy`]. They are tried in that order and
//! every failure is kept, so an unresolvable subject reports what was
//! looked at and why it was rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;
use thiserror::Error;
use walkdir::WalkDir;

use crate::enums::{FileKind, FilePattern, Matching, Region};

pub const LABELS_DIR: &str = "labels";
pub const JSON_MAPPINGS_DIR: &str = "json_mappings";

/// Rater folders in order of preference
pub const DEFAULT_RATER_ORDER: [&str; 5] = ["R6", "R3", "R2", "R4", "R1"];

/// One region's segmentation and the mapping written for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionPair {
    pub region: Region,
    pub volume: PathBuf,
    pub mapping: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The folder itself is a rater folder
    AsGiven,
    /// The folder is `labels`, the rater folder lives below it
    RaterUnderFolder,
    /// The folder is the subject root
    RaterUnderLabels,
}

impl Strategy {
    pub const ORDER: [Strategy; 3] = [
        Strategy::AsGiven,
        Strategy::RaterUnderFolder,
        Strategy::RaterUnderLabels,
    ];
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::AsGiven => f.write_str("folder as given"),
            Strategy::RaterUnderFolder => f.write_str("rater folder under folder"),
            Strategy::RaterUnderLabels => f.write_str("rater folder under labels/"),
        }
    }
}

/// Why a candidate folder produced no pairs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandidateFailure {
    #[error("none of the rater folders {tried:?} exists")]
    NoRaterFolder { tried: Vec<String> },

    #[error("not a directory")]
    NotADirectory,

    #[error("failed to list folder: {0}")]
    Listing(String),

    #[error("no mapping files found")]
    NoMappings,

    #[error("no volume files found")]
    NoVolumes,

    #[error("found {volumes} volume file(s) but {mappings} mapping file(s)")]
    PairCountMismatch { volumes: usize, mappings: usize },

    #[error("region {region} matches several {kind} files: {files:?}")]
    AmbiguousRegion {
        region: Region,
        kind: FileKind,
        files: Vec<PathBuf>,
    },

    #[error("no mapping file for region {region} (volume {volume:?})")]
    UnpairedRegion { region: Region, volume: PathBuf },

    #[error("cannot tell the region of {kind} file {path:?}")]
    Untagged { kind: FileKind, path: PathBuf },
}

/// One strategy that was tried and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: Strategy,
    pub folder: PathBuf,
    pub failure: CandidateFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct PathResolutionError {
    pub start: PathBuf,
    pub attempts: Vec<Attempt>,
}

impl fmt::Display for PathResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "No valid inputs found for {}! Tried the following folders:",
            self.start.display()
        )?;
        for attempt in &self.attempts {
            write!(
                f,
                "\n  - {} ({}): {}",
                attempt.strategy,
                attempt.folder.display(),
                attempt.failure
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Only this rater folder is considered when set
    pub rater: Option<String>,
    pub rater_order: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            rater: None,
            rater_order: DEFAULT_RATER_ORDER.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl ResolverConfig {
    pub fn with_rater(mut self, rater: impl Into<String>) -> Self {
        self.rater = Some(rater.into());
        self
    }

    fn raters(&self) -> Vec<String> {
        match &self.rater {
            Some(rater) => vec![rater.clone()],
            None => self.rater_order.clone(),
        }
    }
}

static VOLUME_MATCHERS: LazyLock<[FileMatcher; 2]> =
    LazyLock::new(|| FileMatcher::strict_then_loose(FileKind::Volume));
static MAPPING_MATCHERS: LazyLock<[FileMatcher; 2]> =
    LazyLock::new(|| FileMatcher::strict_then_loose(FileKind::Mapping));

/// Compiled [`FilePattern`].
#[derive(Debug)]
struct FileMatcher {
    regex: Regex,
}

impl FileMatcher {
    fn new(kind: FileKind, matching: Matching) -> Self {
        let source = FilePattern::new(kind, matching).regex_source();
        let regex = Regex::new(&source).expect("file patterns are valid regexes");
        Self { regex }
    }

    fn strict_then_loose(kind: FileKind) -> [Self; 2] {
        [
            Self::new(kind, Matching::Strict),
            Self::new(kind, Matching::Loose),
        ]
    }

    fn region_of(&self, path: &Path) -> Option<Region> {
        let name = path.file_name()?.to_str()?;
        let captures = self.regex.captures(name)?;
        Region::from_tag(captures.name("tag")?.as_str())
    }

    fn matches(&self, files: &[PathBuf]) -> Vec<(Region, PathBuf)> {
        files
            .iter()
            .filter_map(|path| Some((self.region_of(path)?, path.clone())))
            .collect()
    }
}

/// Files of a folder, with the contents of a lone subdirectory folded in.
#[derive(Debug, Default)]
struct Listing {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
    /// Set when the files of a lone subdirectory were added
    folded: Option<PathBuf>,
}

impl Listing {
    fn read(folder: &Path) -> Result<Self, CandidateFailure> {
        let mut listing = Listing::default();
        for entry in WalkDir::new(folder)
            .min_depth(1)
            .max_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        {
            let entry = entry.map_err(|e| CandidateFailure::Listing(e.to_string()))?;
            if entry.path().is_dir() {
                listing.dirs.push(entry.into_path());
            } else {
                listing.files.push(entry.into_path());
            }
        }
        Ok(listing)
    }

    fn with_single_subdirectory(folder: &Path) -> Result<Self, CandidateFailure> {
        let mut listing = Self::read(folder)?;
        if let [subdirectory] = listing.dirs.as_slice() {
            let subdirectory = subdirectory.clone();
            let nested = Self::read(&subdirectory)?;
            listing.files.extend(nested.files);
            listing.folded = Some(subdirectory);
        }
        Ok(listing)
    }
}

pub struct PathResolver {
    config: ResolverConfig,
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl PathResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// Find the region pairs for the subject containing `start`.
    ///
    /// Pairs come back sorted by region, so the inferior region is always
    /// processed first.
    ///
    /// # Errors
    ///
    /// Returns [`PathResolutionError`] with every strategy's failure if none
    /// of them yields at least one pair
    pub fn resolve(&self, start: impl AsRef<Path>) -> Result<Vec<RegionPair>, PathResolutionError> {
        let start = start.as_ref();
        let mut attempts = Vec::new();

        for strategy in Strategy::ORDER {
            let (folder, result) = match self.candidate_folder(strategy, start) {
                Ok(folder) => {
                    let result = self.scan(&folder);
                    (folder, result)
                }
                Err((folder, failure)) => (folder, Err(failure)),
            };

            match result {
                Ok(pairs) => {
                    log::debug!("{strategy} resolved {} to {}", start.display(), folder.display());
                    return Ok(pairs);
                }
                Err(failure) => {
                    log::debug!("{strategy} failed at {}: {failure}", folder.display());
                    attempts.push(Attempt {
                        strategy,
                        folder,
                        failure,
                    });
                }
            }
        }

        Err(PathResolutionError {
            start: start.to_path_buf(),
            attempts,
        })
    }

    /// Pair explicitly given files by the region tag in their names
    pub fn pair_files(
        &self,
        volumes: &[PathBuf],
        mappings: &[PathBuf],
    ) -> Result<Vec<RegionPair>, CandidateFailure> {
        let volumes = Self::tag_each(&VOLUME_MATCHERS, FileKind::Volume, volumes)?;
        let mappings = Self::tag_each(&MAPPING_MATCHERS, FileKind::Mapping, mappings)?;
        Self::pair(volumes, mappings)
    }

    fn candidate_folder(
        &self,
        strategy: Strategy,
        start: &Path,
    ) -> Result<PathBuf, (PathBuf, CandidateFailure)> {
        match strategy {
            Strategy::AsGiven => Ok(start.to_path_buf()),
            Strategy::RaterUnderFolder => self.find_rater(start),
            Strategy::RaterUnderLabels => self.find_rater(&start.join(LABELS_DIR)),
        }
    }

    fn find_rater(&self, parent: &Path) -> Result<PathBuf, (PathBuf, CandidateFailure)> {
        let raters = self.config.raters();
        raters
            .iter()
            .map(|rater| parent.join(rater))
            .find(|folder| folder.is_dir())
            .ok_or_else(|| {
                (
                    parent.to_path_buf(),
                    CandidateFailure::NoRaterFolder { tried: raters.clone() },
                )
            })
    }

    fn scan(&self, folder: &Path) -> Result<Vec<RegionPair>, CandidateFailure> {
        if !folder.is_dir() {
            return Err(CandidateFailure::NotADirectory);
        }
        let listing = Listing::with_single_subdirectory(folder)?;

        // A folded-in subdirectory brings its own json_mappings along.
        let mut mapping_sources = Vec::new();
        for parent in std::iter::once(folder).chain(listing.folded.as_deref()) {
            let json_mappings = parent.join(JSON_MAPPINGS_DIR);
            if json_mappings.is_dir() {
                mapping_sources.push(Listing::read(&json_mappings)?.files);
            }
        }
        mapping_sources.push(listing.files.clone());

        let mappings = mapping_sources
            .iter()
            .map(|files| Self::first_match(&MAPPING_MATCHERS, files))
            .find(|found| !found.is_empty())
            .ok_or(CandidateFailure::NoMappings)?;

        let volumes = Self::first_match(&VOLUME_MATCHERS, &listing.files);
        if volumes.is_empty() {
            return Err(CandidateFailure::NoVolumes);
        }

        Self::pair(volumes, mappings)
    }

    // Strict first; loose only when strict finds nothing.
    fn first_match(matchers: &[FileMatcher; 2], files: &[PathBuf]) -> Vec<(Region, PathBuf)> {
        matchers
            .iter()
            .map(|matcher| matcher.matches(files))
            .find(|found| !found.is_empty())
            .unwrap_or_default()
    }

    fn tag_each(
        matchers: &[FileMatcher; 2],
        kind: FileKind,
        files: &[PathBuf],
    ) -> Result<Vec<(Region, PathBuf)>, CandidateFailure> {
        files
            .iter()
            .map(|path| {
                matchers
                    .iter()
                    .find_map(|matcher| matcher.region_of(path))
                    .map(|region| (region, path.clone()))
                    .ok_or_else(|| CandidateFailure::Untagged {
                        kind,
                        path: path.clone(),
                    })
            })
            .collect()
    }

    fn pair(
        volumes: Vec<(Region, PathBuf)>,
        mappings: Vec<(Region, PathBuf)>,
    ) -> Result<Vec<RegionPair>, CandidateFailure> {
        if volumes.len() != mappings.len() {
            return Err(CandidateFailure::PairCountMismatch {
                volumes: volumes.len(),
                mappings: mappings.len(),
            });
        }
        let volumes = Self::by_region(volumes, FileKind::Volume)?;
        let mut mappings = Self::by_region(mappings, FileKind::Mapping)?;

        volumes
            .into_iter()
            .map(|(region, volume)| match mappings.remove(&region) {
                Some(mapping) => Ok(RegionPair {
                    region,
                    volume,
                    mapping,
                }),
                None => Err(CandidateFailure::UnpairedRegion { region, volume }),
            })
            .collect()
    }

    fn by_region(
        files: Vec<(Region, PathBuf)>,
        kind: FileKind,
    ) -> Result<BTreeMap<Region, PathBuf>, CandidateFailure> {
        let mut grouped: BTreeMap<Region, Vec<PathBuf>> = BTreeMap::new();
        for (region, path) in files {
            grouped.entry(region).or_default().push(path);
        }

        grouped
            .into_iter()
            .map(|(region, mut paths)| {
                if paths.len() > 1 {
                    return Err(CandidateFailure::AmbiguousRegion {
                        region,
                        kind,
                        files: paths,
                    });
                }
                Ok((region, paths.remove(0)))
            })
            .collect()
    }
}
