use std::fmt;

/// Anatomical region a segmentation file belongs to.
///
/// Ordering follows processing order: the inferior region is merged first
/// and therefore wins any voxel overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    Inferior,
    Superior,
}

impl Region {
    /// Tag used in file names (`inf.nii.gz`, `sup.json`, ...)
    pub fn tag(self) -> &'static str {
        match self {
            Region::Inferior => "inf",
            Region::Superior => "sup",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "inf" => Some(Region::Inferior),
            "sup" => Some(Region::Superior),
            _ => None,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// NIfTI segmentation, `.nii` or `.nii.gz`
    Volume,
    /// JSON label mapping
    Mapping,
}

impl FileKind {
    fn extension_pattern(self) -> &'static str {
        match self {
            FileKind::Volume => r"\.nii(?:\.gz)?",
            FileKind::Mapping => r"\.json",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Volume => f.write_str("volume"),
            FileKind::Mapping => f.write_str("mapping"),
        }
    }
}

/// How strictly a file name has to look like `<tag>.<ext>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Matching {
    /// The file name is exactly `<tag>.<ext>`
    #[default]
    Strict,
    /// The tag appears anywhere in the file name before the extension
    Loose,
}

/// A (file kind, matching) pair, rendered to a regex with a `tag` capture group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilePattern {
    pub kind: FileKind,
    pub matching: Matching,
}

impl FilePattern {
    pub fn new(kind: FileKind, matching: Matching) -> Self {
        Self { kind, matching }
    }

    pub fn regex_source(&self) -> String {
        let tag = r"(?P<tag>inf|sup)";
        let ext = self.kind.extension_pattern();
        match self.matching {
            Matching::Strict => format!("^{tag}{ext}$"),
            Matching::Loose => format!("{tag}.*{ext}$"),
        }
    }
}

/// What happens when two regions label the same voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlapPolicy {
    /// Keep the already merged codes, clear the incoming region there and warn
    #[default]
    PreferFirst,
    /// Fail the subject
    Abort,
}
