//! Label-mapping files: raw acquisition codes to canonical tooth codes.
//!
//! ```json
//! {"labels_mapping": {"1": 31, "2": 32}, "patient_name": "006"}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Identifier used when a mapping names no subject
pub const UNKNOWN_SUBJECT: &str = "unknown";

/// Canonical codes outside the tooth range (ISO 3950 two-digit codes 11..=48)
pub const SPECIAL_CODES: [u16; 3] = [1, 2, 3];

pub fn is_canonical(code: u16) -> bool {
    SPECIAL_CODES.contains(&code) || (11..=48).contains(&code)
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Failed to read mapping file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse mapping file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid entry \"{key}\": {value} in {path}: {reason}")]
    InvalidEntry {
        path: PathBuf,
        key: String,
        value: String,
        reason: &'static str,
    },

    #[error("Unexpected canonical codes in {path}: {codes:?}")]
    Taxonomy { path: PathBuf, codes: Vec<u16> },
}

/// Something odd about a mapping that is reported but tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingIssue {
    DuplicateKeys(Vec<u16>),
    DuplicateValues(Vec<u16>),
    NonCanonicalValues(Vec<u16>),
}

impl fmt::Display for MappingIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingIssue::DuplicateKeys(keys) => {
                write!(f, "non-unique raw codes (last value wins): {keys:?}")
            }
            MappingIssue::DuplicateValues(values) => {
                write!(f, "several raw codes map to the same canonical codes: {values:?}")
            }
            MappingIssue::NonCanonicalValues(values) => {
                write!(f, "canonical codes outside the accepted taxonomy: {values:?}")
            }
        }
    }
}

/// Validated raw → canonical mapping, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMapping {
    entries: Vec<(u16, u16)>,
    subject: Option<String>,
    duplicate_keys: Vec<u16>,
}

impl LabelMapping {
    /// Build from entries. A repeated raw code keeps its first position and takes the last value.
    pub fn new(entries: impl IntoIterator<Item = (u16, u16)>) -> Self {
        let mut ordered: Vec<(u16, u16)> = Vec::new();
        let mut positions: BTreeMap<u16, usize> = BTreeMap::new();
        let mut duplicate_keys = BTreeSet::new();

        for (raw, canonical) in entries {
            match positions.get(&raw) {
                Some(&index) => {
                    duplicate_keys.insert(raw);
                    ordered[index].1 = canonical;
                }
                None => {
                    positions.insert(raw, ordered.len());
                    ordered.push((raw, canonical));
                }
            }
        }

        Self {
            entries: ordered,
            subject: None,
            duplicate_keys: duplicate_keys.into_iter().collect(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Read and validate a mapping file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| MappingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text, path)
    }

    /// Parse mapping JSON; `path` is only used in error messages
    pub fn from_json_str(text: &str, path: &Path) -> Result<Self, MappingError> {
        let file: MappingFile = serde_json::from_str(text).map_err(|source| MappingError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut entries = Vec::with_capacity(file.labels_mapping.0.len());
        for (key, value) in file.labels_mapping.0 {
            let invalid = |reason| MappingError::InvalidEntry {
                path: path.to_path_buf(),
                key: key.clone(),
                value: value.to_string(),
                reason,
            };
            let raw = key
                .trim()
                .parse::<u16>()
                .map_err(|_| invalid("raw code is not an integer in 0..=65535"))?;
            let canonical =
                json_code(&value).ok_or_else(|| invalid("canonical code is not an integer in 0..=65535"))?;
            entries.push((raw, canonical));
        }

        let mapping = Self::new(entries);
        Ok(match file.patient_name.or(file.patient).and_then(subject_name) {
            Some(subject) => mapping.with_subject(subject),
            None => mapping,
        })
    }

    pub fn entries(&self) -> &[(u16, u16)] {
        &self.entries
    }

    /// Subject identifier from the file, `"unknown"` when absent
    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or(UNKNOWN_SUBJECT)
    }

    /// Non-fatal problems: repeated keys or values, codes outside the taxonomy
    pub fn sanity_check(&self) -> Vec<MappingIssue> {
        let mut issues = Vec::new();

        if !self.duplicate_keys.is_empty() {
            issues.push(MappingIssue::DuplicateKeys(self.duplicate_keys.clone()));
        }

        let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
        for (_, canonical) in &self.entries {
            *counts.entry(*canonical).or_default() += 1;
        }
        let repeated: Vec<u16> = counts
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(code, _)| *code)
            .collect();
        if !repeated.is_empty() {
            issues.push(MappingIssue::DuplicateValues(repeated));
        }

        let unexpected: Vec<u16> = counts.keys().copied().filter(|c| !is_canonical(*c)).collect();
        if !unexpected.is_empty() {
            issues.push(MappingIssue::NonCanonicalValues(unexpected));
        }

        issues
    }
}

fn json_code(value: &JsonValue) -> Option<u16> {
    if let Some(code) = value.as_u64() {
        return u16::try_from(code).ok();
    }
    let code = value.as_f64()?;
    (code.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(&code)).then_some(code as u16)
}

fn subject_name(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(name) => Some(name),
        other => Some(other.to_string()),
    }
}

#[derive(Deserialize)]
struct MappingFile {
    labels_mapping: RawEntries,
    #[serde(default)]
    patient_name: Option<JsonValue>,
    #[serde(default)]
    patient: Option<JsonValue>,
}

/// Object entries in document order, repeated keys included.
struct RawEntries(Vec<(String, JsonValue)>);

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of raw code -> canonical code")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, JsonValue>()? {
                    entries.push(entry);
                }
                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
