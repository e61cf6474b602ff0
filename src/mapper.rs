use std::collections::BTreeSet;
use std::fmt;

use ndarray::Zip;
use thiserror::Error;

use crate::mapping::LabelMapping;
use crate::volume::LabelVolume;

/// Canonical codes forced to background after mapping
pub type SkipSet = BTreeSet<u16>;

/// Mapping keys that never occur in the segmentation they were written for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct MappingIntegrityError {
    /// (raw code, canonical code) pairs whose raw code is absent
    pub missing: Vec<(u16, u16)>,
}

impl fmt::Display for MappingIntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("labels present in the mapping but not in the segmentation, please revise:")?;
        for (raw, canonical) in &self.missing {
            write!(f, " {raw} (maps to {canonical})")?;
        }
        Ok(())
    }
}

pub struct LabelMapper;

impl LabelMapper {
    /// Translate raw codes to canonical codes.
    ///
    /// Voxels whose code is not a mapping key become background, and any
    /// voxel whose canonical code is in `skip` is cleared as well. The input
    /// is left untouched; the output shares its spatial frame.
    ///
    /// # Errors
    ///
    /// Returns [`MappingIntegrityError`] if a mapping key does not occur
    /// anywhere in `volume`
    pub fn remap(
        volume: &LabelVolume,
        mapping: &LabelMapping,
        skip: Option<&SkipSet>,
    ) -> Result<LabelVolume, MappingIntegrityError> {
        let present = volume.present_codes();
        let missing: Vec<(u16, u16)> = mapping
            .entries()
            .iter()
            .filter(|(raw, _)| !present.contains(raw))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(MappingIntegrityError { missing });
        }

        let table = Self::lookup_table(mapping, skip);
        let data = Zip::from(&volume.data).par_map_collect(|&raw| table[usize::from(raw)]);
        Ok(volume.with_data(data))
    }

    /// Rewrite every code in `codes` to `into`, leaving other voxels as they are
    pub fn collapse(mut volume: LabelVolume, codes: &BTreeSet<u16>, into: u16) -> LabelVolume {
        Zip::from(&mut volume.data).par_for_each(|code| {
            if codes.contains(code) {
                *code = into;
            }
        });
        volume
    }

    // Dense raw -> output table over the whole u16 range; unmapped codes stay 0.
    fn lookup_table(mapping: &LabelMapping, skip: Option<&SkipSet>) -> Vec<u16> {
        let mut table = vec![0u16; usize::from(u16::MAX) + 1];
        for &(raw, canonical) in mapping.entries() {
            let suppressed = skip.is_some_and(|skip| skip.contains(&canonical));
            table[usize::from(raw)] = if suppressed { 0 } else { canonical };
        }
        table
    }
}
