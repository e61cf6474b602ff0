use std::collections::BTreeSet;
use std::fmt;

use ndarray::{Array3, Zip};
use rayon::prelude::*;
use thiserror::Error;

use crate::enums::OverlapPolicy;
use crate::volume::LabelVolume;

/// Voxels labeled by both regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapReport {
    pub voxels: usize,
    /// Distinct (kept code, dropped code) combinations found on the overlap
    pub code_pairs: Vec<(u16, u16)>,
}

impl fmt::Display for OverlapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} overlapping voxel(s), codes (kept, dropped): ", self.voxels)?;
        for (i, (kept, dropped)) in self.code_pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "({kept}, {dropped})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("Cannot merge volumes of shape {first:?} and {second:?}")]
    ShapeMismatch {
        first: (usize, usize, usize),
        second: (usize, usize, usize),
    },

    #[error("Found overlap between regions: {report}")]
    Overlap {
        report: OverlapReport,
        /// 1 where both regions are labeled
        mask: Array3<u8>,
    },
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub volume: LabelVolume,
    pub overlap: Option<OverlapReport>,
}

pub struct RegionMerger;

impl RegionMerger {
    /// Combine two canonicalized volumes, `first` taking precedence.
    ///
    /// Under [`OverlapPolicy::PreferFirst`] the second volume is cleared
    /// wherever both are labeled and the event is returned as a report.
    /// The result is the sum of the then disjoint grids, in the frame of
    /// `first`.
    ///
    /// # Errors
    ///
    /// Returns error if the shapes differ, or on any overlap under
    /// [`OverlapPolicy::Abort`]
    pub fn merge(
        first: LabelVolume,
        second: LabelVolume,
        policy: OverlapPolicy,
    ) -> Result<MergeOutcome, MergeError> {
        if first.dim() != second.dim() {
            return Err(MergeError::ShapeMismatch {
                first: first.dim(),
                second: second.dim(),
            });
        }

        let overlap = Self::overlap_report(&first, &second);
        if let (Some(report), OverlapPolicy::Abort) = (&overlap, policy) {
            return Err(MergeError::Overlap {
                report: report.clone(),
                mask: Self::overlap_mask(&first, &second),
            });
        }

        let mut volume = first;
        Zip::from(&mut volume.data)
            .and(&second.data)
            .par_for_each(|kept, &incoming| {
                let incoming = if *kept != 0 { 0 } else { incoming };
                *kept += incoming;
            });

        Ok(MergeOutcome { volume, overlap })
    }

    pub fn overlap_mask(first: &LabelVolume, second: &LabelVolume) -> Array3<u8> {
        Zip::from(&first.data)
            .and(&second.data)
            .par_map_collect(|&a, &b| u8::from(a != 0 && b != 0))
    }

    fn overlap_report(first: &LabelVolume, second: &LabelVolume) -> Option<OverlapReport> {
        let (voxels, pairs) = Zip::from(&first.data)
            .and(&second.data)
            .into_par_iter()
            .filter(|(a, b)| **a != 0 && **b != 0)
            .fold(
                || (0usize, BTreeSet::new()),
                |(count, mut pairs), (&a, &b)| {
                    pairs.insert((a, b));
                    (count + 1, pairs)
                },
            )
            .reduce(
                || (0usize, BTreeSet::new()),
                |(count_a, mut pairs_a), (count_b, pairs_b)| {
                    pairs_a.extend(pairs_b);
                    (count_a + count_b, pairs_a)
                },
            );

        (voxels > 0).then(|| OverlapReport {
            voxels,
            code_pairs: pairs.into_iter().collect(),
        })
    }
}
