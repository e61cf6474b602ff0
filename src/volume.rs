use std::collections::{BTreeSet, HashSet};

use ndarray::Array3;
use nifti::NiftiHeader;
use rayon::prelude::*;

/// Voxel-to-world transform, row major.
pub type Affine = [[f64; 4]; 4];

pub const IDENTITY_AFFINE: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// A labeled 3-D grid together with the spatial frame it was read in.
///
/// Code 0 is background. The header is carried through untouched so the
/// merged output keeps the metadata of the first loaded region.
#[derive(Debug, Clone)]
pub struct LabelVolume {
    pub data: Array3<u16>,
    pub affine: Affine,
    pub header: NiftiHeader,
}

impl LabelVolume {
    pub fn new(data: Array3<u16>, affine: Affine, header: NiftiHeader) -> Self {
        Self {
            data,
            affine,
            header,
        }
    }

    /// Volume with an identity affine and a default header
    pub fn from_data(data: Array3<u16>) -> Self {
        Self::new(data, IDENTITY_AFFINE, NiftiHeader::default())
    }

    /// New volume in the same spatial frame with a different grid
    pub fn with_data(&self, data: Array3<u16>) -> Self {
        Self::new(data, self.affine, self.header.clone())
    }

    /// Get the dimensions of the volume (x, y, z)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Distinct codes present in the grid, background included
    pub fn present_codes(&self) -> BTreeSet<u16> {
        self.data
            .par_iter()
            .fold(HashSet::new, |mut codes, &code| {
                codes.insert(code);
                codes
            })
            .reduce(HashSet::new, |mut a, b| {
                a.extend(b);
                a
            })
            .into_iter()
            .collect()
    }

    pub fn max_code(&self) -> u16 {
        self.data.par_iter().copied().max().unwrap_or(0)
    }

    pub fn count_labeled(&self) -> usize {
        self.data.par_iter().filter(|&&code| code != 0).count()
    }
}

/// Tolerances for comparing two affines, same semantics as numpy's `allclose`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Default for AffineTolerance {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-8,
        }
    }
}

impl AffineTolerance {
    pub fn is_close(&self, a: &Affine, b: &Affine) -> bool {
        a.iter()
            .flatten()
            .zip(b.iter().flatten())
            .all(|(x, y)| (x - y).abs() <= self.atol + self.rtol * y.abs())
    }
}

/// Axis codes (`RAS`, `LPS`, ...) naming the world direction each voxel axis points to.
pub fn orientation_codes(affine: &Affine) -> String {
    const POSITIVE: [char; 3] = ['R', 'A', 'S'];
    const NEGATIVE: [char; 3] = ['L', 'P', 'I'];

    (0..3)
        .map(|axis| {
            let (world, value) = (0..3)
                .map(|row| (row, affine[row][axis]))
                .fold((0, 0.0_f64), |best, candidate| {
                    if candidate.1.abs() > best.1.abs() {
                        candidate
                    } else {
                        best
                    }
                });
            if value > 0.0 {
                POSITIVE[world]
            } else if value < 0.0 {
                NEGATIVE[world]
            } else {
                '?'
            }
        })
        .collect()
}

/// Affine stored in a NIfTI header.
///
/// Resolved the way `nifti` does it: the sform when set, then the qform,
/// then a centered, x-flipped frame built from the shape and spacing.
/// A qfac other than 1 or -1 reads as 1.
///
/// `None` when the header can't describe a frame: a qform with negative
/// spacing or a non-unit quaternion, or a shape outside 3 to 7 dimensions.
pub fn affine_from_header(header: &NiftiHeader) -> Option<Affine> {
    let mut header = header.clone();
    header.fix();

    if header.sform_code == 0 {
        if header.qform_code != 0 {
            let spacing_ok = header.pixdim[1..4].iter().all(|&s| s >= 0.0);
            let quaternion = [header.quatern_b, header.quatern_c, header.quatern_d]
                .map(f64::from)
                .iter()
                .map(|v| v * v)
                .sum::<f64>();
            if !spacing_ok || 1.0 - quaternion < -3.0 * f64::from(f32::EPSILON) {
                return None;
            }
        } else if !(3..=7).contains(&header.dim[0]) {
            return None;
        }
    }

    let matrix = header.affine::<f64>();
    Some(std::array::from_fn(|row| {
        std::array::from_fn(|col| matrix[(row, col)])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_present_codes_and_max() {
        let mut data = Array3::<u16>::zeros((3, 3, 3));
        data[[0, 0, 0]] = 7;
        data[[2, 1, 0]] = 300;
        let volume = LabelVolume::from_data(data);

        assert_eq!(
            volume.present_codes().into_iter().collect::<Vec<_>>(),
            vec![0, 7, 300]
        );
        assert_eq!(volume.max_code(), 300);
        assert_eq!(volume.count_labeled(), 2);
    }

    #[test]
    fn test_affine_tolerance() {
        let tolerance = AffineTolerance::default();
        let mut other = IDENTITY_AFFINE;
        other[0][3] = 1e-9;
        assert!(tolerance.is_close(&IDENTITY_AFFINE, &other));

        other[0][3] = 0.5;
        assert!(!tolerance.is_close(&IDENTITY_AFFINE, &other));
    }

    #[test]
    fn test_orientation_codes() {
        assert_eq!(orientation_codes(&IDENTITY_AFFINE), "RAS");

        let mut flipped = IDENTITY_AFFINE;
        flipped[0][0] = -0.3;
        flipped[1][1] = -0.3;
        assert_eq!(orientation_codes(&flipped), "LPS");
    }

    #[test]
    fn test_affine_from_sform() {
        let mut header = NiftiHeader::default();
        header.sform_code = 2;
        header.srow_x = [-0.5, 0.0, 0.0, 10.0];
        header.srow_y = [0.0, 0.5, 0.0, -4.0];
        header.srow_z = [0.0, 0.0, 0.25, 2.0];

        let affine = affine_from_header(&header).unwrap();
        assert_eq!(affine[0], [-0.5, 0.0, 0.0, 10.0]);
        assert_eq!(affine[2], [0.0, 0.0, 0.25, 2.0]);
        assert_eq!(affine[3], [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_affine_from_qform() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.quatern_b = 0.0;
        header.quatern_c = 1.0;
        header.quatern_d = 0.0;
        header.quatern_x = 1.0;
        header.quatern_y = 2.0;
        header.quatern_z = 3.0;
        header.pixdim = [-1.0, 0.5, 0.5, 2.0, 0.0, 0.0, 0.0, 0.0];

        let affine = affine_from_header(&header).unwrap();
        assert_eq!(affine[0], [-0.5, 0.0, 0.0, 1.0]);
        assert_eq!(affine[1], [0.0, 0.5, 0.0, 2.0]);
        assert_eq!(affine[2], [0.0, 0.0, 2.0, 3.0]);
        assert_eq!(orientation_codes(&affine), "LAS");
    }

    #[test]
    fn test_affine_from_shape_and_spacing() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 0;
        header.dim = [3, 5, 3, 9, 1, 1, 1, 1];
        header.pixdim = [1.0, 0.5, 2.0, 0.25, 0.0, 0.0, 0.0, 0.0];

        let affine = affine_from_header(&header).unwrap();
        assert_eq!(affine[0], [-0.5, 0.0, 0.0, 1.0]);
        assert_eq!(affine[1], [0.0, 2.0, 0.0, -2.0]);
        assert_eq!(affine[2], [0.0, 0.0, 0.25, -1.0]);
        assert_eq!(orientation_codes(&affine), "LAS");
    }

    #[test]
    fn test_unusable_qform() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.pixdim = [1.0, -0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(affine_from_header(&header), None);

        header.pixdim = [1.0, 0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0];
        header.quatern_b = 1.0;
        header.quatern_c = 1.0;
        assert_eq!(affine_from_header(&header), None);
    }
}
