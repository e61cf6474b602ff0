use crate::volume::{Affine, LabelVolume, affine_from_header};

use ndarray::{Array3, Axis, Ix3};
use nifti::{
    IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions, XForm, affine::Affine4,
    writer::WriterOptions,
};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("Expected a 3-D volume in {path}, got shape {shape:?}")]
    NotThreeDimensional { path: PathBuf, shape: Vec<usize> },

    #[error("File {0} exists and overwriting is disabled")]
    OutputExists(PathBuf),

    #[error("Header of {0} holds no usable voxel-to-world transform")]
    InvalidTransform(PathBuf),

    #[error("IO error")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error in {path}")]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },
}

/// Reads and writes labeled volumes.
///
/// The pipeline only talks to this trait, so the container format stays
/// outside the remap/merge logic.
pub trait VolumeIo {
    fn load(&self, path: &Path) -> Result<LabelVolume, VolumeLoaderError>;

    fn save(&self, volume: &LabelVolume, path: &Path) -> Result<(), VolumeLoaderError>;
}

/// NIfTI-1 backed [`VolumeIo`], `.nii` and `.nii.gz` alike.
#[derive(Debug, Clone)]
pub struct VolumeLoader {
    overwrite: bool,
}

impl Default for VolumeLoader {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

impl VolumeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to replace existing files on save when `false`
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Load a labeled volume from a NIfTI file
    ///
    /// # Errors
    ///
    /// Returns error if the file can't be read, holds more than three
    /// non-singleton dimensions, or its header describes no spatial frame
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<LabelVolume, VolumeLoaderError> {
        let path = path.as_ref();
        let nifti_error = |source| VolumeLoaderError::Nifti {
            path: path.to_path_buf(),
            source,
        };

        let object = ReaderOptions::new().read_file(path).map_err(nifti_error)?;
        let header = object.header().clone();
        let data = object
            .into_volume()
            .into_ndarray::<u16>()
            .map_err(nifti_error)?;

        let shape = data.shape().to_vec();
        let mut data = data;
        while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
            let last = Axis(data.ndim() - 1);
            data = data.index_axis_move(last, 0);
        }
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| VolumeLoaderError::NotThreeDimensional {
                path: path.to_path_buf(),
                shape,
            })?;

        let affine = affine_from_header(&header)
            .ok_or_else(|| VolumeLoaderError::InvalidTransform(path.to_path_buf()))?;
        Ok(LabelVolume::new(data, affine, header))
    }

    /// Write a labeled volume, as `u8` when every code fits
    pub fn save_to_file(
        volume: &LabelVolume,
        path: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<(), VolumeLoaderError> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            return Err(VolumeLoaderError::OutputExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let header = Self::output_header(&volume.header, &volume.affine);
        let writer = WriterOptions::new(path).reference_header(&header);
        let written = if volume.max_code() <= u16::from(u8::MAX) {
            let narrowed: Array3<u8> = volume.data.mapv(|code| code as u8);
            writer.write_nifti(&narrowed)
        } else {
            writer.write_nifti(&volume.data)
        };

        written.map_err(|source| VolumeLoaderError::Nifti {
            path: path.to_path_buf(),
            source,
        })
    }

    // Labels are stored verbatim, and the affine goes into the sform.
    fn output_header(header: &NiftiHeader, affine: &Affine) -> NiftiHeader {
        let mut header = header.clone();
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        let code = match header.sform() {
            Ok(code) if code != XForm::Unknown => code,
            _ => XForm::AlignedAnat,
        };
        let matrix = Affine4::from_fn(|row, col| affine[row][col] as f32);
        header.set_sform(&matrix, code);
        header
    }
}

impl VolumeIo for VolumeLoader {
    fn load(&self, path: &Path) -> Result<LabelVolume, VolumeLoaderError> {
        Self::load_from_file(path)
    }

    fn save(&self, volume: &LabelVolume, path: &Path) -> Result<(), VolumeLoaderError> {
        Self::save_to_file(volume, path, self.overwrite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::IDENTITY_AFFINE;
    use tempfile::TempDir;

    #[test]
    fn test_output_header_carries_affine() {
        let mut affine = IDENTITY_AFFINE;
        affine[0][3] = -12.5;
        affine[1][1] = 0.4;
        let mut input = NiftiHeader::default();
        input.sform_code = 0;

        let header = VolumeLoader::output_header(&input, &affine);
        assert_eq!(header.sform_code, 2);
        assert_eq!(header.srow_x, [1.0, 0.0, 0.0, -12.5]);
        assert_eq!(header.srow_y[1], 0.4);
        assert_eq!(header.scl_slope, 1.0);
    }

    #[test]
    fn test_output_header_keeps_sform_code() {
        let mut input = NiftiHeader::default();
        input.sform_code = 1;

        let header = VolumeLoader::output_header(&input, &IDENTITY_AFFINE);
        assert_eq!(header.sform_code, 1);
        assert_eq!(header.srow_z, [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_load_squeezes_trailing_singleton_axes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("four_d.nii.gz");
        let mut data = ndarray::Array4::<u8>::zeros((3, 4, 2, 1));
        data[[2, 3, 1, 0]] = 17;
        WriterOptions::new(&path).write_nifti(&data).unwrap();

        let volume = VolumeLoader::load_from_file(&path).unwrap();
        assert_eq!(volume.dim(), (3, 4, 2));
        assert_eq!(volume.data[[2, 3, 1]], 17);
    }

    #[test]
    fn test_save_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.nii.gz");
        fs::write(&path, b"placeholder").unwrap();

        let volume = LabelVolume::from_data(Array3::zeros((2, 2, 2)));
        let loader = VolumeLoader::new().with_overwrite(false);
        let err = loader.save(&volume, &path).unwrap_err();
        assert!(matches!(err, VolumeLoaderError::OutputExists(_)));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.nii.gz");
        let err = VolumeLoader::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("absent.nii.gz"));
    }
}
