//! Build a [VolumeArchive] from per-patient folders.
//!
//! Image slices:
//!
//! ```text
//! root/
//!   <patient>/
//!     images/0001.png, 0002.png, ...
//!     masks/0001.png, 0002.png, ...   (optional)
//! ```
//!
//! Slices are ordered by file name. Mask slices must carry the same file name
//! as their image slice.
//!
//! Scanner output:
//!
//! ```text
//! root/
//!   <patient>/
//!     dicom/<one file per slice>
//!     mask.nii or mask.nii.gz         (optional)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use image::{ColorType, DynamicImage};

use super::scans::{load_dicom_series, load_nifti_mask};
use super::{DatasetError, PatientVolume, VolumeArchive};
use crate::imaging::{downsample_images, power_of_two};

const SUPPORTED_FILES: [&str; 3] = ["png", "tif", "tiff"];
const DICOM_DIR: &str = "dicom";
const MASK_FILES: [&str; 2] = ["mask.nii", "mask.nii.gz"];

#[derive(Clone, Debug)]
pub struct IngestOptions {
    /// Shrink every slice by this power-of-two factor, `1` keeps the original size.
    pub downsample: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { downsample: 1 }
    }
}

impl IngestOptions {
    pub fn validate(&self) -> Result<(), DatasetError> {
        if !power_of_two(self.downsample) {
            return Err(DatasetError::InvalidDownsampleFactor(self.downsample));
        }
        Ok(())
    }
}

pub fn ingest_png_volumes(
    root: &Path,
    options: &IngestOptions,
) -> Result<VolumeArchive, DatasetError> {
    ingest(root, "images", options, load_patient)
}

/// Like [ingest_png_volumes] for DICOM series with optional NIfTI masks.
pub fn ingest_dicom_volumes(
    root: &Path,
    options: &IngestOptions,
) -> Result<VolumeArchive, DatasetError> {
    ingest(root, DICOM_DIR, options, load_scanned_patient)
}

fn ingest<F>(
    root: &Path,
    marker: &str,
    options: &IngestOptions,
    load: F,
) -> Result<VolumeArchive, DatasetError>
where
    F: Fn(&Path, &str, &IngestOptions) -> Result<PatientVolume, DatasetError>,
{
    options.validate()?;

    let mut patient_dirs = fs::read_dir(root)?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()?;
    patient_dirs.retain(|path| path.join(marker).is_dir());
    patient_dirs.sort();

    let mut archive = VolumeArchive::new();
    for dir in patient_dirs {
        let patient_id = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let volume = load(&dir, &patient_id, options)?;
        tracing::info!(
            "Loaded patient {} with shape {:?}{}",
            patient_id,
            volume.shape,
            if volume.has_mask() { " and mask" } else { "" }
        );
        archive.push(volume)?;
    }

    Ok(archive)
}

fn load_patient(
    dir: &Path,
    patient_id: &str,
    options: &IngestOptions,
) -> Result<PatientVolume, DatasetError> {
    let image_files = slice_files(&dir.join("images"))?;
    if image_files.is_empty() {
        return Err(DatasetError::EmptyPatient(patient_id.to_string()));
    }

    let masks_dir = dir.join("masks");
    let has_masks = masks_dir.is_dir();

    let mut voxels = Vec::new();
    let mut mask = has_masks.then(Vec::new);
    let mut slice_size = None;

    for path in &image_files {
        let image = image::open(path)?;
        check_slice_size(patient_id, &mut slice_size, &image)?;
        voxels.extend(intensities(image));

        if let Some(mask) = mask.as_mut() {
            let file_name = path.file_name().unwrap_or_default();
            let mask_path = masks_dir.join(file_name);
            if !mask_path.is_file() {
                return Err(DatasetError::MissingMask {
                    patient: patient_id.to_string(),
                    file: file_name.to_string_lossy().into_owned(),
                });
            }

            let mask_image = image::open(&mask_path)?;
            check_slice_size(patient_id, &mut slice_size, &mask_image)?;
            mask.extend(mask_image.into_luma8().iter().map(|&v| u8::from(v > 0)));
        }
    }

    let [height, width] = slice_size.unwrap_or_default();
    let shape = [image_files.len(), height, width];

    finish_volume(patient_id, shape, voxels, mask, options)
}

fn load_scanned_patient(
    dir: &Path,
    patient_id: &str,
    options: &IngestOptions,
) -> Result<PatientVolume, DatasetError> {
    let images = load_dicom_series(&dir.join(DICOM_DIR), patient_id)?;

    let mask_path = MASK_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file());
    let mask = match mask_path {
        Some(path) => {
            let mask = load_nifti_mask(&path, patient_id)?;
            if mask.shape != images.shape {
                return Err(DatasetError::InconsistentShape {
                    patient: patient_id.to_string(),
                    expected: images.shape.to_vec(),
                    actual: mask.shape.to_vec(),
                });
            }
            Some(mask.values)
        }
        None => None,
    };

    finish_volume(patient_id, images.shape, images.values, mask, options)
}

/// Apply the requested downsampling and build the volume.
fn finish_volume(
    patient_id: &str,
    mut shape: [usize; 3],
    mut voxels: Vec<f32>,
    mut mask: Option<Vec<u8>>,
    options: &IngestOptions,
) -> Result<PatientVolume, DatasetError> {
    if options.downsample > 1 {
        let (scaled, new_shape) = downsample_images(&voxels, shape, options.downsample, false)
            .map_err(|source| DatasetError::Downsample {
                patient: patient_id.to_string(),
                source,
            })?;
        voxels = scaled;

        if let Some(labels) = mask.take() {
            let labels: Vec<f32> = labels.into_iter().map(f32::from).collect();
            let (labels, _) = downsample_images(&labels, shape, options.downsample, true)
                .map_err(|source| DatasetError::Downsample {
                    patient: patient_id.to_string(),
                    source,
                })?;
            mask = Some(labels.into_iter().map(|v| u8::from(v > 0.0)).collect());
        }
        shape = new_shape;
    }

    PatientVolume::new(patient_id, shape, voxels, mask)
}

fn slice_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                SUPPORTED_FILES
                    .iter()
                    .any(|valid| valid.eq_ignore_ascii_case(ext))
            });
        if path.is_file() && supported {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn check_slice_size(
    patient_id: &str,
    slice_size: &mut Option<[usize; 2]>,
    image: &DynamicImage,
) -> Result<(), DatasetError> {
    let size = [image.height() as usize, image.width() as usize];
    match slice_size {
        Some(expected) if *expected != size => Err(DatasetError::InconsistentShape {
            patient: patient_id.to_string(),
            expected: expected.to_vec(),
            actual: size.to_vec(),
        }),
        _ => {
            *slice_size = Some(size);
            Ok(())
        }
    }
}

/// Raw grey levels, keeping the full range of 16-bit slices.
fn intensities(image: DynamicImage) -> Vec<f32> {
    match image.color() {
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
            image.into_luma8().iter().map(|&v| f32::from(v)).collect()
        }
        ColorType::Rgb32F | ColorType::Rgba32F => image.to_luma32f().into_raw(),
        _ => image.into_luma16().iter().map(|&v| f32::from(v)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::scans::testing::{write_dicom_slice, write_nifti_labels};
    use image::{GrayImage, ImageBuffer, Luma};

    fn write_slice(path: &Path, size: u32, value: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(size, size, Luma([value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn ingests_patients_with_and_without_masks() {
        let root = tempfile::tempdir().unwrap();
        let with_mask = root.path().join("p1");
        write_slice(&with_mask.join("images/002.png"), 4, 20);
        write_slice(&with_mask.join("images/001.png"), 4, 10);
        write_slice(&with_mask.join("masks/001.png"), 4, 0);
        write_slice(&with_mask.join("masks/002.png"), 4, 255);
        write_slice(&root.path().join("p2/images/001.png"), 4, 5);
        fs::create_dir_all(root.path().join("not_a_patient")).unwrap();

        let archive = ingest_png_volumes(root.path(), &IngestOptions::default()).unwrap();

        assert_eq!(archive.patient_ids(), vec!["p1", "p2"]);
        let p1 = archive.volume("p1").unwrap();
        assert_eq!(p1.shape, [2, 4, 4]);
        assert_eq!(p1.slice(0).unwrap()[0], 10.0);
        assert_eq!(p1.slice(1).unwrap()[0], 20.0);
        assert_eq!(p1.mask_slice(1).unwrap(), &[1; 16][..]);
        assert!(!archive.volume("p2").unwrap().has_mask());
    }

    #[test]
    fn keeps_sixteen_bit_range() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("p/images/001.png");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        ImageBuffer::<Luma<u16>, Vec<u16>>::from_pixel(2, 2, Luma([4000]))
            .save(&path)
            .unwrap();

        let archive = ingest_png_volumes(root.path(), &IngestOptions::default()).unwrap();

        assert_eq!(archive.volume("p").unwrap().voxels, vec![4000.0; 4]);
    }

    #[test]
    fn downsamples_images_and_masks() {
        let root = tempfile::tempdir().unwrap();
        write_slice(&root.path().join("p/images/001.png"), 8, 100);
        write_slice(&root.path().join("p/masks/001.png"), 8, 1);

        let options = IngestOptions { downsample: 2 };
        let archive = ingest_png_volumes(root.path(), &options).unwrap();

        let volume = archive.volume("p").unwrap();
        assert_eq!(volume.shape, [1, 4, 4]);
        assert_eq!(volume.mask.as_deref(), Some(&[1; 16][..]));
    }

    #[test]
    fn reports_missing_masks_and_mixed_sizes() {
        let root = tempfile::tempdir().unwrap();
        write_slice(&root.path().join("p/images/001.png"), 4, 1);
        write_slice(&root.path().join("p/images/002.png"), 4, 1);
        write_slice(&root.path().join("p/masks/001.png"), 4, 1);

        assert!(matches!(
            ingest_png_volumes(root.path(), &IngestOptions::default()),
            Err(DatasetError::MissingMask { .. })
        ));

        let root = tempfile::tempdir().unwrap();
        write_slice(&root.path().join("p/images/001.png"), 4, 1);
        write_slice(&root.path().join("p/images/002.png"), 8, 1);

        assert!(matches!(
            ingest_png_volumes(root.path(), &IngestOptions::default()),
            Err(DatasetError::InconsistentShape { .. })
        ));
    }

    #[test]
    fn rejects_downsample_factors_that_are_not_powers_of_two() {
        let root = tempfile::tempdir().unwrap();
        write_slice(&root.path().join("p/images/001.png"), 8, 100);

        for factor in [0, 3, 6] {
            let options = IngestOptions { downsample: factor };
            assert!(matches!(
                ingest_png_volumes(root.path(), &options),
                Err(DatasetError::InvalidDownsampleFactor(f)) if f == factor
            ));
            assert!(matches!(
                ingest_dicom_volumes(root.path(), &options),
                Err(DatasetError::InvalidDownsampleFactor(_))
            ));
        }
    }

    #[test]
    fn ingests_dicom_series_with_nifti_masks() {
        let root = tempfile::tempdir().unwrap();
        let series = root.path().join("p1/dicom");
        fs::create_dir_all(&series).unwrap();
        write_dicom_slice(&series.join("scout"), None, 4, 4, &[7; 16]);
        write_dicom_slice(&series.join("IM0001"), Some(-2.0), 2, 2, &[10; 4]);
        write_dicom_slice(&series.join("IM0002"), Some(3.0), 2, 2, &[20; 4]);
        // second slice (lower location) is labelled at row 1, column 0
        let mut labels = vec![0u8; 8];
        labels[2 * 2 + 2] = 1;
        write_nifti_labels(&root.path().join("p1/mask.nii"), [2, 2, 2], &labels);

        let series = root.path().join("p2/dicom");
        fs::create_dir_all(&series).unwrap();
        write_dicom_slice(&series.join("IM0001"), Some(0.0), 2, 2, &[5; 4]);
        write_slice(&root.path().join("png_only/images/001.png"), 2, 1);

        let archive = ingest_dicom_volumes(root.path(), &IngestOptions::default()).unwrap();

        assert_eq!(archive.patient_ids(), vec!["p1", "p2"]);
        let p1 = archive.volume("p1").unwrap();
        assert_eq!(p1.shape, [2, 2, 2]);
        assert_eq!(p1.slice(0).unwrap(), &[20.0; 4][..]);
        assert_eq!(p1.slice(1).unwrap(), &[10.0; 4][..]);
        assert_eq!(p1.mask_slice(0).unwrap(), &[0, 0, 0, 0][..]);
        assert_eq!(p1.mask_slice(1).unwrap(), &[0, 0, 1, 0][..]);
        assert!(!archive.volume("p2").unwrap().has_mask());
    }

    #[test]
    fn rejects_masks_that_do_not_match_the_series() {
        let root = tempfile::tempdir().unwrap();
        let series = root.path().join("p/dicom");
        fs::create_dir_all(&series).unwrap();
        write_dicom_slice(&series.join("IM0001"), Some(0.0), 2, 2, &[1; 4]);
        write_nifti_labels(&root.path().join("p/mask.nii"), [2, 2, 3], &[0; 12]);

        assert!(matches!(
            ingest_dicom_volumes(root.path(), &IngestOptions::default()),
            Err(DatasetError::InconsistentShape { .. })
        ));
    }
}
