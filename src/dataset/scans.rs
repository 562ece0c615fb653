//! Readers for scanner output: DICOM slice series and NIfTI label volumes.

use std::fs;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, open_file};
use dicom_pixeldata::PixelDecoder;
use nifti::{NiftiObject, NiftiVolume, RandomAccessNiftiVolume, ReaderOptions};

use super::DatasetError;

/// Intensities of a `[depth, height, width]` stack.
pub struct ScanStack<T> {
    pub shape: [usize; 3],
    pub values: Vec<T>,
}

/// Read every DICOM file in `dir` as one slice of a volume.
///
/// Files without a `SliceLocation` (scout views, localizers) are skipped. The
/// remaining slices are stacked by decreasing slice location, ties keep the
/// file name order. Pixel values go through the modality LUT, so CT slices
/// come out in Hounsfield units.
pub fn load_dicom_series(dir: &Path, patient_id: &str) -> Result<ScanStack<f32>, DatasetError> {
    let mut slices = Vec::new();
    for path in regular_files(dir)? {
        let object = open_file(&path)?;
        match slice_location(&object, &path)? {
            Some(location) => slices.push((location, object)),
            None => tracing::debug!("Skipping {} without a slice location", path.display()),
        }
    }

    if slices.is_empty() {
        return Err(DatasetError::EmptyPatient(patient_id.to_string()));
    }
    slices.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut values = Vec::new();
    let mut depth = 0;
    let mut slice_size: Option<[usize; 2]> = None;

    for (_, object) in &slices {
        let pixels = object.decode_pixel_data()?;
        let size = [pixels.rows() as usize, pixels.columns() as usize];
        if let Some(expected) = slice_size.filter(|expected| *expected != size) {
            return Err(DatasetError::InconsistentShape {
                patient: patient_id.to_string(),
                expected: expected.to_vec(),
                actual: size.to_vec(),
            });
        }
        slice_size = Some(size);

        values.extend(pixels.to_vec::<f32>()?);
        depth += pixels.number_of_frames() as usize;
    }

    let [height, width] = slice_size.unwrap_or_default();
    Ok(ScanStack {
        shape: [depth, height, width],
        values,
    })
}

/// Read a NIfTI label volume as a binary `[depth, height, width]` mask.
///
/// The stored `(x, y, z)` grid is turned a quarter clockwise and mirrored,
/// which leaves `y` on the rows and `x` on the columns of every axial slice
/// `z`. This is the orientation of the matching DICOM pixel data.
pub fn load_nifti_mask(path: &Path, patient_id: &str) -> Result<ScanStack<u8>, DatasetError> {
    let object = ReaderOptions::new().read_file(path)?;
    let volume = object.volume();

    let dims: Vec<usize> = volume.dim().iter().map(|&d| usize::from(d)).collect();
    if dims.is_empty() || dims.iter().skip(3).any(|&d| d != 1) {
        return Err(DatasetError::UnsupportedMask {
            patient: patient_id.to_string(),
            dims,
        });
    }
    let size = |axis: usize| dims.get(axis).copied().unwrap_or(1);
    let (nx, ny, nz) = (size(0), size(1), size(2));

    let mut values = Vec::with_capacity(nx * ny * nz);
    let mut coords = vec![0u16; dims.len()];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                coords[0] = x as u16;
                if let Some(c) = coords.get_mut(1) {
                    *c = y as u16;
                }
                if let Some(c) = coords.get_mut(2) {
                    *c = z as u16;
                }
                values.push(u8::from(volume.get_f32(&coords)? > 0.0));
            }
        }
    }

    Ok(ScanStack {
        shape: [nz, ny, nx],
        values,
    })
}

fn slice_location(object: &DefaultDicomObject, path: &Path) -> Result<Option<f64>, DatasetError> {
    object
        .get(tags::SLICE_LOCATION)
        .map(|element| {
            element
                .to_float64()
                .map_err(|_| DatasetError::InvalidSliceLocation(path.display().to_string()))
        })
        .transpose()
}

fn regular_files(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if path.is_file() && !hidden {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::{tags, uids};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    static NEXT_UID: AtomicUsize = AtomicUsize::new(1);

    /// Write a single-frame 16-bit CT slice.
    pub fn write_dicom_slice(
        path: &Path,
        location: Option<f64>,
        rows: u16,
        columns: u16,
        pixels: &[u16],
    ) {
        let instance_uid = format!("2.25.{}", NEXT_UID.fetch_add(1, Ordering::Relaxed));
        let mut elements = vec![
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(instance_uid.as_str()),
            ),
            DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(
                tags::PHOTOMETRIC_INTERPRETATION,
                VR::CS,
                PrimitiveValue::from("MONOCHROME2"),
            ),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
            DataElement::new(
                tags::PIXEL_REPRESENTATION,
                VR::US,
                PrimitiveValue::from(0_u16),
            ),
            DataElement::new(
                tags::PIXEL_DATA,
                VR::OW,
                PrimitiveValue::U16(pixels.iter().copied().collect()),
            ),
        ];
        if let Some(location) = location {
            elements.push(DataElement::new(
                tags::SLICE_LOCATION,
                VR::DS,
                PrimitiveValue::from(location.to_string()),
            ));
        }

        InMemDicomObject::from_element_iter(elements)
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                    .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(instance_uid.as_str()),
            )
            .unwrap()
            .write_to_file(path)
            .unwrap();
    }

    /// Write an uncompressed single-file NIfTI-1 volume of `u8` labels.
    ///
    /// `labels` is indexed `[x + nx * (y + ny * z)]`, the on-disk order.
    pub fn write_nifti_labels(path: &Path, [nx, ny, nz]: [u16; 3], labels: &[u8]) {
        let mut header = vec![0u8; 352];
        let mut put = |offset: usize, bytes: &[u8]| {
            header[offset..offset + bytes.len()].copy_from_slice(bytes)
        };

        put(0, &348i32.to_le_bytes());
        for (i, d) in [3i16, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1]
            .iter()
            .enumerate()
        {
            put(40 + 2 * i, &d.to_le_bytes());
        }
        // uint8 voxels
        put(70, &2i16.to_le_bytes());
        put(72, &8i16.to_le_bytes());
        for i in 0..8 {
            put(76 + 4 * i, &1f32.to_le_bytes());
        }
        put(108, &352f32.to_le_bytes());
        put(112, &1f32.to_le_bytes());
        put(344, b"n+1\0");

        header.extend_from_slice(labels);
        std::fs::write(path, header).unwrap();
    }
}
