mod classification;
mod ingest;
mod scans;
mod segmentation;
mod split;
mod volume;

pub use classification::{VolumeBatch, VolumeBatcher, VolumeDataset, VolumeItem};
pub use ingest::{IngestOptions, ingest_dicom_volumes, ingest_png_volumes};
pub use scans::{ScanStack, load_dicom_series, load_nifti_mask};
pub use segmentation::{SegmentationBatch, SegmentationBatcher, SliceDataset, SliceItem};
pub use split::{PatientSplit, split_patients};
pub use volume::{PatientMetadata, PatientRecord, PatientVolume, VolumeArchive};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("I/O error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("failed to encode volume archive: `{0}`")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode volume archive: `{0}`")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("invalid metadata: `{0}`")]
    Metadata(#[from] serde_json::Error),

    #[error("image error: `{0}`")]
    Image(#[from] image::ImageError),

    #[error("failed to read DICOM file: `{0}`")]
    Dicom(#[from] dicom_object::ReadError),

    #[error("failed to decode DICOM pixel data: `{0}`")]
    PixelData(#[from] dicom_pixeldata::Error),

    #[error("failed to read NIfTI volume: `{0}`")]
    Nifti(#[from] nifti::NiftiError),

    #[error("slice location of `{0}` is not a number")]
    InvalidSliceLocation(String),

    #[error("mask of patient `{patient}` has dimensions {dims:?}, expected a 3-D volume")]
    UnsupportedMask { patient: String, dims: Vec<usize> },

    #[error("patient `{patient}`: expected {expected} values for shape {shape:?}, got {actual}")]
    ShapeMismatch {
        patient: String,
        shape: [usize; 3],
        expected: usize,
        actual: usize,
    },

    #[error("patient `{patient}` has shape {actual:?}, expected {expected:?}")]
    InconsistentShape {
        patient: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("patient `{0}` is not in the archive")]
    UnknownPatient(String),

    #[error("patient `{0}` is already in the archive")]
    DuplicatePatient(String),

    #[error("no label for patient `{0}` in metadata")]
    MissingLabel(String),

    #[error("label {label} of patient `{patient}` is not binary")]
    InvalidLabel { patient: String, label: u8 },

    #[error("patient `{0}` has no image slices")]
    EmptyPatient(String),

    #[error("patient `{patient}` has no mask for slice `{file}`")]
    MissingMask { patient: String, file: String },

    #[error("downsample factor must be a power of two, got {0}")]
    InvalidDownsampleFactor(usize),

    #[error("cannot downsample patient `{patient}`: `{source}`")]
    Downsample {
        patient: String,
        source: crate::imaging::ImagingError,
    },

    #[error("none of the {0} requested patients has a segmentation mask")]
    NoMaskedPatients(usize),

    #[error("cannot split {0} patients into non-empty train and test sets")]
    NotEnoughPatients(usize),

    #[error("train fraction must be in (0, 1), got {0}")]
    InvalidFraction(f64),
}
