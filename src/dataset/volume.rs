use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use super::DatasetError;

/// One scanned patient: a `[depth, height, width]` voxel grid and an optional
/// binary segmentation mask of the same shape.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct PatientVolume {
    pub patient_id: String,
    pub shape: [usize; 3],
    pub voxels: Vec<f32>,
    pub mask: Option<Vec<u8>>,
}

impl PatientVolume {
    pub fn new(
        patient_id: impl Into<String>,
        shape: [usize; 3],
        voxels: Vec<f32>,
        mask: Option<Vec<u8>>,
    ) -> Result<Self, DatasetError> {
        let patient_id = patient_id.into();
        let expected = shape.iter().product::<usize>();

        if voxels.len() != expected {
            return Err(DatasetError::ShapeMismatch {
                patient: patient_id,
                shape,
                expected,
                actual: voxels.len(),
            });
        }
        if let Some(mask) = &mask {
            if mask.len() != expected {
                return Err(DatasetError::ShapeMismatch {
                    patient: patient_id,
                    shape,
                    expected,
                    actual: mask.len(),
                });
            }
        }

        Ok(Self {
            patient_id,
            shape,
            voxels,
            mask,
        })
    }

    pub fn depth(&self) -> usize {
        self.shape[0]
    }

    pub fn slice_len(&self) -> usize {
        self.shape[1] * self.shape[2]
    }

    pub fn has_mask(&self) -> bool {
        self.mask.is_some()
    }

    /// Voxels of slice `index`, `None` past the last slice.
    pub fn slice(&self, index: usize) -> Option<&[f32]> {
        let len = self.slice_len();
        self.voxels.get(index * len..(index + 1) * len)
    }

    pub fn mask_slice(&self, index: usize) -> Option<&[u8]> {
        let len = self.slice_len();
        self.mask.as_ref()?.get(index * len..(index + 1) * len)
    }
}

/// Every patient volume of a study, persisted as a single bincode file.
#[derive(Clone, Debug, Default, PartialEq, Encode, Decode)]
pub struct VolumeArchive {
    volumes: Vec<PatientVolume>,
}

impl VolumeArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, volume: PatientVolume) -> Result<(), DatasetError> {
        if self.get(&volume.patient_id).is_some() {
            return Err(DatasetError::DuplicatePatient(volume.patient_id));
        }
        self.volumes.push(volume);
        Ok(())
    }

    pub fn get(&self, patient_id: &str) -> Option<&PatientVolume> {
        self.volumes
            .iter()
            .find(|volume| volume.patient_id == patient_id)
    }

    pub fn volume(&self, patient_id: &str) -> Result<&PatientVolume, DatasetError> {
        self.get(patient_id)
            .ok_or_else(|| DatasetError::UnknownPatient(patient_id.to_string()))
    }

    pub fn patient_ids(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|volume| volume.patient_id.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatientVolume> {
        self.volumes.iter()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::encode_into_std_write(self, &mut writer, bincode::config::standard())?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let mut reader = BufReader::new(File::open(path)?);
        let archive = bincode::decode_from_std_read(&mut reader, bincode::config::standard())?;
        Ok(archive)
    }
}

/// Clinical metadata of one patient. Only the binary `label` is required,
/// any other field is kept as is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub label: u8,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// `{ "<patient>": { "label": 0 | 1, ... } }`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientMetadata {
    patients: BTreeMap<String, PatientRecord>,
}

impl PatientMetadata {
    pub fn insert(&mut self, patient_id: impl Into<String>, label: u8) {
        self.patients.insert(
            patient_id.into(),
            PatientRecord {
                label,
                extra: BTreeMap::new(),
            },
        );
    }

    pub fn get(&self, patient_id: &str) -> Option<&PatientRecord> {
        self.patients.get(patient_id)
    }

    /// Binary label of a patient as a float target.
    pub fn label(&self, patient_id: &str) -> Result<f32, DatasetError> {
        let record = self
            .get(patient_id)
            .ok_or_else(|| DatasetError::MissingLabel(patient_id.to_string()))?;

        match record.label {
            0 => Ok(0.0),
            1 => Ok(1.0),
            label => Err(DatasetError::InvalidLabel {
                patient: patient_id.to_string(),
                label,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
