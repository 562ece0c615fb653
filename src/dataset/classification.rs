//! Whole-volume generator for the 3-D CNN.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;

use super::{DatasetError, PatientMetadata, VolumeArchive};
use crate::imaging::scale_image;

#[derive(Clone, Debug)]
pub struct VolumeItem {
    pub patient_id: String,
    pub shape: [usize; 3],
    /// `[depth, height, width]`, min-max scaled.
    pub voxels: Vec<f32>,
    pub label: f32,
}

#[derive(Clone, Debug)]
pub struct VolumeDataset {
    items: Arc<Vec<VolumeItem>>,
    shape: [usize; 3],
}

impl VolumeDataset {
    /// Load and scale the volumes of `patient_ids` with their metadata labels.
    pub fn new(
        archive: &VolumeArchive,
        metadata: &PatientMetadata,
        patient_ids: &[String],
    ) -> Result<Self, DatasetError> {
        let mut items = Vec::with_capacity(patient_ids.len());
        let mut shape: Option<[usize; 3]> = None;

        for patient_id in patient_ids {
            let volume = archive.volume(patient_id)?;
            let label = metadata.label(patient_id)?;

            match shape {
                Some(expected) if expected != volume.shape => {
                    return Err(DatasetError::InconsistentShape {
                        patient: patient_id.clone(),
                        expected: expected.to_vec(),
                        actual: volume.shape.to_vec(),
                    });
                }
                _ => shape = Some(volume.shape),
            }

            items.push(VolumeItem {
                patient_id: patient_id.clone(),
                shape: volume.shape,
                voxels: scale_image(&volume.voxels),
                label,
            });
        }

        let positives = items.iter().filter(|item| item.label > 0.5).count();
        tracing::debug!(
            "Volume dataset with {} patients ({} positive), shape {:?}",
            items.len(),
            positives,
            shape
        );

        Ok(Self {
            items: Arc::new(items),
            shape: shape.unwrap_or_default(),
        })
    }

    /// `[depth, height, width]` shared by every volume.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }
}

impl Dataset<VolumeItem> for VolumeDataset {
    fn get(&self, index: usize) -> Option<VolumeItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Clone)]
pub struct VolumeBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> VolumeBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

#[derive(Clone, Debug)]
pub struct VolumeBatch<B: Backend> {
    /// `[batch, 1, depth, height, width]`
    pub volumes: Tensor<B, 5>,
    /// `[batch, 1]`
    pub labels: Tensor<B, 2>,
}

impl<B: Backend> Batcher<VolumeItem, VolumeBatch<B>> for VolumeBatcher<B> {
    fn batch(&self, items: Vec<VolumeItem>) -> VolumeBatch<B> {
        let labels: Vec<f32> = items.iter().map(|item| item.label).collect();
        let batch_size = labels.len();

        let volumes = items
            .into_iter()
            .map(|item| {
                let [depth, height, width] = item.shape;
                Tensor::<B, 4>::from_data(
                    TensorData::new(item.voxels, Shape::new([1, depth, height, width]))
                        .convert::<B::FloatElem>(),
                    &self.device,
                )
            })
            .collect();

        let labels = Tensor::<B, 2>::from_data(
            TensorData::new(labels, Shape::new([batch_size, 1])).convert::<B::FloatElem>(),
            &self.device,
        );

        VolumeBatch {
            volumes: Tensor::stack(volumes, 0),
            labels,
        }
    }
}
