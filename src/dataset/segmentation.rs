//! 2.5-D slice generator for the U-Net.
//!
//! Every item is one mask slice of a patient with `2k + 1` neighbouring image
//! slices stacked as channels. Slices past either end of the volume are
//! clamped to the first or last slice.

use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;

use super::{DatasetError, VolumeArchive};
use crate::imaging::scale_image;

#[derive(Clone, Debug)]
pub struct SliceItem {
    pub patient_id: String,
    pub slice: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// `[channels, height, width]`, min-max scaled per volume.
    pub image: Vec<f32>,
    /// `[height, width]` in `{0, 1}`.
    pub mask: Vec<f32>,
}

#[derive(Debug)]
struct ScaledVolume {
    patient_id: String,
    depth: usize,
    voxels: Vec<f32>,
    mask: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SliceDataset {
    volumes: Arc<Vec<ScaledVolume>>,
    index: Vec<(usize, usize)>,
    context: usize,
    height: usize,
    width: usize,
}

impl SliceDataset {
    /// Enumerate every slice of the masked patients among `patient_ids`.
    ///
    /// Patients without a mask are skipped. All volumes must share the same
    /// slice size so slices can be batched together.
    pub fn new(
        archive: &VolumeArchive,
        patient_ids: &[String],
        context: usize,
    ) -> Result<Self, DatasetError> {
        let mut volumes = Vec::new();
        let mut index = Vec::new();
        let mut slice_size: Option<[usize; 2]> = None;

        for patient_id in patient_ids {
            let volume = archive.volume(patient_id)?;
            let Some(mask) = &volume.mask else {
                tracing::debug!("Skipping patient {} without segmentation mask", patient_id);
                continue;
            };

            let [depth, height, width] = volume.shape;
            if depth == 0 {
                return Err(DatasetError::EmptyPatient(patient_id.clone()));
            }
            match slice_size {
                Some(size) if size != [height, width] => {
                    return Err(DatasetError::InconsistentShape {
                        patient: patient_id.clone(),
                        expected: size.to_vec(),
                        actual: vec![height, width],
                    });
                }
                _ => slice_size = Some([height, width]),
            }

            let position = volumes.len();
            index.extend((0..depth).map(|slice| (position, slice)));
            volumes.push(ScaledVolume {
                patient_id: patient_id.clone(),
                depth,
                voxels: scale_image(&volume.voxels),
                mask: mask.clone(),
            });
        }

        let [height, width] =
            slice_size.ok_or(DatasetError::NoMaskedPatients(patient_ids.len()))?;
        tracing::debug!(
            "Slice dataset with {} slices from {} patients, input shape [{}, {}, {}]",
            index.len(),
            volumes.len(),
            2 * context + 1,
            height,
            width
        );

        Ok(Self {
            volumes: Arc::new(volumes),
            index,
            context,
            height,
            width,
        })
    }

    /// Number of stacked input slices, `2k + 1`.
    pub fn channels(&self) -> usize {
        2 * self.context + 1
    }

    pub fn slice_size(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    pub fn num_patients(&self) -> usize {
        self.volumes.len()
    }
}

impl Dataset<SliceItem> for SliceDataset {
    fn get(&self, index: usize) -> Option<SliceItem> {
        let &(position, slice) = self.index.get(index)?;
        let volume = self.volumes.get(position)?;
        let slice_len = self.height * self.width;

        let first = slice as isize - self.context as isize;
        let mut image = Vec::with_capacity(self.channels() * slice_len);
        for offset in 0..self.channels() as isize {
            let source = (first + offset).clamp(0, volume.depth as isize - 1) as usize;
            image.extend_from_slice(volume.voxels.get(source * slice_len..(source + 1) * slice_len)?);
        }

        let mask = volume
            .mask
            .get(slice * slice_len..(slice + 1) * slice_len)?
            .iter()
            .map(|&label| if label > 0 { 1.0 } else { 0.0 })
            .collect();

        Some(SliceItem {
            patient_id: volume.patient_id.clone(),
            slice,
            channels: self.channels(),
            height: self.height,
            width: self.width,
            image,
            mask,
        })
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Clone)]
pub struct SegmentationBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SegmentationBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

#[derive(Clone, Debug)]
pub struct SegmentationBatch<B: Backend> {
    /// `[batch, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch, 1, height, width]`
    pub masks: Tensor<B, 4>,
}

impl<B: Backend> Batcher<SliceItem, SegmentationBatch<B>> for SegmentationBatcher<B> {
    fn batch(&self, items: Vec<SliceItem>) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());

        for item in items {
            let image = Tensor::<B, 3>::from_data(
                TensorData::new(item.image, Shape::new([item.channels, item.height, item.width]))
                    .convert::<B::FloatElem>(),
                &self.device,
            );
            let mask = Tensor::<B, 3>::from_data(
                TensorData::new(item.mask, Shape::new([1, item.height, item.width]))
                    .convert::<B::FloatElem>(),
                &self.device,
            );

            images.push(image);
            masks.push(mask);
        }

        SegmentationBatch {
            images: Tensor::stack(images, 0),
            masks: Tensor::stack(masks, 0),
        }
    }
}
