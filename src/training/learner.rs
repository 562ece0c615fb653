use burn::{prelude::*, tensor::DataError};
use derive_new::new;

use super::loss::LossReport;

/// Output of one train or validation step.
///
/// `D` is the rank of the model output: 4 for U-Net masks, 2 for 3-D CNN
/// volume probabilities.
#[derive(new)]
pub struct PredictionOutput<B: Backend, const D: usize> {
    pub loss: Tensor<B, 1>,
    pub output: Tensor<B, D>,
    pub targets: Tensor<B, D>,
    pub report: LossReport,
}

impl<B: Backend, const D: usize> PredictionOutput<B, D> {
    pub fn batch_size(&self) -> usize {
        self.output.dims()[0]
    }

    pub fn loss_value(&self) -> f64 {
        self.loss.clone().into_scalar().elem::<f64>()
    }

    /// Flattened predicted probabilities and ground truth, in matching order.
    pub fn scores_and_labels(&self) -> Result<(Vec<f32>, Vec<f32>), DataError> {
        let scores = self
            .output
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()?;
        let labels = self
            .targets
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()?;

        Ok((scores, labels))
    }
}
