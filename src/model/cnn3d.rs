use burn::{
    module::Ignored,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{activation::sigmoid, backend::AutodiffBackend},
    train::{TrainOutput, TrainStep, ValidStep},
};

use super::blocks::{Activation, Conv3dBlock, Conv3dBlockConfig, lecun_uniform, zero_bias};
use super::{ModelError, check_divisible, check_layer_params, check_positive};
use crate::dataset::VolumeBatch;
use crate::training::{PredictionOutput, SegmentationLoss, SegmentationLossConfig};

/// Whole-volume binary classifier.
#[derive(Module, Debug)]
pub struct Cnn3d<B: Backend> {
    blocks: Vec<Conv3dBlock<B>>,
    dense: Linear<B>,
    dropout: Dropout,
    classifier: Linear<B>,
    activation: Ignored<Activation>,
    loss: SegmentationLoss,
}

#[derive(Config, Debug)]
pub struct Cnn3dConfig {
    #[config(default = 8)]
    pub n_filters: usize,
    #[config(default = 3)]
    pub n_blocks: usize,
    #[config(default = 2)]
    pub n_layers_conv: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 0.25)]
    pub dropout: f64,
    #[config(default = false)]
    pub batch_norm: bool,
    #[config(default = 32)]
    pub dense_units: usize,
    #[config(default = "Activation::Elu")]
    pub activation: Activation,
    #[config(default = "SegmentationLossConfig::new()")]
    pub loss: SegmentationLossConfig,
}

impl Cnn3dConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        check_positive(&[
            ("n_filters", self.n_filters),
            ("n_blocks", self.n_blocks),
            ("n_layers_conv", self.n_layers_conv),
            ("dense_units", self.dense_units),
        ])?;
        check_layer_params(self.kernel_size, self.dropout)
    }

    /// Depth, height and width must survive `n_blocks` halvings.
    pub fn check_input_size(&self, shape: [usize; 3]) -> Result<(), ModelError> {
        check_divisible(&shape, self.n_blocks)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Cnn3d<B> {
        let blocks = (0..self.n_blocks)
            .map(|i| {
                let input_channels = if i == 0 { 1 } else { self.n_filters << (i - 1) };
                Conv3dBlockConfig::new(input_channels, self.n_filters << i)
                    .with_n_layers(self.n_layers_conv)
                    .with_kernel_size(self.kernel_size)
                    .with_dropout(self.dropout)
                    .with_batch_norm(self.batch_norm)
                    .with_activation(self.activation)
                    .init(device)
            })
            .collect();

        let features = match self.n_blocks {
            0 => 1,
            n => self.n_filters << (n - 1),
        };

        let mut dense = LinearConfig::new(features, self.dense_units)
            .with_initializer(lecun_uniform())
            .init(device);
        dense.bias = zero_bias(dense.bias);
        let mut classifier = LinearConfig::new(self.dense_units, 1)
            .with_initializer(lecun_uniform())
            .init(device);
        classifier.bias = zero_bias(classifier.bias);

        Cnn3d {
            blocks,
            dense,
            dropout: DropoutConfig::new(self.dropout).init(),
            classifier,
            activation: Ignored(self.activation),
            loss: self.loss.init(),
        }
    }
}

impl<B: Backend> Cnn3d<B> {
    /// `[batch, 1, depth, height, width]` to `[batch, 1]` probabilities.
    pub fn forward(&self, volumes: Tensor<B, 5>) -> Tensor<B, 2> {
        let [batch, _, depth, height, width] = volumes.dims();
        let divisor = 1 << self.blocks.len();
        assert!(
            [depth, height, width].iter().all(|size| size % divisor == 0),
            "Input size {depth}x{height}x{width} must be divisible by {divisor}"
        );

        let x = self
            .blocks
            .iter()
            .fold(volumes, |x, block| block.forward(x));

        // global average pooling
        let [_, channels, _, _, _] = x.dims();
        let x = x
            .mean_dim(4)
            .mean_dim(3)
            .mean_dim(2)
            .reshape([batch, channels]);

        let x = self.activation.0.forward(self.dense.forward(x));
        let x = self.dropout.forward(x);

        sigmoid(self.classifier.forward(x))
    }

    pub fn forward_classification(&self, batch: VolumeBatch<B>) -> PredictionOutput<B, 2> {
        let targets = batch.labels;
        let output = self.forward(batch.volumes);

        let loss = self.loss.forward(output.clone(), targets.clone());
        let report = self.loss.report(output.clone(), targets.clone());

        PredictionOutput::new(loss, output, targets, report)
    }
}

impl<B: AutodiffBackend> TrainStep<VolumeBatch<B>, PredictionOutput<B, 2>> for Cnn3d<B> {
    fn step(&self, batch: VolumeBatch<B>) -> TrainOutput<PredictionOutput<B, 2>> {
        let item = self.forward_classification(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<VolumeBatch<B>, PredictionOutput<B, 2>> for Cnn3d<B> {
    fn step(&self, batch: VolumeBatch<B>) -> PredictionOutput<B, 2> {
        self.forward_classification(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn small_config() -> Cnn3dConfig {
        Cnn3dConfig::new()
            .with_n_filters(2)
            .with_n_blocks(2)
            .with_n_layers_conv(1)
            .with_dense_units(4)
    }

    #[test]
    fn defaults() {
        let config = Cnn3dConfig::new();

        assert_eq!(config.n_filters, 8);
        assert_eq!(config.n_blocks, 3);
        assert_eq!(config.dense_units, 32);
        assert!(config.validate().is_ok());
        assert!(config.check_input_size([16, 32, 32]).is_ok());
        assert!(config.check_input_size([12, 32, 32]).is_err());
    }

    #[test]
    fn dense_biases_start_at_zero() {
        let model = small_config().init::<TestBackend>(&Default::default());

        for linear in [&model.dense, &model.classifier] {
            let bias = linear.bias.as_ref().unwrap().val().into_data();
            assert!(bias.to_vec::<f32>().unwrap().iter().all(|&b| b == 0.0));
        }
    }

    #[test]
    fn outputs_one_probability_per_volume() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device);

        let output = model.forward(Tensor::random([3, 1, 4, 8, 8], Distribution::Default, &device));

        assert_eq!(output.dims(), [3, 1]);
        let values = output.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn train_step_on_autodiff_backend() {
        let device = Default::default();
        let model = small_config().init::<Autodiff<TestBackend>>(&device);
        let batch = VolumeBatch {
            volumes: Tensor::random([2, 1, 4, 4, 4], Distribution::Default, &device),
            labels: Tensor::from_floats([[1.0], [0.0]], &device),
        };

        let output = TrainStep::step(&model, batch);

        assert!(output.item.loss_value().is_finite());
        let (scores, labels) = output.item.scores_and_labels().unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(labels, vec![1.0, 0.0]);
    }
}
