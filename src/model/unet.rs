use burn::{
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{TrainOutput, TrainStep, ValidStep},
};

use super::blocks::{
    Activation, ConvBlock, ConvBlockConfig, EncoderBlock, EncoderBlockConfig, UpBlock,
    UpBlockConfig,
};
use super::{ModelError, check_divisible, check_layer_params, check_positive};
use crate::dataset::SegmentationBatch;
use crate::training::{PredictionOutput, SegmentationLoss, SegmentationLossConfig};

/// 2.5-D U-Net: adjacent slices stacked as channels in, one probability mask
/// out.
#[derive(Module, Debug)]
pub struct UNet2p5d<B: Backend> {
    encoder_blocks: Vec<EncoderBlock<B>>,
    bottom: ConvBlock<B>,
    up_blocks: Vec<UpBlock<B>>,
    lateral_blocks: Vec<ConvBlock<B>>,
    output: ConvBlock<B>,
    loss: SegmentationLoss,
    n_layers_unet: usize,
}

#[derive(Config, Debug)]
pub struct UNet2p5dConfig {
    /// Number of stacked slices.
    pub input_channels: usize,
    /// Filters of the first level, doubled at every level down.
    #[config(default = 16)]
    pub n_filters: usize,
    /// Convolutions per block.
    #[config(default = 2)]
    pub n_layers_conv: usize,
    /// Number of pooling levels.
    #[config(default = 3)]
    pub n_layers_unet: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 0.25)]
    pub dropout: f64,
    #[config(default = false)]
    pub batch_norm: bool,
    #[config(default = "Activation::Elu")]
    pub activation: Activation,
    #[config(default = "SegmentationLossConfig::new()")]
    pub loss: SegmentationLossConfig,
}

impl UNet2p5dConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        check_positive(&[
            ("input_channels", self.input_channels),
            ("n_filters", self.n_filters),
            ("n_layers_conv", self.n_layers_conv),
            ("n_layers_unet", self.n_layers_unet),
        ])?;
        check_layer_params(self.kernel_size, self.dropout)
    }

    /// Height and width must survive `n_layers_unet` halvings.
    pub fn check_input_size(&self, size: [usize; 2]) -> Result<(), ModelError> {
        check_divisible(&size, self.n_layers_unet)
    }

    fn conv_block(&self, input_channels: usize, num_filters: usize) -> ConvBlockConfig {
        ConvBlockConfig::new(input_channels, num_filters)
            .with_n_layers(self.n_layers_conv)
            .with_kernel_size(self.kernel_size)
            .with_dropout(self.dropout)
            .with_batch_norm(self.batch_norm)
            .with_activation(self.activation)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet2p5d<B> {
        let n = self.n_layers_unet;
        let filters = |level: usize| self.n_filters << level;

        let encoder_blocks = (0..n)
            .map(|i| {
                let input_channels = if i == 0 {
                    self.input_channels
                } else {
                    filters(i - 1)
                };
                EncoderBlockConfig::new(self.conv_block(input_channels, filters(i))).init(device)
            })
            .collect();

        let bottom_input = if n == 0 {
            self.input_channels
        } else {
            filters(n - 1)
        };
        let bottom = self.conv_block(bottom_input, filters(n)).init(device);

        let mut up_blocks = Vec::with_capacity(n);
        let mut lateral_blocks = Vec::with_capacity(n);
        let mut channels = filters(n);
        for i in 0..n {
            let skip_level = n - 1 - i;
            up_blocks.push(
                UpBlockConfig::new(channels, self.n_filters)
                    .with_kernel_size(self.kernel_size)
                    .with_dropout(self.dropout)
                    .init(device),
            );
            lateral_blocks.push(
                self.conv_block(self.n_filters + filters(skip_level), filters(skip_level))
                    .init(device),
            );
            channels = filters(skip_level);
        }

        let output = ConvBlockConfig::new(channels, 1)
            .with_n_layers(1)
            .with_kernel_size(self.kernel_size)
            .with_dropout(0.0)
            .with_activation(Activation::Sigmoid)
            .init(device);

        UNet2p5d {
            encoder_blocks,
            bottom,
            up_blocks,
            lateral_blocks,
            output,
            loss: self.loss.init(),
            n_layers_unet: n,
        }
    }
}

impl<B: Backend> UNet2p5d<B> {
    /// `[batch, slices, height, width]` to `[batch, 1, height, width]` probabilities.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = images.dims();
        let divisor = 1 << self.n_layers_unet;
        assert!(
            height % divisor == 0 && width % divisor == 0,
            "Input size {height}x{width} must be divisible by {divisor}"
        );

        let mut skips = Vec::with_capacity(self.encoder_blocks.len());
        let mut x = images;
        for encoder in &self.encoder_blocks {
            let (pooled, skip) = encoder.forward(x);
            skips.push(skip);
            x = pooled;
        }

        let mut x = self.bottom.forward(x);

        for (up, lateral) in self.up_blocks.iter().zip(&self.lateral_blocks) {
            let Some(skip) = skips.pop() else { break };
            x = lateral.forward(up.forward(x, skip));
        }

        self.output.forward(x)
    }

    pub fn loss(&self) -> &SegmentationLoss {
        &self.loss
    }

    pub fn forward_segmentation(&self, batch: SegmentationBatch<B>) -> PredictionOutput<B, 4> {
        let targets = batch.masks;
        let output = self.forward(batch.images);

        let loss = self.loss.forward(output.clone(), targets.clone());
        let report = self.loss.report(output.clone(), targets.clone());

        PredictionOutput::new(loss, output, targets, report)
    }
}

impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, PredictionOutput<B, 4>> for UNet2p5d<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<PredictionOutput<B, 4>> {
        let item = self.forward_segmentation(batch);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SegmentationBatch<B>, PredictionOutput<B, 4>> for UNet2p5d<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> PredictionOutput<B, 4> {
        self.forward_segmentation(batch)
    }
}
