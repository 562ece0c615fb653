use burn::{
    module::{Ignored, Param},
    nn::{
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, PaddingConfig2d,
        PaddingConfig3d,
        conv::{Conv2d, Conv2dConfig, Conv3d, Conv3dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    tensor::activation::{relu, sigmoid},
};
use serde::{Deserialize, Serialize};

/// Activation applied after every convolution of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Elu,
    Relu,
    Sigmoid,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Elu => elu(x),
            Activation::Relu => relu(x),
            Activation::Sigmoid => sigmoid(x),
        }
    }
}

/// Exponential linear unit with `alpha = 1`.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    x.clamp_min(0.0) + negative
}

/// LeCun uniform, `U(-sqrt(3 / fan_in), sqrt(3 / fan_in))`.
pub(crate) fn lecun_uniform() -> Initializer {
    Initializer::KaimingUniform {
        gain: 1.0,
        fan_out_only: false,
    }
}

/// Zero bias, the LeCun draw is only meant for the weights.
pub(crate) fn zero_bias<B: Backend>(
    bias: Option<Param<Tensor<B, 1>>>,
) -> Option<Param<Tensor<B, 1>>> {
    bias.map(|bias| Param::from_tensor(bias.val().zeros_like()))
}

fn optional_dropout(prob: f64) -> Option<Dropout> {
    (prob > 0.0).then(|| DropoutConfig::new(prob).init())
}

#[derive(Module, Debug)]
pub struct ConvLayer<B: Backend> {
    conv: Conv2d<B>,
    dropout: Option<Dropout>,
    norm: Option<BatchNorm<B, 2>>,
}

/// `n_layers` same-padded convolutions, each followed by the activation,
/// dropout and batch normalization.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    layers: Vec<ConvLayer<B>>,
    activation: Ignored<Activation>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| {
            let x = self.activation.0.forward(layer.conv.forward(x));
            let x = match &layer.dropout {
                Some(dropout) => dropout.forward(x),
                None => x,
            };
            match &layer.norm {
                Some(norm) => norm.forward(x),
                None => x,
            }
        })
    }
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = 2)]
    n_layers: usize,
    #[config(default = 3)]
    kernel_size: usize,
    #[config(default = 0.25)]
    dropout: f64,
    #[config(default = false)]
    batch_norm: bool,
    #[config(default = "Activation::Elu")]
    activation: Activation,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let layers = (0..self.n_layers)
            .map(|i| {
                let input_channels = if i == 0 {
                    self.input_channels
                } else {
                    self.num_filters
                };
                let mut conv = Conv2dConfig::new(
                    [input_channels, self.num_filters],
                    [self.kernel_size, self.kernel_size],
                )
                .with_padding(PaddingConfig2d::Same)
                .with_initializer(lecun_uniform())
                .init(device);
                conv.bias = zero_bias(conv.bias);

                ConvLayer {
                    conv,
                    dropout: optional_dropout(self.dropout),
                    norm: self
                        .batch_norm
                        .then(|| BatchNormConfig::new(self.num_filters).init(device)),
                }
            })
            .collect();

        ConvBlock {
            layers,
            activation: Ignored(self.activation),
        }
    }
}

/// Convolutions followed by a 2x2 max-pool. The features before pooling are
/// returned alongside for the skip connection.
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    conv_block: ConvBlock<B>,
    max_pool: MaxPool2d,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip_features = self.conv_block.forward(x);
        let x = self.max_pool.forward(skip_features.clone());

        (x, skip_features)
    }
}

#[derive(Config, Debug)]
pub struct EncoderBlockConfig {
    conv_block: ConvBlockConfig,
}

impl EncoderBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncoderBlock<B> {
        EncoderBlock {
            conv_block: self.conv_block.init(device),
            max_pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

/// Stride-2 transposed convolution doubling height and width, concatenated
/// with the skip features along the channels.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    conv_transpose: ConvTranspose2d<B>,
    dropout: Option<Dropout>,
}

impl<B: Backend> UpBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>, skip_features: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv_transpose.forward(x);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };

        Tensor::cat(vec![x, skip_features], 1)
    }
}

#[derive(Config, Debug)]
pub struct UpBlockConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = 3)]
    kernel_size: usize,
    #[config(default = 0.25)]
    dropout: f64,
}

impl UpBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UpBlock<B> {
        // output = (input - 1) * 2 - 2 * padding + kernel + padding_out = 2 * input
        let padding = (self.kernel_size - 1) / 2;
        let padding_out = self.kernel_size % 2;

        let mut conv_transpose = ConvTranspose2dConfig::new(
            [self.input_channels, self.num_filters],
            [self.kernel_size, self.kernel_size],
        )
        .with_stride([2, 2])
        .with_padding([padding, padding])
        .with_padding_out([padding_out, padding_out])
        .with_initializer(lecun_uniform())
        .init(device);
        conv_transpose.bias = zero_bias(conv_transpose.bias);

        UpBlock {
            conv_transpose,
            dropout: optional_dropout(self.dropout),
        }
    }
}

#[derive(Module, Debug)]
pub struct Conv3dLayer<B: Backend> {
    conv: Conv3d<B>,
    dropout: Option<Dropout>,
    norm: Option<BatchNorm<B, 3>>,
}

/// 3-D counterpart of [ConvBlock] followed by a 2x2x2 max-pool.
#[derive(Module, Debug)]
pub struct Conv3dBlock<B: Backend> {
    layers: Vec<Conv3dLayer<B>>,
    activation: Ignored<Activation>,
    max_pool: MaxPool2d,
}

impl<B: Backend> Conv3dBlock<B> {
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.layers.iter().fold(x, |x, layer| {
            let x = self.activation.0.forward(layer.conv.forward(x));
            let x = match &layer.dropout {
                Some(dropout) => dropout.forward(x),
                None => x,
            };
            match &layer.norm {
                Some(norm) => norm.forward(x),
                None => x,
            }
        });

        self.max_pool_3d(x)
    }

    /// Pool height and width with the 2-D pool, then take the max of every
    /// pair of consecutive depth slices.
    fn max_pool_3d(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let [batch, channels, depth, height, width] = x.dims();
        let (depth, height, width) = (depth / 2, height / 2, width / 2);

        let x = x.reshape([batch, channels * depth * 2, height * 2, width * 2]);
        let x = self.max_pool.forward(x);
        let x = x
            .reshape([batch, channels, depth, 2, height * width])
            .max_dim(3);

        x.reshape([batch, channels, depth, height, width])
    }
}

#[derive(Config, Debug)]
pub struct Conv3dBlockConfig {
    input_channels: usize,
    num_filters: usize,
    #[config(default = 2)]
    n_layers: usize,
    #[config(default = 3)]
    kernel_size: usize,
    #[config(default = 0.25)]
    dropout: f64,
    #[config(default = false)]
    batch_norm: bool,
    #[config(default = "Activation::Elu")]
    activation: Activation,
}

impl Conv3dBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv3dBlock<B> {
        let padding = (self.kernel_size - 1) / 2;
        let layers = (0..self.n_layers)
            .map(|i| {
                let input_channels = if i == 0 {
                    self.input_channels
                } else {
                    self.num_filters
                };
                let mut conv =
                    Conv3dConfig::new([input_channels, self.num_filters], [self.kernel_size; 3])
                        .with_padding(PaddingConfig3d::Explicit(padding, padding, padding))
                        .with_initializer(lecun_uniform())
                        .init(device);
                conv.bias = zero_bias(conv.bias);

                Conv3dLayer {
                    conv,
                    dropout: optional_dropout(self.dropout),
                    norm: self
                        .batch_norm
                        .then(|| BatchNormConfig::new(self.num_filters).init(device)),
                }
            })
            .collect();

        Conv3dBlock {
            layers,
            activation: Ignored(self.activation),
            max_pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}
