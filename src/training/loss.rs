//! Probability-space losses for binary segmentation and volume classification.
//!
//! All losses expect predictions that already went through a sigmoid and float
//! targets in `{0, 1}` with the same shape. They are rank generic so the same
//! code scores U-Net masks `[batch, 1, height, width]` and 3-D CNN outputs
//! `[batch, 1]`.

use std::{fmt, str::FromStr};

use burn::{module::Ignored, prelude::*};
use serde::{Deserialize, Serialize};

use super::metrics::binary_accuracy;

/// Clip bound used to keep `ln(p)` and `ln(1 - p)` finite.
pub const EPSILON: f64 = 1e-7;

/// Objective selected for training.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    WeightedCrossentropy,
    DiceLoss,
}

impl LossKind {
    pub const SUPPORTED: [&'static str; 2] = ["weighted_crossentropy", "dice_loss"];

    pub fn name(&self) -> &'static str {
        match self {
            LossKind::WeightedCrossentropy => "weighted_crossentropy",
            LossKind::DiceLoss => "dice_loss",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("loss function `{name}` is not supported, supported loss functions are: {supported:?}")]
pub struct UnsupportedLoss {
    pub name: String,
    pub supported: [&'static str; 2],
}

impl FromStr for LossKind {
    type Err = UnsupportedLoss;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_crossentropy" => Ok(LossKind::WeightedCrossentropy),
            "dice_loss" => Ok(LossKind::DiceLoss),
            other => Err(UnsupportedLoss {
                name: other.to_string(),
                supported: Self::SUPPORTED,
            }),
        }
    }
}

/// Binary cross-entropy with a weight `alpha` on the positive term.
///
/// A reasonable starting point for `alpha` is the ratio of negative to
/// positive voxels in the training set.
#[derive(Module, Clone, Debug)]
pub struct WeightedCrossEntropyLoss {
    pub alpha: f64,
}

impl WeightedCrossEntropyLoss {
    pub fn new(alpha: f64) -> Self {
        assert!(
            alpha > 0.0,
            "Positive class weight of cross-entropy has to be positive. Got {}",
            alpha
        );
        Self { alpha }
    }

    pub fn forward<B: Backend, const D: usize>(
        &self,
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        assert_same_dims(&predictions, &targets);

        let predictions = predictions.clamp(EPSILON, 1.0 - EPSILON);

        let positive = targets.clone() * predictions.clone().log() * (-self.alpha);
        let negative =
            targets.neg().add_scalar(1.0) * predictions.neg().add_scalar(1.0).log() * -1.0;

        (positive + negative).mean()
    }
}

/// Dice loss, `1 - 2 (s + Σ y·p) / (s + Σ (y + p))`.
///
/// The smoothing term keeps the ratio defined for empty masks and helps
/// convergence while the overlap is still small.
#[derive(Module, Clone, Debug)]
pub struct DiceLoss {
    pub smooth: f64,
}

impl DiceLoss {
    pub fn new(smooth: f64) -> Self {
        assert!(
            smooth >= 0.,
            "Smoothing factor must be non-negative. Got {}",
            smooth
        );
        Self { smooth }
    }

    pub fn forward<B: Backend, const D: usize>(
        &self,
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        assert_same_dims(&predictions, &targets);

        let intersection = (targets.clone() * predictions.clone()).sum();
        let numerator = intersection.add_scalar(self.smooth) * 2.0;
        let denominator = (targets + predictions).sum().add_scalar(self.smooth);

        (numerator / denominator).neg().add_scalar(1.0)
    }
}

/// Dice loss averaged over the foreground and the background.
///
/// Only used for reporting: it stays informative when the foreground is tiny
/// and the plain Dice ratio saturates.
#[derive(Clone, Copy, Debug, Default)]
pub struct BalancedDiceLoss;

impl BalancedDiceLoss {
    pub fn forward<B: Backend, const D: usize>(
        &self,
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        assert_same_dims(&predictions, &targets);

        let inverse_predictions = predictions.clone().neg().add_scalar(1.0);
        let inverse_targets = targets.clone().neg().add_scalar(1.0);

        let num_pos = (targets.clone() * predictions.clone()).sum() * 2.0;
        let denom_pos = (targets + predictions).sum().add_scalar(EPSILON);

        let num_neg = (inverse_targets.clone() * inverse_predictions.clone()).sum() * 2.0;
        let denom_neg = (inverse_targets + inverse_predictions)
            .sum()
            .add_scalar(EPSILON);

        let positive = num_pos / denom_pos * 0.5;
        let negative = num_neg / denom_neg * 0.5;

        (positive + negative).neg().add_scalar(1.0)
    }
}

/// Configuration to create a [SegmentationLoss].
#[derive(Config, Debug)]
pub struct SegmentationLossConfig {
    /// Objective minimised during training.
    #[config(default = "LossKind::WeightedCrossentropy")]
    pub kind: LossKind,

    /// Weight on positive voxels for the weighted cross-entropy.
    #[config(default = 3.0)]
    pub bce_alpha: f64,

    /// Smoothing factor added to numerator and denominator of the Dice ratio.
    #[config(default = 1.0)]
    pub dice_smooth: f64,
}

impl SegmentationLossConfig {
    pub fn init(&self) -> SegmentationLoss {
        SegmentationLoss {
            kind: Ignored(self.kind),
            weighted_crossentropy: WeightedCrossEntropyLoss::new(self.bce_alpha),
            dice: DiceLoss::new(self.dice_smooth),
        }
    }
}

/// Training objective plus the secondary losses reported every epoch.
#[derive(Module, Clone, Debug)]
pub struct SegmentationLoss {
    kind: Ignored<LossKind>,
    weighted_crossentropy: WeightedCrossEntropyLoss,
    dice: DiceLoss,
}

/// Scalar values of every tracked loss for one batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LossReport {
    pub accuracy: f64,
    pub weighted_crossentropy: f64,
    pub dice_loss: f64,
    pub balanced_dice: f64,
}

impl LossReport {
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("accuracy", self.accuracy),
            ("weighted_crossentropy", self.weighted_crossentropy),
            ("dice_loss", self.dice_loss),
            ("balanced_dice", self.balanced_dice),
        ]
    }
}

impl SegmentationLoss {
    pub fn kind(&self) -> LossKind {
        self.kind.0
    }

    pub fn forward<B: Backend, const D: usize>(
        &self,
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> Tensor<B, 1> {
        match self.kind.0 {
            LossKind::WeightedCrossentropy => {
                self.weighted_crossentropy.forward(predictions, targets)
            }
            LossKind::DiceLoss => self.dice.forward(predictions, targets),
        }
    }

    /// Evaluate all reporting losses on detached tensors.
    pub fn report<B: Backend, const D: usize>(
        &self,
        predictions: Tensor<B, D>,
        targets: Tensor<B, D>,
    ) -> LossReport {
        let predictions = predictions.detach();
        let targets = targets.detach();

        LossReport {
            accuracy: binary_accuracy(predictions.clone(), targets.clone()),
            weighted_crossentropy: scalar(
                self.weighted_crossentropy
                    .forward(predictions.clone(), targets.clone()),
            ),
            dice_loss: scalar(self.dice.forward(predictions.clone(), targets.clone())),
            balanced_dice: scalar(BalancedDiceLoss.forward(predictions, targets)),
        }
    }
}

fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

fn assert_same_dims<B: Backend, const D: usize>(
    predictions: &Tensor<B, D>,
    targets: &Tensor<B, D>,
) {
    assert_eq!(
        predictions.dims(),
        targets.dims(),
        "Shape mismatch: predictions ({:?}) vs targets ({:?})",
        predictions.dims(),
        targets.dims()
    );
}
