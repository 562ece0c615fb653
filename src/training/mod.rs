mod config;
mod error;
pub mod learner;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod trainer;

pub use config::TrainingConfig;
pub use error::TrainingError;
pub use learner::PredictionOutput;
pub use loss::{
    BalancedDiceLoss, DiceLoss, LossKind, LossReport, SegmentationLoss, SegmentationLossConfig,
    UnsupportedLoss, WeightedCrossEntropyLoss,
};
pub use metrics::{EpochRecord, MetricsAccumulator, TrainingHistory, binary_accuracy};
pub use schedule::{Adjustment, EpochDecision, StopReason, TrainingSchedule};
pub use trainer::{Evaluation, FitResult, Trainer, evaluate};
