pub mod evaluation;
pub mod imaging;

#[cfg(feature = "models")]
pub mod model;

#[cfg(feature = "dataset")]
pub mod dataset;

#[cfg(feature = "training")]
pub mod training;

#[cfg(feature = "cnn3d")]
pub use model::{Cnn3d, Cnn3dConfig};
#[cfg(feature = "unet")]
pub use model::{UNet2p5d, UNet2p5dConfig};

#[cfg(feature = "dataset")]
pub use dataset::{DatasetError, PatientMetadata, VolumeArchive};

#[cfg(feature = "training")]
pub use training::{LossKind, SegmentationLossConfig, Trainer, TrainingConfig, TrainingError};

pub use evaluation::{RocCurve, calc_auc, roc_curve};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
