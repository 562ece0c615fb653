mod blocks;
#[cfg(feature = "cnn3d")]
mod cnn3d;
#[cfg(feature = "unet")]
mod unet;

pub use blocks::{
    Activation, Conv3dBlock, Conv3dBlockConfig, ConvBlock, ConvBlockConfig, EncoderBlock,
    EncoderBlockConfig, UpBlock, UpBlockConfig, elu,
};

#[cfg(feature = "cnn3d")]
pub use cnn3d::{Cnn3d, Cnn3dConfig};
#[cfg(feature = "unet")]
pub use unet::{UNet2p5d, UNet2p5dConfig};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("input shape {shape:?} must be divisible by {divisor} in every spatial dimension")]
    InputSize { shape: Vec<usize>, divisor: usize },

    #[error("kernel size must be odd for same padding, got {0}")]
    EvenKernel(usize),

    #[error("dropout must be in [0, 1), got {0}")]
    InvalidDropout(f64),

    #[error("`{0}` must be > 0")]
    Zero(&'static str),
}

fn check_positive(values: &[(&'static str, usize)]) -> Result<(), ModelError> {
    match values.iter().find(|(_, value)| *value == 0) {
        Some((name, _)) => Err(ModelError::Zero(name)),
        None => Ok(()),
    }
}

fn check_layer_params(kernel_size: usize, dropout: f64) -> Result<(), ModelError> {
    if kernel_size % 2 == 0 {
        return Err(ModelError::EvenKernel(kernel_size));
    }
    if !(0.0..1.0).contains(&dropout) {
        return Err(ModelError::InvalidDropout(dropout));
    }
    Ok(())
}

fn check_divisible(shape: &[usize], levels: usize) -> Result<(), ModelError> {
    let divisor = 1 << levels;
    if shape.iter().any(|size| *size == 0 || size % divisor != 0) {
        return Err(ModelError::InputSize {
            shape: shape.to_vec(),
            divisor,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisibility_by_power_of_two() {
        assert!(check_divisible(&[64, 32], 3).is_ok());
        assert_eq!(
            check_divisible(&[64, 36], 3),
            Err(ModelError::InputSize {
                shape: vec![64, 36],
                divisor: 8
            })
        );
        assert!(check_divisible(&[0, 8], 1).is_err());
    }

    #[test]
    fn layer_params() {
        assert!(check_layer_params(3, 0.25).is_ok());
        assert_eq!(check_layer_params(4, 0.0), Err(ModelError::EvenKernel(4)));
        assert_eq!(
            check_layer_params(3, 1.0),
            Err(ModelError::InvalidDropout(1.0))
        );
        assert_eq!(
            check_positive(&[("a", 1), ("n_filters", 0)]),
            Err(ModelError::Zero("n_filters"))
        );
    }
}
