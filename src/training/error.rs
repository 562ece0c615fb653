use burn::tensor::DataError;
use thiserror::Error;

use crate::dataset::DatasetError;
use crate::evaluation::RocError;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("invalid training configuration: {0}")]
    InvalidConfig(String),

    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("ROC computation failed: {0}")]
    Roc(#[from] RocError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("failed to read tensor data: {0:?}")]
    TensorData(DataError),

    #[error("no valid training batch in epoch {0}")]
    EmptyEpoch(usize),

    #[error("I/O error: `{0}`")]
    Io(#[from] std::io::Error),
}

impl From<DataError> for TrainingError {
    fn from(err: DataError) -> Self {
        Self::TensorData(err)
    }
}

impl TrainingError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_message() {
        let err = TrainingError::invalid_config("batch size must be > 0");
        assert!(err.to_string().contains("invalid training configuration"));
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn from_io_error() {
        let err: TrainingError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TrainingError::Io(_)));
    }

    #[test]
    fn from_data_error() {
        let err: TrainingError = DataError::TypeMismatch("expected f32".to_string()).into();
        assert!(matches!(
            err,
            TrainingError::TensorData(DataError::TypeMismatch(_))
        ));
        assert!(err.to_string().contains("expected f32"));
    }
}
