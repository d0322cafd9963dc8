use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for the classifier core.
///
/// `InvalidImage` is a per-request client error, `EmptyDataset` is fatal to a
/// training job, and `ModelNotFound`/`InferenceFailure` leave the service
/// running but not ready.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("no training images found; empty classes: {}", .empty_classes.join(", "))]
    EmptyDataset { empty_classes: Vec<String> },

    #[error("model artifact not found at {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("inference failure: {0}")]
    InferenceFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
