use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported activation `{0}`, expected one of: mish, relu, leaky, linear")]
    InvalidActivation(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("feature map for scale {scale} has shape {shape:?}, expected {expected}")]
    FeatureMapShape {
        scale: usize,
        shape: Vec<usize>,
        expected: String,
    },
    #[error("ground truth row {row}: {reason}")]
    InvalidGroundTruth { row: usize, reason: String },
}

impl Error {
    pub fn ground_truth(row: usize, reason: impl Into<String>) -> Self {
        Error::InvalidGroundTruth {
            row,
            reason: reason.into(),
        }
    }
}
