pub mod config;
pub mod detection;
pub mod error;
pub mod layers;

pub use config::Config;
pub use detection::detector::{MultiScaleDetector, TrainingOutput};
pub use detection::model::{load_weights_best_effort, DetectionModel, LoadReport};
pub use detection::target::{GroundTruth, GroundTruthBox};
pub use detection::{process_detections, Detection};
pub use error::{Error, Result};
