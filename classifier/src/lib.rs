pub mod config;
pub mod dataset;
pub mod error;
pub mod net;
pub mod preprocess;
pub mod service;
pub mod trainer;

pub use config::AppConfig;
pub use error::{ClassifierError, Result};
pub use service::InferenceService;
pub use trainer::{TrainOptions, Trainer, TrainingReport};
