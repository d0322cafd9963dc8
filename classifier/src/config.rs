use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// Top-level configuration for the classifier core.
///
/// Loaded from YAML; every section has defaults matching the reference
/// training job, so a partial (or absent) file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub uploads: UploadConfig,
    pub image: ImageConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Where the trained artifact is written by the trainer and read by the
    /// inference service.
    pub artifact_path: PathBuf,
    /// Optional safetensors checkpoint holding pretrained feature-extractor
    /// weights under the `base.*` namespace.
    pub pretrained_base: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub dir: PathBuf,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: i64,
    pub batch_size: usize,
    pub fine_tune_epochs: i64,
    pub fine_tune_batch_size: usize,
    pub validation_split: f64,
    pub seed: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            uploads: UploadConfig::default(),
            image: ImageConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("models/kidney_classifier.safetensors"),
            pretrained_base: None,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self { size: 224 }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 30,
            batch_size: 32,
            fine_tune_epochs: 15,
            fine_tune_batch_size: 16,
            validation_split: 0.2,
            seed: 42,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&config_str)
            .map_err(|e| ClassifierError::Config(format!("{}: {e}", path.display())))
    }
}
