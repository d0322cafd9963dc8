use shared::{ClassLabel, HealthStatus, PredictionResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tch::{Device, Kind, Tensor, nn, nn::ModuleT};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ClassifierError, Result};
use crate::net::KidneyNet;
use crate::preprocess::Preprocessor;

struct LoadedModel {
    vs: nn::VarStore,
    net: KidneyNet,
}

/// Explicit service context for inference: owns the loaded model, the
/// preprocessor and the upload scratch space. Constructed once at startup and
/// handed to request handlers; no global mutable state.
///
/// The model slot sits behind one mutex, so a reload serializes against
/// in-flight forward passes and can never tear state visible to them.
#[derive(Clone)]
pub struct InferenceService {
    model: Arc<Mutex<Option<LoadedModel>>>,
    preprocessor: Preprocessor,
    upload_dir: PathBuf,
}

impl InferenceService {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            model: Arc::new(Mutex::new(None)),
            preprocessor: Preprocessor::new(config.image.size, config.uploads.max_bytes),
            upload_dir: config.uploads.dir.clone(),
        }
    }

    /// Loads (or hot-reloads) the artifact. A missing file is `ModelNotFound`
    /// and a corrupt one surfaces the load error; in both cases the service
    /// keeps serving with its previous state.
    pub fn load(&self, artifact_path: &Path) -> Result<()> {
        if !artifact_path.is_file() {
            return Err(ClassifierError::ModelNotFound(artifact_path.to_path_buf()));
        }

        let device = Device::cuda_if_available();
        let mut vs = nn::VarStore::new(device);
        let net = KidneyNet::new(&vs.root(), ClassLabel::COUNT as i64);
        vs.load(artifact_path)?;

        let mut slot = self.model.lock().unwrap();
        *slot = Some(LoadedModel { vs, net });
        log::info!("model loaded from {}", artifact_path.display());
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.model.lock().unwrap().is_some()
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            model_loaded: self.is_ready(),
        }
    }

    /// Classifies one uploaded image. The payload is staged to a temp file
    /// for the duration of the call and removed on every exit path,
    /// preprocessing failures included.
    pub fn infer_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        self.preprocessor.check_payload(bytes.len())?;
        let upload = TempUpload::stage(&self.upload_dir, bytes)?;
        let input = self.preprocessor.preprocess_path(upload.path())?;
        self.forward(&input)
    }

    fn forward(&self, input: &Tensor) -> Result<PredictionResult> {
        let guard = self.model.lock().unwrap();
        let model = guard
            .as_ref()
            .ok_or_else(|| ClassifierError::InferenceFailure("model not loaded".into()))?;

        let input = input.to(model.vs.device());
        let probs = tch::no_grad(|| {
            model
                .net
                .forward_t(&input, false)
                .softmax(-1, Kind::Float)
                .view([-1])
        });

        let count = probs.size()[0] as usize;
        let mut scores = vec![0f32; count];
        probs.copy_data(&mut scores, count);
        prediction_from_probs(&scores)
    }
}

/// Builds the response record from a softmax vector. Arg-max ties resolve to
/// the lowest class index.
pub fn prediction_from_probs(probs: &[f32]) -> Result<PredictionResult> {
    if probs.len() != ClassLabel::COUNT {
        return Err(ClassifierError::InferenceFailure(format!(
            "expected {} class scores, got {}",
            ClassLabel::COUNT,
            probs.len()
        )));
    }

    let mut best = 0usize;
    for (i, &p) in probs.iter().enumerate() {
        if p > probs[best] {
            best = i;
        }
    }

    let all_probabilities: BTreeMap<String, f32> = ClassLabel::ALL
        .iter()
        .zip(probs)
        .map(|(label, &p)| (label.to_string(), p))
        .collect();

    Ok(PredictionResult {
        prediction: ClassLabel::ALL[best].to_string(),
        confidence: probs[best],
        all_probabilities,
    })
}

/// Scoped temp storage for an uploaded payload; the file is removed when the
/// guard drops, so sustained failure load cannot leak disk.
struct TempUpload {
    path: PathBuf,
}

impl TempUpload {
    fn stage(dir: &Path, bytes: &[u8]) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.img", Uuid::new_v4()));
        std::fs::write(&path, bytes)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove temp upload {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(32, 32, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn test_config(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.uploads.dir = dir.join("uploads");
        config
    }

    #[test]
    fn distribution_sums_to_one_and_confidence_is_max() {
        let result = prediction_from_probs(&[0.1, 0.6, 0.2, 0.1]).unwrap();
        assert_eq!(result.prediction, "Cyst");
        assert!((result.confidence - 0.6).abs() < 1e-6);
        let sum: f32 = result.all_probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(result.all_probabilities.len(), 4);
    }

    #[test]
    fn argmax_tie_breaks_to_lowest_index() {
        let result = prediction_from_probs(&[0.3, 0.3, 0.3, 0.1]).unwrap();
        assert_eq!(result.prediction, "Normal");

        let result = prediction_from_probs(&[0.1, 0.3, 0.3, 0.3]).unwrap();
        assert_eq!(result.prediction, "Cyst");
    }

    #[test]
    fn wrong_score_count_is_an_inference_failure() {
        assert!(matches!(
            prediction_from_probs(&[0.5, 0.5]),
            Err(ClassifierError::InferenceFailure(_))
        ));
    }

    #[test]
    fn infer_before_load_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let service = InferenceService::new(&test_config(dir.path()));
        assert!(!service.is_ready());
        assert!(!service.health().model_loaded);

        match service.infer_bytes(&png_bytes([10, 20, 30])) {
            Err(ClassifierError::InferenceFailure(msg)) => {
                assert!(msg.contains("not loaded"));
            }
            other => panic!("expected InferenceFailure, got {other:?}"),
        }
    }

    #[test]
    fn load_missing_artifact_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = InferenceService::new(&test_config(dir.path()));
        let missing = dir.path().join("missing.safetensors");
        assert!(matches!(
            service.load(&missing),
            Err(ClassifierError::ModelNotFound(_))
        ));
        assert!(!service.is_ready());
    }

    #[test]
    fn load_corrupt_artifact_keeps_service_running() {
        let dir = tempfile::tempdir().unwrap();
        let service = InferenceService::new(&test_config(dir.path()));
        let corrupt = dir.path().join("corrupt.safetensors");
        std::fs::write(&corrupt, b"not a checkpoint").unwrap();
        assert!(service.load(&corrupt).is_err());
        assert!(!service.is_ready());
    }

    #[test]
    fn temp_uploads_are_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let service = InferenceService::new(&test_config(dir.path()));
        // undecodable payload: preprocessing fails after staging
        let _ = service.infer_bytes(&[0u8; 64]);
        let uploads = dir.path().join("uploads");
        let leftovers = std::fs::read_dir(&uploads).unwrap().count();
        assert_eq!(leftovers, 0);
    }
}
