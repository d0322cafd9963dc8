use image::{DynamicImage, RgbImage, imageops::FilterType};
use std::path::Path;
use tch::{Kind, Tensor};

use crate::error::{ClassifierError, Result};

pub const IMAGE_SIZE: u32 = 224;
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

/// Turns a raw image into the normalized tensor the model expects.
///
/// The pipeline is the same for training and serving: decode, convert to RGB,
/// bilinear resize to a fixed square, scale pixels into [-1, 1] (the
/// MobileNetV2 convention), layout NCHW. A mismatch between the two sides
/// would silently degrade accuracy, so both go through this type.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    size: u32,
    max_bytes: usize,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(IMAGE_SIZE, MAX_IMAGE_BYTES)
    }
}

impl Preprocessor {
    pub fn new(size: u32, max_bytes: usize) -> Self {
        Self { size, max_bytes }
    }

    /// Rejects payloads that are empty or above the configured byte limit.
    /// A payload exactly at the limit is accepted.
    pub fn check_payload(&self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(ClassifierError::InvalidImage("empty image payload".into()));
        }
        if len > self.max_bytes {
            return Err(ClassifierError::InvalidImage(format!(
                "image is {len} bytes, limit is {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }

    pub fn preprocess_bytes(&self, bytes: &[u8]) -> Result<Tensor> {
        self.check_payload(bytes.len())?;
        let img = image::load_from_memory(bytes)
            .map_err(|e| ClassifierError::InvalidImage(format!("decode failed: {e}")))?;
        Ok(self.to_tensor(&img))
    }

    pub fn preprocess_path(&self, path: &Path) -> Result<Tensor> {
        let len = std::fs::metadata(path)?.len() as usize;
        self.check_payload(len)?;
        let img = image::open(path).map_err(|e| {
            ClassifierError::InvalidImage(format!("decode failed for {}: {e}", path.display()))
        })?;
        Ok(self.to_tensor(&img))
    }

    /// Fixed-size RGB view of a decoded image, bilinear resampling.
    pub fn to_rgb_resized(&self, img: &DynamicImage) -> RgbImage {
        img.resize_exact(self.size, self.size, FilterType::Triangle)
            .to_rgb8()
    }

    /// Normalized `[1, 3, size, size]` tensor for a single image.
    pub fn to_tensor(&self, img: &DynamicImage) -> Tensor {
        tensor_from_rgb(&self.to_rgb_resized(img)).unsqueeze(0)
    }
}

/// HWC u8 image -> CHW f32 tensor with pixels scaled into [-1, 1].
pub(crate) fn tensor_from_rgb(rgb: &RgbImage) -> Tensor {
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_slice(rgb.as_raw())
        .reshape(&[height as i64, width as i64, 3])
        .permute(&[2, 0, 1])
        .to_kind(Kind::Float);
    tensor / 127.5 - 1.0
}
