use image::{Rgb, RgbImage, imageops};
use imageproc::geometric_transformations::{Interpolation, Projection, rotate_about_center, translate, warp};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::ClassLabel;
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};

use crate::error::{ClassifierError, Result};
use crate::preprocess::{Preprocessor, tensor_from_rgb};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Image paths collected from a directory of class-named subfolders.
#[derive(Debug)]
pub struct LabeledDataset {
    pub samples: Vec<(PathBuf, i64)>,
    pub class_counts: [usize; ClassLabel::COUNT],
}

impl LabeledDataset {
    /// Walks the four fixed class folders under `dir`. Fails fast with
    /// `EmptyDataset` when no class has any image; a class with an empty or
    /// missing folder is tolerated as long as at least one image exists
    /// somewhere.
    pub fn scan(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("dataset directory {} does not exist", dir.display()),
            )
            .into());
        }

        let mut samples = Vec::new();
        let mut class_counts = [0usize; ClassLabel::COUNT];

        for (class_idx, label) in ClassLabel::ALL.iter().enumerate() {
            let class_dir = dir.join(label.to_string());
            if !class_dir.is_dir() {
                log::warn!("{label}: class folder missing under {}", dir.display());
                continue;
            }

            let mut paths: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            paths.sort();

            log::info!("{label}: {} images", paths.len());
            class_counts[class_idx] = paths.len();
            samples.extend(paths.into_iter().map(|p| (p, class_idx as i64)));
        }

        if samples.is_empty() {
            let empty_classes = ClassLabel::ALL
                .iter()
                .enumerate()
                .filter(|&(i, _)| class_counts[i] == 0)
                .map(|(_, l)| l.to_string())
                .collect();
            return Err(ClassifierError::EmptyDataset { empty_classes });
        }

        Ok(Self { samples, class_counts })
    }

    pub fn total(&self) -> usize {
        self.samples.len()
    }

    /// Deterministic stratified split: per class, shuffle with the seed and
    /// take the tail fraction as validation. A class with a single image
    /// keeps it on the training side.
    pub fn split(self, validation_split: f64, seed: u64) -> (Vec<(PathBuf, i64)>, Vec<(PathBuf, i64)>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut train = Vec::new();
        let mut val = Vec::new();

        for class_idx in 0..ClassLabel::COUNT {
            let mut class_samples: Vec<(PathBuf, i64)> = self
                .samples
                .iter()
                .filter(|(_, l)| *l == class_idx as i64)
                .cloned()
                .collect();
            class_samples.shuffle(&mut rng);

            let n = class_samples.len();
            let n_val = ((n as f64) * validation_split).round() as usize;
            let n_val = n_val.min(n.saturating_sub(1));
            let split_at = n - n_val;
            val.extend(class_samples.split_off(split_at));
            train.extend(class_samples);
        }

        (train, val)
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Random geometric augmentation matching the reference training generator:
/// rotation, x/y shifts, shear, zoom (each up to 20%) and horizontal flips.
/// Applied to training images only, never to validation.
#[derive(Debug, Clone)]
pub struct Augmenter {
    pub max_rotation_deg: f32,
    pub max_shift: f32,
    pub max_shear: f32,
    pub max_zoom: f32,
    pub horizontal_flip: bool,
}

impl Default for Augmenter {
    fn default() -> Self {
        Self {
            max_rotation_deg: 20.0,
            max_shift: 0.2,
            max_shear: 0.2,
            max_zoom: 0.2,
            horizontal_flip: true,
        }
    }
}

impl Augmenter {
    pub fn apply(&self, img: &RgbImage, rng: &mut StdRng) -> RgbImage {
        let (width, height) = img.dimensions();
        let fill = Rgb([0u8, 0, 0]);

        let theta = rng
            .random_range(-self.max_rotation_deg..=self.max_rotation_deg)
            .to_radians();
        let mut out = rotate_about_center(img, theta, Interpolation::Bilinear, fill);

        let shear = rng.random_range(-self.max_shear..=self.max_shear);
        if let Some(shear_proj) =
            Projection::from_matrix([1.0, shear, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        {
            // shear about the image center, not the origin
            let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
            let projection =
                Projection::translate(cx, cy) * shear_proj * Projection::translate(-cx, -cy);
            out = warp(&out, &projection, Interpolation::Bilinear, fill);
        }

        let dx = (width as f32 * rng.random_range(-self.max_shift..=self.max_shift)) as i32;
        let dy = (height as f32 * rng.random_range(-self.max_shift..=self.max_shift)) as i32;
        out = translate(&out, (dx, dy));

        let zoom = rng.random_range(1.0 - self.max_zoom..=1.0 + self.max_zoom);
        if zoom < 1.0 {
            // zoom in: crop a centered region and resize back up
            let crop_w = ((width as f32) * zoom).max(1.0) as u32;
            let crop_h = ((height as f32) * zoom).max(1.0) as u32;
            let x0 = (width - crop_w) / 2;
            let y0 = (height - crop_h) / 2;
            let cropped = imageops::crop_imm(&out, x0, y0, crop_w, crop_h).to_image();
            out = imageops::resize(&cropped, width, height, imageops::FilterType::Triangle);
        } else if zoom > 1.0 {
            // zoom out: shrink and paste onto a filled canvas
            let new_w = ((width as f32) / zoom).max(1.0) as u32;
            let new_h = ((height as f32) / zoom).max(1.0) as u32;
            let shrunk = imageops::resize(&out, new_w, new_h, imageops::FilterType::Triangle);
            let mut canvas = RgbImage::from_pixel(width, height, fill);
            imageops::overlay(
                &mut canvas,
                &shrunk,
                ((width - new_w) / 2) as i64,
                ((height - new_h) / 2) as i64,
            );
            out = canvas;
        }

        if self.horizontal_flip && rng.random_bool(0.5) {
            out = imageops::flip_horizontal(&out);
        }

        out
    }
}

/// A split decoded into memory once, already resized through the
/// preprocessing convention.
pub struct PreparedSplit {
    images: Vec<RgbImage>,
    labels: Vec<i64>,
}

impl PreparedSplit {
    pub fn load(samples: &[(PathBuf, i64)], preprocessor: &Preprocessor) -> Result<Self> {
        let mut images = Vec::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for (path, label) in samples {
            match image::open(path) {
                Ok(img) => {
                    images.push(preprocessor.to_rgb_resized(&img));
                    labels.push(*label);
                }
                Err(e) => log::warn!("skipping {}: {e}", path.display()),
            }
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Stacks the selected samples into `[B, 3, H, W]` inputs and `[B]`
    /// labels. Augmentation, when given, is drawn fresh per sample.
    pub fn batch(
        &self,
        indices: &[usize],
        augment: Option<(&Augmenter, &mut StdRng)>,
        device: Device,
    ) -> (Tensor, Tensor) {
        let mut inputs = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());

        match augment {
            Some((augmenter, rng)) => {
                for &i in indices {
                    inputs.push(tensor_from_rgb(&augmenter.apply(&self.images[i], rng)));
                    labels.push(self.labels[i]);
                }
            }
            None => {
                for &i in indices {
                    inputs.push(tensor_from_rgb(&self.images[i]));
                    labels.push(self.labels[i]);
                }
            }
        }

        (
            Tensor::stack(&inputs, 0).to(device),
            Tensor::from_slice(&labels).to(device),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::io::Cursor;

    fn write_png(path: &Path, color: [u8; 3]) {
        let img = RgbImage::from_pixel(32, 32, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        std::fs::write(path, out.into_inner()).unwrap();
    }

    fn make_dataset(dir: &Path, per_class: &[usize; 4]) {
        for (label, &count) in ClassLabel::ALL.iter().zip(per_class) {
            let class_dir = dir.join(label.to_string());
            std::fs::create_dir_all(&class_dir).unwrap();
            for i in 0..count {
                write_png(&class_dir.join(format!("img_{i}.png")), [i as u8 * 10, 0, 0]);
            }
        }
    }

    #[test]
    fn scan_counts_per_class() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[3, 2, 1, 4]);
        let dataset = LabeledDataset::scan(dir.path()).unwrap();
        assert_eq!(dataset.class_counts, [3, 2, 1, 4]);
        assert_eq!(dataset.total(), 10);
    }

    #[test]
    fn all_empty_fails_fast_naming_classes() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[0, 0, 0, 0]);
        match LabeledDataset::scan(dir.path()) {
            Err(ClassifierError::EmptyDataset { empty_classes }) => {
                assert_eq!(empty_classes, vec!["Normal", "Cyst", "Stone", "Tumor"]);
            }
            other => panic!("expected EmptyDataset, got {other:?}"),
        }
    }

    #[test]
    fn one_empty_class_still_scans() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[2, 0, 2, 2]);
        let dataset = LabeledDataset::scan(dir.path()).unwrap();
        assert_eq!(dataset.total(), 6);
        assert_eq!(dataset.class_counts[ClassLabel::Cyst.index()], 0);
    }

    #[test]
    fn missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            LabeledDataset::scan(&missing),
            Err(ClassifierError::Io(_))
        ));
    }

    #[test]
    fn split_is_deterministic_and_stratified() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[10, 10, 10, 10]);

        let (train_a, val_a) = LabeledDataset::scan(dir.path()).unwrap().split(0.2, 42);
        let (train_b, val_b) = LabeledDataset::scan(dir.path()).unwrap().split(0.2, 42);
        assert_eq!(train_a, train_b);
        assert_eq!(val_a, val_b);
        assert_eq!(train_a.len(), 32);
        assert_eq!(val_a.len(), 8);
        // two validation samples per class
        for class_idx in 0..4 {
            let n = val_a.iter().filter(|(_, l)| *l == class_idx as i64).count();
            assert_eq!(n, 2);
        }
    }

    #[test]
    fn single_image_class_stays_in_training() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[1, 5, 5, 5]);
        let (train, val) = LabeledDataset::scan(dir.path()).unwrap().split(0.2, 42);
        assert!(train.iter().any(|(_, l)| *l == 0));
        assert!(!val.iter().any(|(_, l)| *l == 0));
    }

    #[test]
    fn zoom_samples_both_directions() {
        // only zoom active: a white image gains fill-colored borders whenever
        // a zoom-out is drawn
        let augmenter = Augmenter {
            max_rotation_deg: 0.0,
            max_shift: 0.0,
            max_shear: 0.0,
            max_zoom: 0.5,
            horizontal_flip: false,
        };
        let img = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let mut rng = StdRng::seed_from_u64(11);

        let mut saw_zoom_out = false;
        for _ in 0..20 {
            let out = augmenter.apply(&img, &mut rng);
            assert_eq!(out.dimensions(), (64, 64));
            if *out.get_pixel(0, 0) == Rgb([0, 0, 0]) {
                saw_zoom_out = true;
            }
        }
        assert!(saw_zoom_out, "zoom never produced a filled border");
    }

    #[test]
    fn shear_keeps_the_image_center_fixed() {
        let mut img = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        for y in 31..34 {
            for x in 31..34 {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        let augmenter = Augmenter {
            max_rotation_deg: 0.0,
            max_shift: 0.0,
            max_shear: 0.2,
            max_zoom: 0.0,
            horizontal_flip: false,
        };
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let out = augmenter.apply(&img, &mut rng);
            let center = out.get_pixel(32, 32);
            assert!(center.0[0] > 128, "center moved under shear: {center:?}");
        }
    }

    #[test]
    fn augmenter_preserves_dimensions() {
        let img = RgbImage::from_pixel(224, 224, Rgb([120, 60, 30]));
        let augmenter = Augmenter::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..5 {
            let out = augmenter.apply(&img, &mut rng);
            assert_eq!(out.dimensions(), (224, 224));
        }
    }

    #[test]
    fn batch_shapes() {
        let dir = tempfile::tempdir().unwrap();
        make_dataset(dir.path(), &[2, 2, 2, 2]);
        let dataset = LabeledDataset::scan(dir.path()).unwrap();
        let split = PreparedSplit::load(&dataset.samples, &Preprocessor::default()).unwrap();
        let (xs, ys) = split.batch(&[0, 1, 2], None, Device::Cpu);
        assert_eq!(xs.size(), vec![3, 3, 224, 224]);
        assert_eq!(ys.size(), vec![3]);
    }
}
