use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use shared::ClassLabel;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, nn, nn::ModuleT, nn::OptimizerConfig};

use crate::config::AppConfig;
use crate::dataset::{Augmenter, LabeledDataset, PreparedSplit};
use crate::error::{ClassifierError, Result};
use crate::net::{KidneyNet, freeze_base, load_pretrained_base, unfreeze_top_of_base};
use crate::preprocess::Preprocessor;

/// Knobs for a training run. `from_config` mirrors the reference job's
/// hyperparameters; tests override the fields directly.
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: i64,
    pub batch_size: usize,
    pub fine_tune_epochs: i64,
    pub fine_tune_batch_size: usize,
    pub artifact_path: PathBuf,
    pub pretrained_base: Option<PathBuf>,
    pub validation_split: f64,
    pub seed: u64,
}

impl TrainOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            batch_size: config.training.batch_size,
            fine_tune_epochs: config.training.fine_tune_epochs,
            fine_tune_batch_size: config.training.fine_tune_batch_size,
            artifact_path: config.model.artifact_path.clone(),
            pretrained_base: config.model.pretrained_base.clone(),
            validation_split: config.training.validation_split,
            seed: config.training.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    FineTune,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Head => "head",
            Phase::FineTune => "fine-tune",
        }
    }
}

/// Per-phase schedule: optimizer learning rate, early-stopping patience and
/// the optional reduce-on-plateau step.
struct PhaseSchedule {
    phase: Phase,
    epochs: i64,
    batch_size: usize,
    learning_rate: f64,
    stop_patience: i64,
    plateau: Option<PlateauSchedule>,
}

struct PlateauSchedule {
    factor: f64,
    patience: i64,
    min_lr: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochStats {
    pub phase: String,
    pub epoch: i64,
    pub train_loss: f64,
    pub train_acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub lr: f64,
}

/// Serialized next to the artifact; the data behind the reference job's
/// accuracy/loss plot.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub class_counts: BTreeMap<String, usize>,
    pub epochs: Vec<EpochStats>,
    pub best_val_accuracy: f64,
    pub artifact: PathBuf,
}

/// Keeps the best-so-far validation accuracy; a checkpoint is written only on
/// a strict improvement, so an equal score never replaces an earlier one.
struct BestCheckpoint {
    best_accuracy: Option<f64>,
}

impl BestCheckpoint {
    fn new() -> Self {
        Self { best_accuracy: None }
    }

    fn improved(&mut self, accuracy: f64) -> bool {
        match self.best_accuracy {
            Some(best) if accuracy <= best => false,
            _ => {
                self.best_accuracy = Some(accuracy);
                true
            }
        }
    }
}

pub struct Trainer {
    options: TrainOptions,
}

impl Trainer {
    pub fn new(options: TrainOptions) -> Self {
        Self { options }
    }

    /// Runs the head-only phase and, when configured, the fine-tune phase.
    /// Fails before any optimization step if the dataset is missing or empty.
    pub fn train(&self, dataset_dir: &Path) -> Result<TrainingReport> {
        let started_at = Utc::now();
        let opts = &self.options;
        if opts.batch_size == 0 || (opts.fine_tune_epochs > 0 && opts.fine_tune_batch_size == 0) {
            return Err(ClassifierError::Config("batch size must be positive".into()));
        }
        tch::manual_seed(opts.seed as i64);

        let dataset = LabeledDataset::scan(dataset_dir)?;
        let class_counts: BTreeMap<String, usize> = ClassLabel::ALL
            .iter()
            .zip(dataset.class_counts)
            .map(|(l, n)| (l.to_string(), n))
            .collect();
        log::info!(
            "dataset: {} images across {} classes",
            dataset.total(),
            ClassLabel::COUNT
        );

        let (train_samples, val_samples) = dataset.split(opts.validation_split, opts.seed);
        let preprocessor = Preprocessor::default();
        let train_data = PreparedSplit::load(&train_samples, &preprocessor)?;
        let val_data = PreparedSplit::load(&val_samples, &preprocessor)?;
        if train_data.is_empty() {
            return Err(ClassifierError::InvalidImage(
                "no image in the training split could be decoded".into(),
            ));
        }
        if val_data.is_empty() {
            log::warn!("validation split is empty; validating against the training split");
        }
        log::info!("split: {} train / {} validation", train_data.len(), val_data.len());

        let device = Device::cuda_if_available();
        let mut vs = nn::VarStore::new(device);
        let net = KidneyNet::new(&vs.root(), ClassLabel::COUNT as i64);

        let mut base_frozen = false;
        match &opts.pretrained_base {
            Some(path) if path.is_file() => {
                let copied = load_pretrained_base(&mut vs, path)?;
                let frozen = freeze_base(&vs);
                base_frozen = true;
                log::info!(
                    "loaded {copied} pretrained base tensors from {}; froze {frozen} variables",
                    path.display()
                );
            }
            Some(path) => {
                log::warn!(
                    "pretrained checkpoint {} not found; training the full network from scratch",
                    path.display()
                );
            }
            None => log::info!("no pretrained base configured; training from scratch"),
        }

        let mut history = Vec::new();
        let mut best = BestCheckpoint::new();

        let head_schedule = PhaseSchedule {
            phase: Phase::Head,
            epochs: opts.epochs,
            batch_size: opts.batch_size,
            learning_rate: 1e-3,
            stop_patience: 10,
            plateau: Some(PlateauSchedule { factor: 0.2, patience: 5, min_lr: 1e-7 }),
        };
        self.run_phase(&head_schedule, &vs, &net, &train_data, &val_data, &mut best, &mut history)?;
        // each phase ends on its best-seen weights, not its final-epoch ones,
        // so an early-stopped head phase hands the checkpointed weights on
        if restore_best_weights(&mut vs, &opts.artifact_path)? {
            log::info!("restored best head-phase weights");
        }

        if opts.fine_tune_epochs > 0 {
            if base_frozen {
                let unfrozen = unfreeze_top_of_base(&vs);
                log::info!("fine-tune: unfroze {unfrozen} variables at the top of the extractor");
            }
            let fine_tune_schedule = PhaseSchedule {
                phase: Phase::FineTune,
                epochs: opts.fine_tune_epochs,
                batch_size: opts.fine_tune_batch_size,
                learning_rate: 1e-5,
                stop_patience: 5,
                plateau: None,
            };
            self.run_phase(&fine_tune_schedule, &vs, &net, &train_data, &val_data, &mut best, &mut history)?;
            if restore_best_weights(&mut vs, &opts.artifact_path)? {
                log::info!("restored best fine-tune weights");
            }
        }

        let report = TrainingReport {
            started_at,
            finished_at: Utc::now(),
            class_counts,
            epochs: history,
            best_val_accuracy: best.best_accuracy.unwrap_or(0.0),
            artifact: opts.artifact_path.clone(),
        };
        self.write_report(&report)?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_phase(
        &self,
        schedule: &PhaseSchedule,
        vs: &nn::VarStore,
        net: &KidneyNet,
        train_data: &PreparedSplit,
        val_data: &PreparedSplit,
        best: &mut BestCheckpoint,
        history: &mut Vec<EpochStats>,
    ) -> Result<()> {
        // a fresh optimizer per phase picks up the current trainable set
        let mut optimizer = nn::Adam::default().build(vs, schedule.learning_rate)?;
        let mut learning_rate = schedule.learning_rate;
        let device = vs.device();

        let augmenter = Augmenter::default();
        let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(schedule.phase as u64));

        let mut best_val_loss = f64::INFINITY;
        let mut stop_wait = 0i64;
        let mut plateau_wait = 0i64;

        log::info!(
            "phase {}: up to {} epochs, batch size {}, lr {:.0e}",
            schedule.phase.name(),
            schedule.epochs,
            schedule.batch_size,
            learning_rate
        );

        for epoch in 1..=schedule.epochs {
            let mut indices: Vec<usize> = (0..train_data.len()).collect();
            indices.shuffle(&mut rng);

            let mut loss_sum = 0.0;
            let mut correct = 0i64;
            let mut seen = 0i64;
            let mut batches = 0i64;

            for chunk in indices.chunks(schedule.batch_size) {
                let (inputs, targets) = train_data.batch(chunk, Some((&augmenter, &mut rng)), device);
                let logits = net.forward_t(&inputs, true);
                let loss = logits.cross_entropy_for_logits(&targets);
                optimizer.backward_step(&loss);

                loss_sum += loss.double_value(&[]);
                batches += 1;
                let predicted = logits.argmax(-1, false);
                correct += predicted.eq_tensor(&targets).sum(Kind::Int64).int64_value(&[]);
                seen += targets.size()[0];
            }

            let train_loss = if batches > 0 { loss_sum / batches as f64 } else { 0.0 };
            let train_accuracy = if seen > 0 { correct as f64 / seen as f64 } else { 0.0 };

            let eval_data = if val_data.is_empty() { train_data } else { val_data };
            let (val_loss, val_accuracy) =
                evaluate(net, eval_data, schedule.batch_size, device);

            log::info!(
                "[{}] epoch {epoch}/{}: loss {train_loss:.4} acc {:.2}% | val_loss {val_loss:.4} val_acc {:.2}%",
                schedule.phase.name(),
                schedule.epochs,
                train_accuracy * 100.0,
                val_accuracy * 100.0
            );

            history.push(EpochStats {
                phase: schedule.phase.name().to_string(),
                epoch,
                train_loss,
                train_acc: train_accuracy,
                val_loss,
                val_acc: val_accuracy,
                lr: learning_rate,
            });

            if best.improved(val_accuracy) {
                save_checkpoint(vs, &self.options.artifact_path)?;
                log::info!(
                    "checkpointed best model (val_acc {:.2}%) to {}",
                    val_accuracy * 100.0,
                    self.options.artifact_path.display()
                );
            }

            if val_loss < best_val_loss {
                best_val_loss = val_loss;
                stop_wait = 0;
                plateau_wait = 0;
            } else {
                stop_wait += 1;
                plateau_wait += 1;
            }

            if let Some(plateau) = &schedule.plateau {
                if plateau_wait >= plateau.patience && learning_rate > plateau.min_lr {
                    learning_rate = (learning_rate * plateau.factor).max(plateau.min_lr);
                    optimizer.set_lr(learning_rate);
                    plateau_wait = 0;
                    log::info!("val_loss plateaued; reducing learning rate to {learning_rate:.2e}");
                }
            }

            if stop_wait >= schedule.stop_patience {
                log::info!(
                    "early stopping after {epoch} epochs (no val_loss improvement in {} epochs)",
                    schedule.stop_patience
                );
                break;
            }
        }

        Ok(())
    }

    fn write_report(&self, report: &TrainingReport) -> Result<()> {
        let path = report_path(&self.options.artifact_path);
        let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
        std::fs::write(&path, json)?;
        log::info!("training report written to {}", path.display());
        Ok(())
    }
}

pub fn report_path(artifact_path: &Path) -> PathBuf {
    artifact_path.with_extension("report.json")
}

/// Reloads the checkpointed best weights into the var store. Returns false
/// when no checkpoint has been written yet.
fn restore_best_weights(vs: &mut nn::VarStore, artifact_path: &Path) -> Result<bool> {
    if !artifact_path.is_file() {
        return Ok(false);
    }
    vs.load(artifact_path)?;
    Ok(true)
}

/// Validation loss/accuracy over a split, dropout and batch-norm in eval mode.
fn evaluate(
    net: &KidneyNet,
    data: &PreparedSplit,
    batch_size: usize,
    device: Device,
) -> (f64, f64) {
    tch::no_grad(|| {
        let indices: Vec<usize> = (0..data.len()).collect();
        let mut loss_sum = 0.0;
        let mut batches = 0i64;
        let mut correct = 0i64;
        let mut seen = 0i64;

        for chunk in indices.chunks(batch_size) {
            let (inputs, targets) = data.batch(chunk, None, device);
            let logits = net.forward_t(&inputs, false);
            loss_sum += logits.cross_entropy_for_logits(&targets).double_value(&[]);
            batches += 1;
            let predicted = logits.argmax(-1, false);
            correct += predicted.eq_tensor(&targets).sum(Kind::Int64).int64_value(&[]);
            seen += targets.size()[0];
        }

        let loss = if batches > 0 { loss_sum / batches as f64 } else { 0.0 };
        let accuracy = if seen > 0 { correct as f64 / seen as f64 } else { 0.0 };
        (loss, accuracy)
    })
}

/// Writes the artifact via a staging file and an atomic rename, so a reader
/// never observes a half-written checkpoint. One retry for transient IO
/// failures.
fn save_checkpoint(vs: &nn::VarStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    match write_artifact(vs, path) {
        Ok(()) => Ok(()),
        Err(first) => {
            log::warn!("checkpoint write failed ({first}); retrying once");
            write_artifact(vs, path)
        }
    }
}

fn write_artifact(vs: &nn::VarStore, path: &Path) -> Result<()> {
    let staging = staging_path(path);
    vs.save(&staging)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

// keeps the .safetensors extension so the format is chosen correctly
fn staging_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    path.with_file_name(format!("{stem}.staging.safetensors"))
}
