//! Trainer: owns the runtime, the graph and the optimiser.
//!
//! [`Trainer::once`] is the "run one step" primitive: forward (overriders
//! applied), cross-entropy, AdamW, epoch accounting and optional periodic
//! overrider updates. Everything else (evaluation, checkpoints, summaries,
//! the plain `train` loop) is built on top of it.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};

use squeeze_common::{
    batch_to_tensors, BlobDataset, Config, DatasetConfig, ModelConfig, SystemConfig, TrainConfig,
};
use squeeze_core::{compression_stats, Net, Overrider, OverriderInfo, Runtime};

use crate::change::Change;
use crate::checkpoint::{CheckpointStore, LATEST};
use crate::error::RetrainError;
use crate::interrupt::countdown;
use crate::session::{StepOutcome, TrainSession};
use crate::summary::SummaryWriter;

const SUMMARY_FILE: &str = "summary.csv";

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    runtime: Runtime,
    net: Net,
    optimizer: AdamW,
    train_set: BlobDataset,
    val_set: BlobDataset,
    config: TrainConfig,
    system: SystemConfig,
    checkpoints: CheckpointStore,
    summary: Option<SummaryWriter>,
    cursor: usize,
    examples_seen: usize,
    global_step: usize,
}

impl Trainer {
    /// Build dataset, graph and optimiser from the `train`, `dataset`,
    /// `model` and `system` sections.
    pub fn new(config: &Config, device: Device) -> anyhow::Result<Self> {
        let train_config = TrainConfig::from_config(config)?;
        let dataset_config = DatasetConfig::from_config(config)?;
        let model_config = ModelConfig::from_config(config)?;
        let system = SystemConfig::from_config(config)?;

        let (train_set, val_set) = BlobDataset::generate(&dataset_config);
        if train_set.is_empty() {
            anyhow::bail!("dataset.num_examples leaves no training examples");
        }

        let mut runtime = Runtime::new(device);
        let mut net = Net::new(&model_config, dataset_config.num_features);
        if net.output_size() != dataset_config.num_classes {
            anyhow::bail!(
                "model {} emits {} logits but the dataset has {} classes",
                model_config.name,
                net.output_size(),
                dataset_config.num_classes
            );
        }
        net.materialize(&mut runtime)?;

        let optimizer = AdamW::new(
            runtime.trainable_vars(),
            ParamsAdamW {
                lr: train_config.learning_rate,
                weight_decay: train_config.weight_decay,
                ..Default::default()
            },
        )?;

        let stats = compression_stats(net.overriders())?;
        tracing::info!(
            model = %model_config.name,
            params = runtime.num_trainable_elements(),
            overriders = net.overriders().len(),
            masked = stats.total,
            density = format!("{:.3}", stats.density()),
            "Model built"
        );

        let checkpoints = CheckpointStore::new(&system.checkpoint.directory);
        let summary = system
            .summary
            .save
            .then(|| SummaryWriter::new(system.checkpoint.directory.join(SUMMARY_FILE)));

        Ok(Self {
            runtime,
            net,
            optimizer,
            train_set,
            val_set,
            config: train_config,
            system,
            checkpoints,
            summary,
            cursor: 0,
            examples_seen: 0,
            global_step: 0,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Fractional epochs since the last reset.
    pub fn epoch(&self) -> f64 {
        self.examples_seen as f64 / self.train_set.len() as f64
    }

    /// Load `system.checkpoint.load`, if configured; returns the tag.
    pub fn restore_configured(&mut self) -> anyhow::Result<Option<String>> {
        let Some(tag) = self.system.checkpoint.load.clone() else {
            return Ok(None);
        };
        self.checkpoints.load(&self.runtime, &tag)?;
        tracing::info!(tag = %tag, "Restored checkpoint");
        Ok(Some(tag))
    }

    pub fn info(&self) -> Vec<OverriderInfo> {
        self.net.overriders().iter().map(|o| o.info()).collect()
    }

    /// Mean loss and accuracy over the validation split.
    pub fn evaluate(&mut self) -> anyhow::Result<(f64, f64)> {
        if self.val_set.is_empty() {
            anyhow::bail!("validation split is empty (dataset.validation_fraction)");
        }
        let mut loss_sum = 0.0f64;
        let mut acc_sum = 0.0f64;
        let mut count = 0usize;
        for (xs, ys) in self.val_set.batches(self.config.batch_size) {
            let n = ys.len();
            let (x, y) = batch_to_tensors(&xs, &ys, self.val_set.num_features(), self.runtime.device())?;
            let logits = self.net.forward(&mut self.runtime, &x)?;
            loss_sum += loss::cross_entropy(&logits, &y)?.to_scalar::<f32>()? as f64 * n as f64;
            acc_sum += accuracy(&logits, &y)? * n as f64;
            count += n;
        }
        Ok((loss_sum / count as f64, acc_sum / count as f64))
    }

    /// Evaluate every checkpoint in the store, in tag order. The runtime is
    /// left holding the last checkpoint evaluated.
    pub fn eval_all(&mut self) -> anyhow::Result<Vec<(String, f64, f64)>> {
        let tags = self.checkpoints.tags()?;
        let mut results = Vec::with_capacity(tags.len());
        for tag in tags {
            self.checkpoints.load(&self.runtime, &tag)?;
            let (loss, accuracy) = self.evaluate()?;
            tracing::info!(
                tag = %tag,
                loss = format!("{loss:.4}"),
                accuracy = format!("{accuracy:.4}"),
                "Evaluated checkpoint"
            );
            results.push((tag, loss, accuracy));
        }
        Ok(results)
    }

    /// Plain training until `train.max_epochs`, checkpointing every
    /// `system.checkpoint.save.interval` epochs. Returns `false` when stopped
    /// by an interrupt.
    pub fn train(&mut self, interrupt: &AtomicBool) -> anyhow::Result<bool> {
        let max_epochs = self.config.max_epochs;
        let steps_per_epoch = self.train_set.len() as f64 / self.config.batch_size as f64;
        let total_steps = (max_epochs * steps_per_epoch).ceil().max(1.0) as u64;
        let pb = ProgressBar::new(total_steps);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")?
                .progress_chars("=>-"),
        );

        let mut change = Change::new();
        let checkpoint_interval = self.system.checkpoint.interval();
        loop {
            if interrupt.load(Ordering::SeqCst) {
                pb.abandon_with_message("interrupted");
                tracing::info!(step = self.global_step, "Stopped");
                self.save_on_interrupt(interrupt)?;
                return Ok(false);
            }
            let outcome = self.once()?;
            if !outcome.loss.is_finite() {
                return Err(RetrainError::Diverged { loss: outcome.loss }.into());
            }
            pb.inc(1);
            pb.set_message(format!(
                "epoch {:.2} loss {:.4} acc {:.3}",
                outcome.epoch, outcome.loss, outcome.accuracy
            ));

            if self.summary.is_some()
                && change.every("summary.epoch", outcome.epoch, self.system.summary.interval)
            {
                self.save_summary(&outcome)?;
            }
            let floor_epoch = outcome.epoch.floor();
            if change.every("checkpoint.epoch", floor_epoch, checkpoint_interval) {
                self.save_checkpoint(&format!("epoch-{}", floor_epoch as u64))?;
            }
            if outcome.epoch >= max_epochs {
                break;
            }
        }
        pb.finish_with_message("done");

        let (val_loss, val_acc) = self.evaluate()?;
        tracing::info!(
            step = self.global_step,
            val_loss = format!("{val_loss:.4}"),
            val_acc = format!("{val_acc:.4}"),
            "Training complete"
        );
        self.save_checkpoint(LATEST)?;
        Ok(true)
    }

    /// Save `latest` after the configured countdown, if saving is enabled.
    pub fn save_on_interrupt(&mut self, interrupt: &AtomicBool) -> anyhow::Result<()> {
        let Some(save) = self.system.checkpoint.save.as_ref() else {
            return Ok(());
        };
        if countdown(save.countdown, interrupt) {
            self.save_checkpoint(LATEST)?;
        }
        Ok(())
    }
}

// ── TrainSession ────────────────────────────────────────────────────────────

impl TrainSession for Trainer {
    fn once(&mut self) -> anyhow::Result<StepOutcome> {
        let batch_size = self.config.batch_size;
        let (xs, ys) = self.train_set.batch(self.cursor, batch_size);
        self.cursor = (self.cursor + batch_size) % self.train_set.len();

        let (x, y) = batch_to_tensors(&xs, &ys, self.train_set.num_features(), self.runtime.device())?;
        let logits = self.net.forward(&mut self.runtime, &x)?;
        let step_loss = loss::cross_entropy(&logits, &y)?;
        let loss_val = step_loss.to_scalar::<f32>()? as f64;
        let acc = accuracy(&logits, &y)?;

        if loss_val.is_finite() {
            self.optimizer.backward_step(&step_loss)?;
        } else {
            tracing::warn!(step = self.global_step, "non-finite loss, optimiser step skipped");
        }

        self.global_step += 1;
        self.examples_seen += ys.len();

        let every = self.config.update_overriders_every;
        if every > 0 && self.global_step % every == 0 {
            self.overriders_update()?;
        }

        Ok(StepOutcome {
            loss: loss_val,
            accuracy: acc,
            epoch: self.epoch(),
        })
    }

    fn reset_num_epochs(&mut self) {
        self.examples_seen = 0;
    }

    fn overriders(&self) -> &[Box<dyn Overrider>] {
        self.net.overriders()
    }

    fn overriders_with_runtime(&mut self) -> (&Runtime, &mut [Box<dyn Overrider>]) {
        (&self.runtime, self.net.overriders_mut())
    }

    fn save_checkpoint(&mut self, tag: &str) -> anyhow::Result<()> {
        let path = self.checkpoints.save(&self.runtime, tag)?;
        tracing::info!(tag, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    fn load_checkpoint(&mut self, tag: &str) -> anyhow::Result<()> {
        self.checkpoints.load(&self.runtime, tag)
    }

    fn checkpoint_exists(&self, tag: &str) -> bool {
        self.checkpoints.exists(tag)
    }

    fn save_summary(&mut self, outcome: &StepOutcome) -> anyhow::Result<()> {
        if let Some(writer) = &self.summary {
            writer
                .append(outcome.epoch, outcome.loss, outcome.accuracy)
                .context("writing training summary")?;
        }
        Ok(())
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Fraction of rows whose arg-max logit matches the label.
fn accuracy(logits: &Tensor, labels: &Tensor) -> candle_core::Result<f64> {
    let predictions = logits.argmax(1)?;
    let correct = predictions
        .eq(labels)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    Ok(correct as f64)
}

// ── Tests ───────────────────────────────────────────────────────────────────
