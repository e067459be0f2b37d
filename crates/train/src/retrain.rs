//! Greedy per-layer threshold search.
//!
//! The retrainer drives a [`TrainSession`] step by step and tightens one
//! tunable overrider (the *target layer*) at a time:
//!
//! ```text
//! init: setup → save "pretrained" → rank layers → profile baselines → tighten target
//!
//! every checkpoint boundary:
//!   acc_avg ≥ acc_base          → save "th-{cnt}-{epoch}", re-rank, tighten again
//!   epoch ≥ iter_max_epoch      → nothing left? stop
//!                                 else roll back the step (halve it, or retire
//!                                 the layer once the step is below min_scale),
//!                                 reload the best checkpoint, re-rank, tighten
//!                                 and train for another budget
//!   otherwise                   → keep training
//! ```
//!
//! Layers are ranked ascending by how many elements their mask already
//! zeroes; the most-pruned eligible layer is searched next. Bias overriders
//! are never searched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use squeeze_common::{Config, ConfigError, RetrainConfig, SystemConfig};
use squeeze_core::{count_zeros, Overrider, Tunable};

use crate::change::Change;
use crate::checkpoint::{LATEST, PRETRAINED};
use crate::error::RetrainError;
use crate::interrupt::countdown;
use crate::session::{StepOutcome, TrainSession};

/// File the search log is written to, next to the checkpoints.
pub const LOG_FILE: &str = "retrain_log.json";

// ── Config ──────────────────────────────────────────────────────────────────

/// Everything the retrainer reads from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrainerConfig {
    pub retrain: RetrainConfig,
    /// Epochs between checkpoint boundaries.
    pub checkpoint_interval: f64,
    /// Grace period before saving on interrupt; `None` disables the save.
    pub countdown: Option<f64>,
    /// Epochs between summary rows; `None` disables summaries.
    pub summary_interval: Option<f64>,
    /// Directory for the final search log.
    pub log_dir: Option<PathBuf>,
}

impl RetrainerConfig {
    /// Keys the retrain action needs besides `retrain.*`.
    pub const REQUIRED_KEYS: [&'static str; 1] = ["system.checkpoint.save.interval"];

    /// Validate every required key up front, then read the sections.
    pub fn from_config(config: &Config) -> squeeze_common::error::Result<Self> {
        let keys: Vec<&str> = RetrainConfig::REQUIRED_KEYS
            .iter()
            .chain(Self::REQUIRED_KEYS.iter())
            .copied()
            .collect();
        config.validate(&keys, "retrain")?;
        let retrain = RetrainConfig::from_config(config)?;
        let system = SystemConfig::from_config(config)?;
        if !(system.checkpoint.interval() > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: Self::REQUIRED_KEYS[0].to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(Self {
            retrain,
            checkpoint_interval: system.checkpoint.interval(),
            countdown: system.checkpoint.save.as_ref().map(|s| s.countdown),
            summary_interval: system.summary.save.then_some(system.summary.interval),
            log_dir: Some(system.checkpoint.directory),
        })
    }
}

// ── Bookkeeping ─────────────────────────────────────────────────────────────

/// Loss/accuracy accumulated over one measurement window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningStats {
    step: usize,
    loss_total: f64,
    acc_total: f64,
}

impl RunningStats {
    fn update(&mut self, loss: f64, accuracy: f64) {
        self.step += 1;
        self.loss_total += loss;
        self.acc_total += accuracy;
    }

    fn mean(&self) -> (f64, f64) {
        let n = self.step.max(1) as f64;
        (self.loss_total / n, self.acc_total / n)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Best accepted threshold of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdRecord {
    pub threshold: f64,
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Serialize)]
struct SearchReport<'a> {
    best_checkpoint: Option<&'a str>,
    retrain_count: usize,
    loss_base: f64,
    acc_base: f64,
    layers: &'a BTreeMap<String, ThresholdRecord>,
    final_state: Vec<FinalLayer>,
}

#[derive(Debug, Serialize)]
struct FinalLayer {
    name: String,
    threshold: f64,
    scale: f64,
    searching: bool,
}

/// How [`Retrainer::retrain`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetrainOutcome {
    /// Every layer was exhausted; the model is stored under `best_checkpoint`.
    Finished { best_checkpoint: String },
    /// Stopped by an interrupt.
    Interrupted,
}

// ── Retrainer ───────────────────────────────────────────────────────────────

pub struct Retrainer<S: TrainSession> {
    session: S,
    config: RetrainerConfig,
    interrupt: Arc<AtomicBool>,
    change: Change,
    stats: RunningStats,
    loss_avg: Option<f64>,
    acc_avg: Option<f64>,
    loss_base: f64,
    acc_base: f64,
    target_layer: Option<String>,
    priority_list: Vec<String>,
    cont: BTreeMap<String, bool>,
    retrain_cnt: usize,
    best_ckpt: Option<String>,
    log: BTreeMap<String, ThresholdRecord>,
    cp_epoch: f64,
    progress: ProgressBar,
}

impl<S: TrainSession> Retrainer<S> {
    pub fn new(session: S, config: RetrainerConfig) -> Self {
        Self {
            session,
            config,
            interrupt: Arc::new(AtomicBool::new(false)),
            change: Change::new(),
            stats: RunningStats::default(),
            loss_avg: None,
            acc_avg: None,
            loss_base: 0.0,
            acc_base: 0.0,
            target_layer: None,
            priority_list: Vec::new(),
            cont: BTreeMap::new(),
            retrain_cnt: 0,
            best_ckpt: None,
            log: BTreeMap::new(),
            cp_epoch: 0.0,
            progress: ProgressBar::hidden(),
        }
    }

    /// Share an interrupt flag (set from a Ctrl-C handler).
    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Render progress on stderr.
    pub fn with_progress(mut self) -> anyhow::Result<Self> {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("[{elapsed_precise}] {spinner} {msg}")?);
        self.progress = pb;
        Ok(self)
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    pub fn target_layer(&self) -> Option<&str> {
        self.target_layer.as_deref()
    }

    pub fn priority_list(&self) -> &[String] {
        &self.priority_list
    }

    /// Whether the search still continues for `layer`.
    pub fn cont(&self, layer: &str) -> Option<bool> {
        self.cont.get(layer).copied()
    }

    pub fn retrain_cnt(&self) -> usize {
        self.retrain_cnt
    }

    pub fn best_ckpt(&self) -> Option<&str> {
        self.best_ckpt.as_deref()
    }

    /// `(loss_base, acc_base)` established by profiling.
    pub fn baselines(&self) -> (f64, f64) {
        (self.loss_base, self.acc_base)
    }

    pub fn log(&self) -> &BTreeMap<String, ThresholdRecord> {
        &self.log
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    // ── Entry point ─────────────────────────────────────────────────────────

    /// Run the whole search. Blocks until every layer is exhausted or an
    /// interrupt arrives; an interrupt is not an error.
    pub fn retrain(&mut self) -> anyhow::Result<RetrainOutcome> {
        tracing::debug!("Retraining start");
        let finished = self.init()? && self.run()?;
        if finished {
            let best_checkpoint = self.best_ckpt.clone().unwrap_or_else(|| PRETRAINED.to_string());
            return Ok(RetrainOutcome::Finished { best_checkpoint });
        }
        self.progress.abandon_with_message("interrupted");
        tracing::info!("Stopped");
        if let Some(seconds) = self.config.countdown {
            if countdown(seconds, &self.interrupt) {
                self.session.save_checkpoint(LATEST)?;
            }
        }
        Ok(RetrainOutcome::Interrupted)
    }

    /// Iterate until the search finishes (`true`) or is interrupted (`false`).
    fn run(&mut self) -> anyhow::Result<bool> {
        loop {
            if self.interrupted() {
                return Ok(false);
            }
            if !self.retrain_iteration()? {
                return Ok(true);
            }
        }
    }

    /// Reset all state, profile baselines and start tightening the first
    /// target. Returns `false` if interrupted while profiling.
    pub fn init(&mut self) -> anyhow::Result<bool> {
        self.stats.reset();
        self.reset_vars();
        {
            let (_, overriders) = self.session.overriders_with_runtime();
            for o in overriders.iter_mut() {
                if let Some(t) = o.as_tunable_mut() {
                    t.setup(&self.config.retrain);
                }
            }
        }
        if self.session.checkpoint_exists(PRETRAINED) {
            tracing::warn!(
                tag = PRETRAINED,
                "Overwriting existing checkpoint with the current weights"
            );
        }
        self.session.save_checkpoint(PRETRAINED)?;
        self.profile_overrider(true)?;
        if self.target_layer.is_none() {
            return Err(RetrainError::NoCandidates.into());
        }
        if !self.profile_for_one_epoch()? {
            return Ok(false);
        }
        self.stats.reset();
        self.overriders_refresh()?;
        Ok(true)
    }

    fn reset_vars(&mut self) {
        self.log.clear();
        self.retrain_cnt = 0;
        self.target_layer = None;
        self.loss_avg = None;
        self.acc_avg = None;
        self.best_ckpt = None;
        self.cp_epoch = 0.0;
        self.change.reset();
    }

    fn reset_num_epochs(&mut self) {
        self.session.reset_num_epochs();
        self.change.reset();
    }

    // ── Profiling ───────────────────────────────────────────────────────────

    /// Establish `loss_base`/`acc_base` from one epoch of training.
    fn profile_for_one_epoch(&mut self) -> anyhow::Result<bool> {
        tracing::info!("Start profiling for one epoch");
        self.stats.reset();
        self.reset_num_epochs();
        let tolerance = self.config.retrain.tolerance;
        let mut epoch = 0.0;
        while epoch < 1.0 {
            if self.interrupted() {
                return Ok(false);
            }
            let outcome = self.session.once()?;
            if !outcome.loss.is_finite() {
                return Err(RetrainError::Diverged { loss: outcome.loss }.into());
            }
            self.stats.update(outcome.loss, outcome.accuracy);
            epoch = outcome.epoch;
        }
        let (loss_mean, acc_mean) = self.stats.mean();
        self.loss_base = loss_mean * (1.0 + tolerance);
        self.acc_base = acc_mean * (1.0 - tolerance);
        self.stats.reset();
        self.reset_num_epochs();
        tracing::debug!(loss_base = self.loss_base, acc_base = self.acc_base, "Profiled baselines");
        Ok(true)
    }

    /// Rank eligible layers and pop the next target.
    ///
    /// On `start`, every tunable layer is marked as continuing, automatic
    /// updates are switched off for every overrider, and `pretrained` becomes
    /// the rollback target.
    pub fn profile_overrider(&mut self, start: bool) -> anyhow::Result<()> {
        self.priority_list.clear();
        if start {
            self.best_ckpt = Some(PRETRAINED.to_string());
            self.cont.clear();
            let (_, overriders) = self.session.overriders_with_runtime();
            for o in overriders.iter_mut() {
                if let (Some(name), Some(_)) = (o.name(), o.as_tunable()) {
                    self.cont.insert(name.to_string(), true);
                }
                o.set_should_update(false);
            }
        }

        let mut zeroed: Vec<(String, usize)> = Vec::new();
        for o in self.session.overriders() {
            let (Some(name), Some(t)) = (o.name(), o.as_tunable()) else {
                continue;
            };
            let count = count_zeros(&t.mask()?)?;
            tracing::debug!(
                layer = name,
                zeroed = count,
                threshold = t.threshold(),
                scale = t.scale(),
                "Profiled layer"
            );
            zeroed.push((name.to_string(), count));
        }
        zeroed.sort_by_key(|(_, count)| *count);

        self.priority_list = zeroed
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| self.cont.get(name).copied().unwrap_or(false) && !name.contains("biases"))
            .collect();
        tracing::debug!(priority = ?self.priority_list, "Priority list");
        match self.priority_list.pop() {
            Some(target) => self.target_layer = Some(target),
            None => tracing::debug!("Priority list is empty"),
        }
        Ok(())
    }

    // ── Iteration ───────────────────────────────────────────────────────────

    /// One training step plus the checkpoint-boundary decisions.
    /// Returns `false` once the search is finished.
    pub fn retrain_iteration(&mut self) -> anyhow::Result<bool> {
        let outcome = self.session.once()?;
        let StepOutcome {
            loss,
            accuracy,
            epoch,
        } = outcome;
        self.stats.update(loss, accuracy);
        if !loss.is_finite() {
            return Err(RetrainError::Diverged { loss }.into());
        }
        self.update_progress(&outcome);

        if let Some(interval) = self.config.summary_interval {
            if self.change.every("summary.epoch", epoch, interval) {
                self.session.save_summary(&outcome)?;
            }
        }

        let floor_epoch = epoch.floor();
        if !self
            .change
            .every("checkpoint.epoch", floor_epoch, self.config.checkpoint_interval)
        {
            return Ok(true);
        }

        let (loss_avg, acc_avg) = self.stats.mean();
        self.stats.reset();
        self.loss_avg = Some(loss_avg);
        self.acc_avg = Some(acc_avg);

        if acc_avg >= self.acc_base {
            let tag = format!("th-{}-{}", self.retrain_cnt, floor_epoch as u64);
            tracing::debug!(target_layer = ?self.target_layer, "Accepted threshold");
            self.session.save_checkpoint(&tag)?;
            self.best_ckpt = Some(tag);
            self.cp_epoch = floor_epoch;
            self.retrain_cnt += 1;
            self.log_thresholds(loss_avg, acc_avg)?;
            self.profile_overrider(false)?;
            self.overriders_refresh()?;
            self.reset_num_epochs();
            return Ok(true);
        }

        if epoch >= self.config.retrain.iter_max_epoch && epoch > 0.0 {
            self.retrain_cnt += 1;
            self.reset_num_epochs();
            self.log_thresholds(loss_avg, acc_avg)?;
            if self.finished() {
                self.finish()?;
                return Ok(false);
            }
            self.control_thresholds()?;
            let best = self.best_ckpt.clone().unwrap_or_else(|| PRETRAINED.to_string());
            self.session
                .load_checkpoint(&best)
                .with_context(|| format!("rolling back to {best:?}"))?;
            self.profile_overrider(false)?;
            self.overriders_refresh()?;
            self.reset_num_epochs();
        }
        Ok(true)
    }

    /// No layer is left to search.
    fn finished(&self) -> bool {
        self.priority_list.is_empty()
            && self
                .target_layer
                .as_ref()
                .map_or(true, |t| !self.cont.get(t).copied().unwrap_or(false))
    }

    fn update_progress(&self, outcome: &StepOutcome) {
        self.progress.set_message(format!(
            "target {} epoch {:.2} loss {:.4} acc {:.3} (base {:.3}) last checkpoint epoch {}",
            self.target_layer.as_deref().unwrap_or("-"),
            outcome.epoch,
            outcome.loss,
            outcome.accuracy,
            self.acc_base,
            self.cp_epoch
        ));
        self.progress.tick();
    }

    // ── Threshold control ───────────────────────────────────────────────────

    /// Undo the target's last tightening step; shrink the step while it is
    /// at least `min_scale`, otherwise retire the layer.
    pub fn control_thresholds(&mut self) -> anyhow::Result<()> {
        let target = self.target_layer.clone().ok_or(RetrainError::NoCandidates)?;
        let min_scale = self.config.retrain.min_scale;
        let factor = self.config.retrain.scale_update_factor;
        let (_, overriders) = self.session.overriders_with_runtime();
        let tunable = find_tunable_mut(overriders, &target)
            .ok_or_else(|| RetrainError::UnknownLayer(target.clone()))?;

        if tunable.scale() >= min_scale {
            tunable.scale_roll_back();
            tunable.scale_update(factor);
            tracing::debug!(layer = %target, scale = tunable.scale(), "Decreased scaling factor");
        } else {
            tunable.scale_roll_back();
            tracing::info!(layer = %target, threshold = tunable.threshold(), "Layer exhausted");
            self.cont.insert(target, false);
        }
        Ok(())
    }

    /// Record the target's threshold: always for its first entry, afterwards
    /// only when `acc` beats the baseline.
    fn log_thresholds(&mut self, loss: f64, acc: f64) -> anyhow::Result<()> {
        let Some(target) = self.target_layer.clone() else {
            return Ok(());
        };
        let threshold = find_tunable(self.session.overriders(), &target)
            .ok_or_else(|| RetrainError::UnknownLayer(target.clone()))?
            .threshold();
        let record = ThresholdRecord {
            threshold,
            loss,
            accuracy: acc,
        };
        if !self.log.contains_key(&target) || acc > self.acc_base {
            self.log.insert(target, record);
        }
        Ok(())
    }

    /// Tighten the target one step, re-enable its updates and update all
    /// overriders.
    pub fn overriders_refresh(&mut self) -> anyhow::Result<()> {
        if let Some(target) = self.target_layer.as_deref() {
            if self.cont.get(target).copied().unwrap_or(false) {
                let (_, overriders) = self.session.overriders_with_runtime();
                for o in overriders.iter_mut() {
                    if o.name() == Some(target) {
                        if let Some(t) = o.as_tunable_mut() {
                            t.threshold_update();
                        }
                        o.set_should_update(true);
                    }
                }
            }
        }
        self.session.overriders_update()
    }

    // ── Final summary ───────────────────────────────────────────────────────

    fn finish(&mut self) -> anyhow::Result<()> {
        self.progress.finish_with_message("done");
        tracing::info!(best = ?self.best_ckpt, "Overrider search done");
        let mut final_state = Vec::new();
        for o in self.session.overriders() {
            let (Some(name), Some(t)) = (o.name(), o.as_tunable()) else {
                continue;
            };
            tracing::info!(
                layer = name,
                threshold = format!("{:.4}", t.threshold()),
                scale = format!("{:.4}", t.scale()),
                "Final threshold"
            );
            final_state.push(FinalLayer {
                name: name.to_string(),
                threshold: t.threshold(),
                scale: t.scale(),
                searching: self.cont.get(name).copied().unwrap_or(false),
            });
        }

        let Some(dir) = &self.config.log_dir else {
            return Ok(());
        };
        let report = SearchReport {
            best_checkpoint: self.best_ckpt.as_deref(),
            retrain_count: self.retrain_cnt,
            loss_base: self.loss_base,
            acc_base: self.acc_base,
            layers: &self.log,
            final_state,
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "Search log written");
        Ok(())
    }
}

fn find_tunable<'a>(overriders: &'a [Box<dyn Overrider>], name: &str) -> Option<&'a dyn Tunable> {
    overriders
        .iter()
        .find(|o| o.name() == Some(name))
        .and_then(|o| o.as_tunable())
}

fn find_tunable_mut<'a>(
    overriders: &'a mut [Box<dyn Overrider>],
    name: &str,
) -> Option<&'a mut dyn Tunable> {
    overriders
        .iter_mut()
        .find(|o| o.name() == Some(name))
        .and_then(|o| o.as_tunable_mut())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use candle_core::{Device, Tensor};
    use squeeze_core::{CellRequest, Getter, Runtime, ThresholdPruner};

    use super::*;
    use crate::checkpoint::CheckpointStore;

    const LAYERS: [&str; 3] = ["fc1/weights", "fc2/weights", "fc2/biases"];

    /// Session with real pruners over a real runtime and scripted metrics.
    struct Scripted {
        runtime: Runtime,
        overriders: Vec<Box<dyn Overrider>>,
        store: CheckpointStore,
        metrics: VecDeque<(f64, f64)>,
        fallback: (f64, f64),
        steps_per_epoch: usize,
        steps: usize,
        saved: Vec<String>,
        loaded: Vec<String>,
        summaries: usize,
    }

    impl Scripted {
        fn new(dir: &std::path::Path, fallback: (f64, f64)) -> Self {
            let mut runtime = Runtime::new(Device::Cpu);
            let mut overriders: Vec<Box<dyn Overrider>> = Vec::new();
            for (i, name) in LAYERS.iter().enumerate() {
                let cell = runtime
                    .get(&CellRequest::trainable(name, vec![4], candle_nn::Init::Const(0.0)))
                    .unwrap();
                let values: Vec<f32> = (0..4).map(|k| (k + i + 1) as f32 * 0.5).collect();
                runtime
                    .assign(name, &Tensor::new(values.as_slice(), &Device::Cpu).unwrap())
                    .unwrap();
                let mut o: Box<dyn Overrider> = Box::new(ThresholdPruner::new(0.0, 0.2, true));
                o.apply(&mut runtime, name, cell.as_tensor()).unwrap();
                overriders.push(o);
            }
            Self {
                runtime,
                overriders,
                store: CheckpointStore::new(dir.join("ckpt")),
                metrics: VecDeque::new(),
                fallback,
                steps_per_epoch: 1,
                steps: 0,
                saved: Vec::new(),
                loaded: Vec::new(),
                summaries: 0,
            }
        }

        fn script(mut self, steps: &[(f64, f64)]) -> Self {
            self.metrics.extend(steps.iter().copied());
            self
        }
    }

    impl TrainSession for Scripted {
        fn once(&mut self) -> anyhow::Result<StepOutcome> {
            self.steps += 1;
            let (loss, accuracy) = self.metrics.pop_front().unwrap_or(self.fallback);
            Ok(StepOutcome {
                loss,
                accuracy,
                epoch: self.steps as f64 / self.steps_per_epoch as f64,
            })
        }

        fn reset_num_epochs(&mut self) {
            self.steps = 0;
        }

        fn overriders(&self) -> &[Box<dyn Overrider>] {
            &self.overriders
        }

        fn overriders_with_runtime(&mut self) -> (&Runtime, &mut [Box<dyn Overrider>]) {
            (&self.runtime, self.overriders.as_mut_slice())
        }

        fn save_checkpoint(&mut self, tag: &str) -> anyhow::Result<()> {
            self.store.save(&self.runtime, tag)?;
            self.saved.push(tag.to_string());
            Ok(())
        }

        fn load_checkpoint(&mut self, tag: &str) -> anyhow::Result<()> {
            self.store.load(&self.runtime, tag)?;
            self.loaded.push(tag.to_string());
            Ok(())
        }

        fn checkpoint_exists(&self, tag: &str) -> bool {
            self.store.exists(tag)
        }

        fn save_summary(&mut self, _outcome: &StepOutcome) -> anyhow::Result<()> {
            self.summaries += 1;
            Ok(())
        }
    }

    fn config(dir: &std::path::Path) -> RetrainerConfig {
        RetrainerConfig {
            retrain: RetrainConfig {
                iter_max_epoch: 2.0,
                min_scale: 0.05,
                scale_update_factor: 0.5,
                tolerance: 0.1,
                init_scale: None,
            },
            checkpoint_interval: 1.0,
            countdown: Some(0.0),
            summary_interval: None,
            log_dir: Some(dir.to_path_buf()),
        }
    }

    fn tunable<'a>(r: &'a Retrainer<Scripted>, name: &str) -> &'a dyn Tunable {
        find_tunable(r.session().overriders(), name).unwrap()
    }

    #[test]
    fn config_requires_checkpoint_interval() {
        let yaml = "retrain:\n  iter_max_epoch: 3\n  min_scale: 0.01\n  scale_update_factor: 0.5\n  tolerance: 0.05\n";
        let config = Config::from_yaml_str(yaml).unwrap();
        match RetrainerConfig::from_config(&config).unwrap_err() {
            squeeze_common::ConfigError::MissingKeys { keys, .. } => {
                assert_eq!(keys, vec!["system.checkpoint.save.interval".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }

        let config = Config::from_yaml_str(&format!(
            "{yaml}system:\n  checkpoint:\n    directory: out\n    save: {{ interval: 2, countdown: 3 }}\n"
        ))
        .unwrap();
        let rc = RetrainerConfig::from_config(&config).unwrap();
        assert_eq!(rc.checkpoint_interval, 2.0);
        assert_eq!(rc.countdown, Some(3.0));
        assert_eq!(rc.summary_interval, None);
        assert_eq!(rc.log_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn config_rejects_non_positive_checkpoint_interval() {
        let base = "retrain:\n  iter_max_epoch: 3\n  min_scale: 0.01\n  scale_update_factor: 0.5\n  tolerance: 0.05\n";
        for interval in ["0", "-1"] {
            let config = Config::from_yaml_str(&format!(
                "{base}system:\n  checkpoint:\n    save: {{ interval: {interval} }}\n"
            ))
            .unwrap();
            match RetrainerConfig::from_config(&config).unwrap_err() {
                ConfigError::InvalidValue { key, .. } => {
                    assert_eq!(key, "system.checkpoint.save.interval")
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn profile_ranks_by_zeroed_count_and_skips_biases() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        session
            .runtime
            .assign("fc1/weights/mask", &Tensor::new(&[0f32, 0.0, 1.0, 1.0], &Device::Cpu).unwrap())
            .unwrap();
        session
            .runtime
            .assign("fc2/biases/mask", &Tensor::new(&[0f32, 0.0, 0.0, 1.0], &Device::Cpu).unwrap())
            .unwrap();
        let mut r = Retrainer::new(session, config(dir.path()));
        r.profile_overrider(true).unwrap();

        assert_eq!(r.target_layer(), Some("fc1/weights"));
        assert_eq!(r.priority_list(), &["fc2/weights".to_string()]);
        assert_eq!(r.best_ckpt(), Some(PRETRAINED));
        assert_eq!(r.cont("fc2/biases"), Some(true));
        assert!(r.session().overriders().iter().all(|o| !o.should_update()));

        // Retired layers never come back.
        r.cont.insert("fc2/weights".to_string(), false);
        r.profile_overrider(false).unwrap();
        assert_eq!(r.target_layer(), Some("fc1/weights"));
        assert!(r.priority_list().is_empty());
    }

    #[test]
    fn profiling_sets_tolerance_adjusted_baselines() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Scripted::new(dir.path(), (2.0, 0.5));
        session.steps_per_epoch = 4;
        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());

        let (loss_base, acc_base) = r.baselines();
        assert!((loss_base - 2.2).abs() < 1e-9);
        assert!((acc_base - 0.45).abs() < 1e-9);
        assert_eq!(r.session().saved, vec![PRETRAINED]);
        assert_eq!(r.session().steps, 0);

        // Ties keep declaration order: fc2/weights is popped first.
        let target = r.target_layer().unwrap().to_string();
        assert_eq!(target, "fc2/weights");
        assert!((tunable(&r, &target).threshold() - 0.2).abs() < 1e-12);
        for o in r.session().overriders() {
            assert_eq!(o.should_update(), o.name() == Some(target.as_str()));
        }
    }

    #[test]
    fn accepted_threshold_saves_tagged_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.checkpoint_interval = 3.0;
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        let mut r = Retrainer::new(session, cfg);
        assert!(r.init().unwrap());
        let target = r.target_layer().unwrap().to_string();

        assert!(r.retrain_iteration().unwrap());
        assert!(r.retrain_iteration().unwrap());
        assert_eq!(r.retrain_cnt(), 0);
        assert!(r.retrain_iteration().unwrap());

        assert_eq!(r.session().saved, vec![PRETRAINED, "th-0-3"]);
        assert_eq!(r.best_ckpt(), Some("th-0-3"));
        assert_eq!(r.retrain_cnt(), 1);
        assert_eq!(r.session().steps, 0);
        let record = r.log()[&target];
        assert!((record.accuracy - 0.5).abs() < 1e-12);
        assert!((record.threshold - 0.2).abs() < 1e-12);
        // Tightened again after success.
        let next = r.target_layer().unwrap().to_string();
        assert!(tunable(&r, &next).threshold() > 0.0);
    }

    #[test]
    fn failure_before_budget_keeps_training() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.1)).script(&[(2.0, 0.5)]);
        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());
        assert!(r.retrain_iteration().unwrap());
        assert_eq!(r.retrain_cnt(), 0);
        assert!(r.session().loaded.is_empty());
    }

    #[test]
    fn failure_at_budget_rolls_back_and_shrinks_step() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.1)).script(&[(2.0, 0.5)]);
        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());
        let target = r.target_layer().unwrap().to_string();

        assert!(r.retrain_iteration().unwrap());
        assert!(r.retrain_iteration().unwrap());

        assert_eq!(r.retrain_cnt(), 1);
        assert_eq!(r.session().loaded, vec![PRETRAINED]);
        assert_eq!(r.cont(&target), Some(true));
        // Rolled back to 0, halved to 0.1, then tightened by the new step.
        let t = tunable(&r, &target);
        assert!((t.scale() - 0.1).abs() < 1e-12);
        assert!((t.threshold() - 0.1).abs() < 1e-12);
        assert!((r.log()[&target].threshold - 0.2).abs() < 1e-12);
    }

    #[test]
    fn step_below_min_scale_retires_layer() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());
        let target = r.target_layer().unwrap().to_string();
        {
            let (_, overriders) = r.session.overriders_with_runtime();
            let t = find_tunable_mut(overriders, &target).unwrap();
            t.scale_update(0.1);
        }
        let before = tunable(&r, &target).threshold();
        let scale = tunable(&r, &target).scale();
        assert!(scale < 0.05);

        r.control_thresholds().unwrap();
        assert_eq!(r.cont(&target), Some(false));
        let t = tunable(&r, &target);
        assert_eq!(t.scale(), scale);
        assert!((t.threshold() - (before - scale)).abs() < 1e-12);

        r.profile_overrider(false).unwrap();
        assert!(!r.priority_list().contains(&target));
    }

    #[test]
    fn exhausted_search_stops_without_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.1)).script(&[(2.0, 0.5)]);
        let mut cfg = config(dir.path());
        cfg.retrain.iter_max_epoch = 1.0;
        let mut r = Retrainer::new(session, cfg);
        assert!(r.init().unwrap());
        let target = r.target_layer().unwrap().to_string();
        r.priority_list.clear();
        r.cont.insert(target, false);

        assert!(!r.retrain_iteration().unwrap());
        assert_eq!(r.session().saved, vec![PRETRAINED]);
        assert!(r.session().loaded.is_empty());
        assert!(dir.path().join(LOG_FILE).is_file());
    }

    #[test]
    fn non_finite_loss_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.5)).script(&[(2.0, 0.5), (f64::NAN, 0.5)]);
        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());
        let err = r.retrain_iteration().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrainError>(),
            Some(RetrainError::Diverged { .. })
        ));
        assert_eq!(r.session().saved, vec![PRETRAINED]);
    }

    #[test]
    fn retiring_last_layer_keeps_training_one_more_budget() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.1)).script(&[(2.0, 0.5)]);
        let mut cfg = config(dir.path());
        cfg.retrain.iter_max_epoch = 1.0;
        let mut r = Retrainer::new(session, cfg);
        assert!(r.init().unwrap());
        let target = r.target_layer().unwrap().to_string();
        r.priority_list.clear();
        r.cont.insert("fc1/weights".to_string(), false);
        {
            let (_, overriders) = r.session.overriders_with_runtime();
            find_tunable_mut(overriders, &target).unwrap().scale_update(0.1);
        }

        // Budget exhausted while the target is still live: retire and go on.
        assert!(r.retrain_iteration().unwrap());
        assert_eq!(r.cont(&target), Some(false));
        assert_eq!(r.session().loaded, vec![PRETRAINED]);
        assert_eq!(r.session().steps, 0);
        assert!(!dir.path().join(LOG_FILE).exists());

        // The next budget boundary finds nothing left and stops.
        assert!(!r.retrain_iteration().unwrap());
        assert_eq!(r.retrain_cnt(), 2);
        assert!(dir.path().join(LOG_FILE).is_file());
    }

    #[test]
    fn init_replaces_stale_pretrained_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        session.store.save(&session.runtime, PRETRAINED).unwrap();
        let current = Tensor::new(&[9f32, 9.0, 9.0, 9.0], &Device::Cpu).unwrap();
        session.runtime.assign("fc1/weights", &current).unwrap();

        let mut r = Retrainer::new(session, config(dir.path()));
        assert!(r.init().unwrap());
        r.session.load_checkpoint(PRETRAINED).unwrap();
        let restored = r
            .session()
            .runtime
            .value("fc1/weights")
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(restored, vec![9.0; 4]);
    }

    #[test]
    fn full_search_retires_every_layer() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.1)).script(&[(2.0, 0.5)]);
        let mut r = Retrainer::new(session, config(dir.path()));

        let outcome = r.retrain().unwrap();
        assert_eq!(
            outcome,
            RetrainOutcome::Finished {
                best_checkpoint: PRETRAINED.to_string()
            }
        );
        assert_eq!(r.cont("fc1/weights"), Some(false));
        assert_eq!(r.cont("fc2/weights"), Some(false));
        assert!(r.session().loaded.iter().all(|t| t == PRETRAINED));
        // Four attempts per layer (scale 0.2, 0.1, 0.05, then 0.025 < min),
        // plus one more budget after the last layer is retired.
        assert_eq!(r.retrain_cnt(), 9);

        let text = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["best_checkpoint"], "pretrained");
        assert_eq!(json["final_state"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn interrupt_saves_latest_and_returns_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        let mut r = Retrainer::new(session, config(dir.path()));
        r.interrupt_handle().store(true, Ordering::SeqCst);

        assert_eq!(r.retrain().unwrap(), RetrainOutcome::Interrupted);
        assert_eq!(r.session().saved, vec![PRETRAINED, LATEST]);
        assert!(!r.interrupt_handle().load(Ordering::SeqCst));
    }

    #[test]
    fn no_tunable_layers_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Scripted::new(dir.path(), (2.0, 0.5));
        session.overriders.truncate(0);
        let mut r = Retrainer::new(session, config(dir.path()));
        let err = r.init().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RetrainError>(),
            Some(RetrainError::NoCandidates)
        ));
    }

    #[test]
    fn summaries_follow_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.summary_interval = Some(1.0);
        cfg.checkpoint_interval = 10.0;
        let session = Scripted::new(dir.path(), (2.0, 0.5));
        let mut r = Retrainer::new(session, cfg);
        assert!(r.init().unwrap());
        for _ in 0..3 {
            r.retrain_iteration().unwrap();
        }
        assert_eq!(r.session().summaries, 3);
    }
}
