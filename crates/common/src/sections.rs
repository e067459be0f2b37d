//! Typed views over the configuration tree.
//!
//! Every section is deserialised from its dotted path with
//! [`Config::section`]. Fields carrying `#[serde(default)]` may be omitted;
//! required fields are checked up front with [`Config::validate`] so that a
//! missing key surfaces before any training state is built.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{ConfigError, Result};

// ── retrain.* ───────────────────────────────────────────────────────────────

/// Knobs of the threshold-search retraining loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// Epoch budget for one tightening attempt on a layer.
    pub iter_max_epoch: f64,
    /// Scale below which a layer stops being tightened.
    pub min_scale: f64,
    /// Multiplicative factor applied to a layer's scale after an overshoot.
    pub scale_update_factor: f64,
    /// Relative accuracy/loss slack around the profiled baselines.
    pub tolerance: f64,
    /// Overrides the initial tightening step of every tunable overrider.
    #[serde(default)]
    pub init_scale: Option<f64>,
}

impl RetrainConfig {
    /// Keys without defaults.
    pub const REQUIRED_KEYS: [&'static str; 4] = [
        "retrain.iter_max_epoch",
        "retrain.min_scale",
        "retrain.scale_update_factor",
        "retrain.tolerance",
    ];

    /// Validate presence and ranges, then deserialise `retrain`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate(&Self::REQUIRED_KEYS, "retrain")?;
        let section: Self = config.section("retrain")?;
        section.check()?;
        Ok(section)
    }

    fn check(&self) -> Result<()> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: format!("retrain.{key}"),
            message: message.to_string(),
        };
        if !(self.iter_max_epoch > 0.0) {
            return Err(invalid("iter_max_epoch", "must be positive"));
        }
        if !(self.min_scale > 0.0) {
            return Err(invalid("min_scale", "must be positive"));
        }
        if !(self.scale_update_factor > 0.0 && self.scale_update_factor < 1.0) {
            return Err(invalid("scale_update_factor", "must lie in (0, 1)"));
        }
        if !(0.0..1.0).contains(&self.tolerance) {
            return Err(invalid("tolerance", "must lie in [0, 1)"));
        }
        Ok(())
    }
}

// ── system.* ────────────────────────────────────────────────────────────────

/// Process-level settings: logging, device, checkpoints and summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub use_cuda: bool,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            use_cuda: false,
            checkpoint: CheckpointConfig::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.section("system")
    }
}

/// `system.checkpoint`: where snapshots live and when they are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    /// Tag restored before a command runs (e.g. `pretrained`, `latest`).
    #[serde(default)]
    pub load: Option<String>,
    /// Periodic saving; absent disables both interval saves and the
    /// save-on-interrupt countdown.
    #[serde(default)]
    pub save: Option<SaveConfig>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            load: None,
            save: None,
        }
    }
}

impl CheckpointConfig {
    /// Checkpoint interval in epochs (0 when saving is disabled).
    pub fn interval(&self) -> f64 {
        self.save.as_ref().map_or(0.0, |s| s.interval)
    }
}

/// `system.checkpoint.save`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveConfig {
    /// Epochs between checkpoint boundaries.
    #[serde(default = "default_save_interval")]
    pub interval: f64,
    /// Grace period in seconds before saving on interrupt.
    #[serde(default)]
    pub countdown: f64,
}

/// `system.summary`: periodic CSV training summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default)]
    pub save: bool,
    /// Epochs between summary rows.
    #[serde(default = "default_summary_interval")]
    pub interval: f64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            save: false,
            interval: default_summary_interval(),
        }
    }
}

// ── train.* ─────────────────────────────────────────────────────────────────

/// Optimiser and loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: f64,
    /// Steps between automatic overrider updates (0 = manual only).
    #[serde(default)]
    pub update_overriders_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            batch_size: default_batch_size(),
            max_epochs: default_max_epochs(),
            update_overriders_every: 0,
        }
    }
}

impl TrainConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        let section: Self = config.section("train")?;
        if section.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "train.batch_size".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(section)
    }
}

// ── dataset.* ───────────────────────────────────────────────────────────────

/// Synthetic Gaussian-blob classification data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_num_examples")]
    pub num_examples: usize,
    #[serde(default = "default_num_features")]
    pub num_features: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Standard deviation of each blob around its centre.
    #[serde(default = "default_spread")]
    pub spread: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_validation_fraction")]
    pub validation_fraction: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_examples: default_num_examples(),
            num_features: default_num_features(),
            num_classes: default_num_classes(),
            spread: default_spread(),
            seed: default_seed(),
            validation_fraction: default_validation_fraction(),
        }
    }
}

impl DatasetConfig {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.section("dataset")
    }
}

// ── model.* ─────────────────────────────────────────────────────────────────

/// Declarative network description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    pub layers: Vec<LayerSpec>,
}

impl ModelConfig {
    pub const REQUIRED_KEYS: [&'static str; 1] = ["model.layers"];

    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate(&Self::REQUIRED_KEYS, "model")?;
        let section: Self = config.section("model")?;
        if section.layers.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "model.layers".to_string(),
                message: "at least one layer is required".to_string(),
            });
        }
        Ok(section)
    }
}

/// One fully-connected layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub units: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub overriders: LayerOverriders,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Identity,
}

/// Overriders attached to a layer's trainable cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOverriders {
    #[serde(default)]
    pub weights: Option<OverriderSpec>,
    #[serde(default)]
    pub biases: Option<OverriderSpec>,
}

/// Declarative overrider, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverriderSpec {
    /// Magnitude pruning with a searchable threshold.
    Prune {
        #[serde(default)]
        alpha: f64,
        #[serde(default = "default_prune_scale")]
        scale: f64,
        #[serde(default = "default_true")]
        should_update: bool,
    },
    /// Dynamic fixed-point quantisation.
    FixedPoint {
        #[serde(default = "default_width")]
        width: u32,
        #[serde(default = "default_point")]
        point: i32,
        #[serde(default = "default_true")]
        should_update: bool,
    },
    /// Ordered composition.
    Chain {
        overriders: Vec<OverriderSpec>,
        #[serde(default = "default_true")]
        should_update: bool,
    },
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_save_interval() -> f64 {
    1.0
}
fn default_summary_interval() -> f64 {
    0.1
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_batch_size() -> usize {
    32
}
fn default_max_epochs() -> f64 {
    10.0
}
fn default_num_examples() -> usize {
    2048
}
fn default_num_features() -> usize {
    16
}
fn default_num_classes() -> usize {
    4
}
fn default_spread() -> f64 {
    1.0
}
fn default_seed() -> u64 {
    42
}
fn default_validation_fraction() -> f64 {
    0.2
}
fn default_model_name() -> String {
    "mlp".to_string()
}
fn default_prune_scale() -> f64 {
    0.2
}
fn default_width() -> u32 {
    8
}
fn default_point() -> i32 {
    4
}
fn default_true() -> bool {
    true
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
retrain:
  iter_max_epoch: 3
  min_scale: 0.01
  scale_update_factor: 0.5
  tolerance: 0.05
system:
  checkpoint:
    save:
      interval: 2
model:
  layers:
    - name: fc1
      units: 32
      overriders:
        weights:
          type: prune
          alpha: 0.5
        biases:
          type: fixed_point
          width: 6
    - name: logits
      units: 4
      activation: identity
      overriders:
        weights:
          type: chain
          overriders:
            - type: prune
            - type: fixed_point
"#;

    #[test]
    fn retrain_section_round_trip() {
        let config = Config::from_yaml_str(YAML).unwrap();
        let retrain = RetrainConfig::from_config(&config).unwrap();
        assert_eq!(retrain.iter_max_epoch, 3.0);
        assert_eq!(retrain.scale_update_factor, 0.5);
        assert_eq!(retrain.init_scale, None);
    }

    #[test]
    fn retrain_missing_keys_fail_fast() {
        let config = Config::from_yaml_str("retrain:\n  tolerance: 0.1\n").unwrap();
        match RetrainConfig::from_config(&config).unwrap_err() {
            ConfigError::MissingKeys { keys, .. } => assert_eq!(keys.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn retrain_ranges_checked() {
        let mut config = Config::from_yaml_str(YAML).unwrap();
        config.override_update("retrain.scale_update_factor=1.5").unwrap();
        assert!(matches!(
            RetrainConfig::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn system_defaults_fill_gaps() {
        let config = Config::from_yaml_str(YAML).unwrap();
        let system = SystemConfig::from_config(&config).unwrap();
        assert_eq!(system.log_level, "info");
        assert_eq!(system.checkpoint.interval(), 2.0);
        assert_eq!(system.checkpoint.save.as_ref().unwrap().countdown, 0.0);
        assert!(!system.summary.save);
        assert_eq!(system.summary.interval, 0.1);

        let empty = SystemConfig::from_config(&Config::new()).unwrap();
        assert_eq!(empty, SystemConfig::default());
        assert_eq!(empty.checkpoint.interval(), 0.0);
    }

    #[test]
    fn model_overrider_specs() {
        let config = Config::from_yaml_str(YAML).unwrap();
        let model = ModelConfig::from_config(&config).unwrap();
        assert_eq!(model.name, "mlp");
        assert_eq!(model.layers[1].activation, Activation::Identity);
        assert_eq!(
            model.layers[0].overriders.weights,
            Some(OverriderSpec::Prune {
                alpha: 0.5,
                scale: 0.2,
                should_update: true
            })
        );
        assert_eq!(
            model.layers[0].overriders.biases,
            Some(OverriderSpec::FixedPoint {
                width: 6,
                point: 4,
                should_update: true
            })
        );
        match &model.layers[1].overriders.weights {
            Some(OverriderSpec::Chain { overriders, .. }) => assert_eq!(overriders.len(), 2),
            other => panic!("expected chain, got {other:?}"),
        }
    }

    #[test]
    fn model_requires_layers() {
        assert!(matches!(
            ModelConfig::from_config(&Config::new()),
            Err(ConfigError::MissingKeys { .. })
        ));
        let config = Config::from_yaml_str("model:\n  layers: []\n").unwrap();
        assert!(matches!(
            ModelConfig::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
