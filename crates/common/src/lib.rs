//! # squeeze-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`Config`]** — YAML configuration addressed by dotted paths.
//! * **[`sections`]** — typed views (`retrain`, `system`, `train`, `dataset`, `model`).
//! * **[`BlobDataset`]** / **[`batch_to_tensors`]** — synthetic data & batching.

pub mod config;
pub mod data;
pub mod error;
pub mod sections;

pub use config::Config;
pub use data::{batch_to_tensors, BlobDataset};
pub use error::ConfigError;
pub use sections::{
    Activation, CheckpointConfig, DatasetConfig, LayerOverriders, LayerSpec, ModelConfig,
    OverriderSpec, RetrainConfig, SaveConfig, SummaryConfig, SystemConfig, TrainConfig,
};
