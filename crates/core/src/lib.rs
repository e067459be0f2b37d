//! # squeeze-core — Overriders and Runtime State
//!
//! Everything needed to intercept trainable values and compress them lives
//! in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`runtime`] | `Runtime` state cells, the `Getter` trait, safetensors snapshots |
//! | [`parameter`] | `Parameter` declarations and `NumericKind` |
//! | [`overrider`] | `Overrider` lifecycle trait, `OverriderCore`, `Tunable` search hooks |
//! | [`chain`] | `ChainOverrider` ordered composition |
//! | [`prune`] | `ThresholdPruner` magnitude masks |
//! | [`quantize`] | `FixedPointQuantizer` and the fixed-point STE |
//! | [`registry`] | `build_overrider` from config specs |
//! | [`model`] | `Net` feed-forward graph, `CompressionStats` |
//!
//! ## Design principles
//!
//! 1. **One owner per cell.** Every value lives in the `Runtime`; overriders
//!    and layers hold cheap handles, writes go through the runtime.
//! 2. **Explicit lifecycle.** Misuse (`update` before `apply`, parameter
//!    reads without a getter) is a typed error, never a panic.
//! 3. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.

pub mod chain;
pub mod error;
pub mod model;
pub mod overrider;
pub mod parameter;
pub mod prune;
pub mod quantize;
pub mod registry;
pub mod runtime;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use chain::ChainOverrider;
pub use error::{OverrideError, Result};
pub use model::{compression_stats, CompressionStats, Net};
pub use overrider::{Overrider, OverriderCore, OverriderInfo, TrackingGetter, Tunable};
pub use parameter::{NumericKind, Parameter};
pub use prune::ThresholdPruner;
pub use quantize::{quantize_fixed_point, FixedPointQuantizer};
pub use registry::build_overrider;
pub use runtime::{count_zeros, CellRequest, Getter, Runtime, StateCell};
