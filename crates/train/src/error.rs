//! Typed failures of the retraining controller.
//!
//! Orchestration code returns `anyhow::Result`; these variants travel inside
//! it and can be recovered with `downcast_ref::<RetrainError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrainError {
    /// A training step produced a non-finite loss.
    #[error("model diverged with a non-finite loss ({loss})")]
    Diverged { loss: f64 },

    /// No tunable, non-bias overrider is attached to the model.
    #[error("no tunable overriders to search")]
    NoCandidates,

    /// A layer name does not match any tunable overrider.
    #[error("no tunable overrider is bound to {0:?}")]
    UnknownLayer(String),
}
