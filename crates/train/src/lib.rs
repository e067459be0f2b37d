//! # squeeze-train — Training & Threshold Search
//!
//! * **[`Trainer`]** — owns runtime + net + optimiser. One call to
//!   [`TrainSession::once`] runs forward, backward and AdamW, and advances
//!   the fractional epoch counter.
//! * **[`TrainSession`]** — what the retrainer needs from a trainer.
//! * **[`Retrainer`]** — greedy per-layer threshold search with checkpoint
//!   rollback.
//! * **[`CheckpointStore`]** / **[`SummaryWriter`]** — tagged snapshots and
//!   CSV summaries.

pub mod change;
pub mod checkpoint;
pub mod error;
pub mod interrupt;
pub mod retrain;
pub mod session;
pub mod summary;
pub mod trainer;

pub use change::Change;
pub use checkpoint::{CheckpointStore, LATEST, PRETRAINED};
pub use error::RetrainError;
pub use interrupt::countdown;
pub use retrain::{RetrainOutcome, Retrainer, RetrainerConfig, ThresholdRecord, LOG_FILE};
pub use session::{StepOutcome, TrainSession};
pub use summary::SummaryWriter;
pub use trainer::Trainer;
