//! Error types for the overrider framework.

use thiserror::Error;

/// Result alias for overrider and runtime operations.
pub type Result<T> = std::result::Result<T, OverrideError>;

/// Errors raised by overriders, parameters and the runtime.
#[derive(Debug, Error)]
pub enum OverrideError {
    /// `update` (or anything needing the overridden value) ran before `apply`.
    #[error("method `apply` must be invoked before `update` on {0}")]
    NotApplied(String),

    /// A parameter was read without a getter and was never materialised
    /// during `apply`.
    #[error("parameter {0:?} needs the getter, which is only available inside `apply`")]
    GetterOutsideApply(String),

    /// A parameter was declared with a numeric kind other than int or float.
    #[error("invalid numeric kind {0:?}: parameters accept only int or float")]
    InvalidNumericKind(String),

    /// No state cell with this name exists in the runtime.
    #[error("unknown state cell {0:?}")]
    UnknownCell(String),

    /// A staged assignment names a parameter that was never materialised.
    #[error("parameter {0:?} has not been materialised")]
    UnknownParameter(String),

    /// A state cell was requested or assigned with the wrong shape.
    #[error("shape mismatch for {name:?}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
