//! Overrider parameters: named, lazily materialised state values.
//!
//! A [`Parameter`] is only a declaration. Its backing cell is created on the
//! first read through [`OverriderCore::parameter`](crate::OverriderCore::parameter)
//! and cached in the owning overrider; writes are staged with
//! [`OverriderCore::stage`](crate::OverriderCore::stage) and committed in a
//! batch by `assign_parameters`.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{OverrideError, Result};

/// Numeric kind of a parameter. Integer parameters are read back rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Integer,
    Real,
}

impl FromStr for NumericKind {
    type Err = OverrideError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(Self::Integer),
            "float" | "real" => Ok(Self::Real),
            other => Err(OverrideError::InvalidNumericKind(other.to_string())),
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "int"),
            Self::Real => write!(f, "float"),
        }
    }
}

/// Declaration of one overrider parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub initial: f64,
    /// `None` declares a scalar.
    pub shape: Option<Vec<usize>>,
    pub kind: NumericKind,
    pub trainable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, initial: f64, kind: NumericKind) -> Self {
        Self {
            name: name.into(),
            initial,
            shape: None,
            kind,
            trainable: false,
        }
    }

    /// Declare from a textual kind (`"int"`, `"float"`, ...).
    pub fn declare(name: impl Into<String>, initial: f64, kind: &str) -> Result<Self> {
        Ok(Self::new(name, initial, kind.parse()?))
    }

    pub fn with_shape(mut self, shape: Vec<usize>) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub(crate) fn dims(&self) -> Vec<usize> {
        self.shape.clone().unwrap_or_default()
    }

    /// Apply the read rule of this parameter's kind to a backing value.
    pub(crate) fn read(&self, value: &Tensor) -> Result<Tensor> {
        match self.kind {
            NumericKind::Integer => Ok(value.round()?),
            NumericKind::Real => Ok(value.clone()),
        }
    }
}
