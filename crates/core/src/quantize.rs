//! Dynamic fixed-point quantisation.
//!
//! A value is snapped to the signed grid of `width` bits with `point`
//! fractional bits:
//!
//! ```text
//! q = clamp(round(x · 2^point), -2^(width-1), 2^(width-1) - 1) / 2^point
//! ```
//!
//! Training goes through the straight-through estimator: the forward pass
//! sees `q`, the backward pass sees the identity.
//!
//! `width` and `point` are integer [`Parameter`]s backed by runtime cells.
//! `update` re-derives `point` from the current dynamic range so that the
//! largest magnitude still fits, and commits it through the staged
//! assignment path.

use candle_core::{DType, Result as CandleResult, Tensor};

use crate::error::{OverrideError, Result};
use crate::overrider::{Overrider, OverriderCore};
use crate::parameter::{NumericKind, Parameter};
use crate::runtime::{Getter, Runtime};

// ── STE primitive ───────────────────────────────────────────────────────────

/// Fixed-point rounding with a straight-through gradient.
///
/// The trick: `q.detach() + (x - x.detach())`. The residual is zero in the
/// forward pass; its gradient w.r.t. `x` is the identity.
pub fn quantize_fixed_point(x: &Tensor, width: u32, point: i32) -> CandleResult<Tensor> {
    let scale = 2f64.powi(point);
    let hi = 2f64.powi(width.max(1) as i32 - 1);
    let q = x
        .affine(scale, 0.0)?
        .round()?
        .clamp(-hi, hi - 1.0)?
        .affine(1.0 / scale, 0.0)?;
    let residual = (x - &x.detach())?;
    q.detach() + residual
}

/// Bits needed left of the binary point to hold `max_abs`.
fn integer_bits(max_abs: f64) -> i32 {
    if max_abs <= 0.0 || !max_abs.is_finite() {
        return 0;
    }
    (max_abs.log2().floor() as i32 + 1).max(0)
}

// ── FixedPointQuantizer ─────────────────────────────────────────────────────

pub struct FixedPointQuantizer {
    core: OverriderCore,
    width: Parameter,
    point: Parameter,
}

impl FixedPointQuantizer {
    pub fn new(width: u32, point: i32, should_update: bool) -> Self {
        Self {
            core: OverriderCore::new(should_update),
            width: Parameter::new("width", width as f64, NumericKind::Integer),
            point: Parameter::new("point", point as f64, NumericKind::Integer),
        }
    }

    fn read_int(&self, param: &Parameter) -> Result<i64> {
        let value = self.core.parameter_value(param)?;
        Ok(value.to_dtype(DType::F64)?.to_scalar::<f64>()? as i64)
    }
}

impl Overrider for FixedPointQuantizer {
    fn kind(&self) -> &'static str {
        "FixedPoint"
    }

    fn core(&self) -> &OverriderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OverriderCore {
        &mut self.core
    }

    fn transform(&mut self, getter: &mut dyn Getter, value: &Tensor) -> Result<Tensor> {
        let width = self.core.parameter_scalar(getter, &self.width)?;
        let point = self.core.parameter_scalar(getter, &self.point)?;
        Ok(quantize_fixed_point(value, width.max(1.0) as u32, point as i32)?)
    }

    fn refresh(&mut self, runtime: &Runtime) -> Result<()> {
        let before = self
            .core
            .before()
            .ok_or_else(|| OverrideError::NotApplied(self.describe()))?;
        let max_abs = before
            .detach()
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        let width = self.read_int(&self.width)?;
        let point = width - 1 - integer_bits(max_abs) as i64;
        let param = self.point.clone();
        self.core.stage(&param, point as f64);
        self.core.commit_parameters(runtime)
    }

    fn info_fields(&self) -> Vec<(String, String)> {
        [("width", &self.width), ("point", &self.point)]
            .into_iter()
            .filter_map(|(key, param)| {
                self.read_int(param)
                    .ok()
                    .map(|v| (key.to_string(), v.to_string()))
            })
            .collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
