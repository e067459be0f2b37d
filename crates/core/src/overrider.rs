//! The overrider lifecycle.
//!
//! An overrider intercepts one trainable value of the graph and replaces it
//! by a transformed version (masked, quantised, ...). Its life:
//!
//! ```text
//!  unbound ──apply──► bound ──update──► updated
//!                       │                  │
//!                       └──── assign / reset / assign_parameters
//! ```
//!
//! Concrete overriders implement [`Overrider::transform`] and optionally
//! [`Overrider::refresh`]; all lifecycle logic is provided by the trait and
//! the shared [`OverriderCore`] state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use candle_core::{DType, Tensor};
use squeeze_common::RetrainConfig;

use crate::error::{OverrideError, Result};
use crate::parameter::Parameter;
use crate::runtime::{CellRequest, Getter, Runtime, StateCell};

// ── TrackingGetter ──────────────────────────────────────────────────────────

/// Getter wrapper recording every cell it hands out.
pub struct TrackingGetter<'a, G: Getter + ?Sized> {
    inner: &'a mut G,
    tracked: &'a mut BTreeMap<String, StateCell>,
}

impl<'a, G: Getter + ?Sized> TrackingGetter<'a, G> {
    pub fn new(inner: &'a mut G, tracked: &'a mut BTreeMap<String, StateCell>) -> Self {
        Self { inner, tracked }
    }
}

impl<G: Getter + ?Sized> Getter for TrackingGetter<'_, G> {
    fn get(&mut self, request: &CellRequest<'_>) -> Result<StateCell> {
        let cell = self.inner.get(request)?;
        self.tracked.insert(cell.name().to_string(), cell.clone());
        Ok(cell)
    }
}

// ── OverriderCore ───────────────────────────────────────────────────────────

/// State shared by every overrider kind.
#[derive(Debug, Clone)]
pub struct OverriderCore {
    name: Option<String>,
    applied: bool,
    should_update: bool,
    before: Option<Tensor>,
    after: Option<Tensor>,
    internals: BTreeMap<String, StateCell>,
    parameters: HashMap<String, StateCell>,
    pending: BTreeMap<String, f64>,
}

impl OverriderCore {
    pub fn new(should_update: bool) -> Self {
        Self {
            name: None,
            applied: false,
            should_update,
            before: None,
            after: None,
            internals: BTreeMap::new(),
            parameters: HashMap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn applied(&self) -> bool {
        self.applied
    }

    pub fn before(&self) -> Option<&Tensor> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Tensor> {
        self.after.as_ref()
    }

    /// Cells created while this overrider was applied, keyed by full name.
    pub fn internals(&self) -> &BTreeMap<String, StateCell> {
        &self.internals
    }

    /// Values staged by [`stage`](Self::stage) and not yet committed.
    pub fn pending(&self) -> &BTreeMap<String, f64> {
        &self.pending
    }

    /// `"{bound name}/{local}"`; fails before the first `apply`.
    pub fn scoped(&self, local: &str) -> Result<String> {
        match &self.name {
            Some(name) => Ok(format!("{name}/{local}")),
            None => Err(OverrideError::NotApplied(format!("<unbound>/{local}"))),
        }
    }

    /// Tracked cell with the given local name.
    pub fn internal(&self, local: &str) -> Result<&StateCell> {
        let name = self.scoped(local)?;
        self.internals
            .get(&name)
            .ok_or(OverrideError::UnknownCell(name))
    }

    pub fn set_should_update(&mut self, should_update: bool) {
        self.should_update = should_update;
    }

    pub(crate) fn bind(&mut self, name: &str, value: &Tensor) {
        self.name = Some(name.to_string());
        self.before = Some(value.clone());
        self.applied = true;
    }

    // ── Parameters ──────────────────────────────────────────────────────────

    /// Read a parameter, materialising its cell through `getter` on first use.
    ///
    /// Later reads return the same cached cell. Integer parameters are rounded.
    pub fn parameter(&mut self, getter: &mut dyn Getter, param: &Parameter) -> Result<Tensor> {
        if let Some(cell) = self.parameters.get(&param.name) {
            return param.read(cell.as_tensor());
        }
        let name = self.scoped(&param.name)?;
        let request = CellRequest {
            name: &name,
            shape: param.dims(),
            init: candle_nn::Init::Const(param.initial),
            trainable: param.trainable,
        };
        let cell = getter.get(&request)?;
        let value = param.read(cell.as_tensor())?;
        self.parameters.insert(param.name.clone(), cell);
        Ok(value)
    }

    /// Scalar read of a parameter, materialising it on first use.
    pub fn parameter_scalar(&mut self, getter: &mut dyn Getter, param: &Parameter) -> Result<f64> {
        let value = self.parameter(getter, param)?;
        Ok(value.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    /// Backing cell of an already materialised parameter.
    pub fn parameter_cell(&self, param: &Parameter) -> Result<&StateCell> {
        self.parameters
            .get(&param.name)
            .ok_or_else(|| OverrideError::GetterOutsideApply(param.name.clone()))
    }

    /// Read an already materialised parameter without a getter.
    pub fn parameter_value(&self, param: &Parameter) -> Result<Tensor> {
        param.read(self.parameter_cell(param)?.as_tensor())
    }

    /// Stage a new value for `param`; nothing changes until
    /// [`commit_parameters`](Self::commit_parameters).
    pub fn stage(&mut self, param: &Parameter, value: f64) {
        self.pending.insert(param.name.clone(), value);
    }

    /// Commit every staged value in one batch and clear the staging map.
    pub fn commit_parameters(&mut self, runtime: &Runtime) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for name in self.pending.keys() {
            if !self.parameters.contains_key(name) {
                return Err(OverrideError::UnknownParameter(name.clone()));
            }
        }
        for (name, value) in std::mem::take(&mut self.pending) {
            if let Some(cell) = self.parameters.get(&name) {
                runtime.assign_scalar(cell.name(), value)?;
                tracing::debug!(parameter = %cell.name(), value, "assigned parameter");
            }
        }
        Ok(())
    }
}

// ── Info ────────────────────────────────────────────────────────────────────

/// Human-readable description of an overrider and its current state.
#[derive(Debug, Clone, PartialEq)]
pub struct OverriderInfo {
    pub kind: String,
    pub name: Option<String>,
    pub fields: Vec<(String, String)>,
    pub children: Vec<OverriderInfo>,
}

impl OverriderInfo {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        write!(f, "{pad}{} {}", self.kind, self.name.as_deref().unwrap_or("<unbound>"))?;
        for (key, value) in &self.fields {
            write!(f, " {key}={value}")?;
        }
        for child in &self.children {
            writeln!(f)?;
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for OverriderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

// ── Overrider trait ─────────────────────────────────────────────────────────

/// A stateful transformation attached to one trainable value.
pub trait Overrider {
    /// Short kind name used in logs and info output.
    fn kind(&self) -> &'static str;

    fn core(&self) -> &OverriderCore;

    fn core_mut(&mut self) -> &mut OverriderCore;

    /// Produce the overridden value. Every cell must be obtained from `getter`.
    fn transform(&mut self, getter: &mut dyn Getter, value: &Tensor) -> Result<Tensor>;

    /// Kind-specific part of [`update`](Self::update).
    fn refresh(&mut self, _runtime: &Runtime) -> Result<()> {
        Ok(())
    }

    /// Extra key/value pairs reported by [`info`](Self::info).
    fn info_fields(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn name(&self) -> Option<&str> {
        self.core().name()
    }

    fn should_update(&self) -> bool {
        self.core().should_update
    }

    fn set_should_update(&mut self, should_update: bool) {
        self.core_mut().set_should_update(should_update);
    }

    /// Bind to `name`, transform `value` and return the overridden value.
    ///
    /// Cells created during the transform are tracked for `reset`. Applying
    /// again resolves to the same cells.
    fn apply(&mut self, getter: &mut dyn Getter, name: &str, value: &Tensor) -> Result<Tensor> {
        self.core_mut().bind(name, value);
        let mut internals = std::mem::take(&mut self.core_mut().internals);
        let result = {
            let mut tracking = TrackingGetter::new(getter, &mut internals);
            self.transform(&mut tracking, value)
        };
        self.core_mut().internals = internals;
        let after = result?;
        self.core_mut().after = Some(after.clone());
        Ok(after)
    }

    /// Recompute internal state from the current underlying value.
    fn update(&mut self, runtime: &Runtime) -> Result<()> {
        if !self.should_update() {
            return Ok(());
        }
        if !self.core().applied {
            return Err(OverrideError::NotApplied(self.describe()));
        }
        self.refresh(runtime)?;
        tracing::debug!(overrider = %self.info(), "updated");
        Ok(())
    }

    /// Commit the overridden value into the underlying value's cell.
    fn assign(&self, runtime: &Runtime) -> Result<()> {
        let core = self.core();
        match (&core.name, &core.after) {
            (Some(name), Some(after)) => runtime.assign(name, after),
            _ => Err(OverrideError::NotApplied(self.describe())),
        }
    }

    /// Restore every tracked cell to its initial value.
    fn reset(&mut self, runtime: &Runtime) -> Result<()> {
        for name in self.core().internals.keys() {
            runtime.reset(name)?;
        }
        Ok(())
    }

    /// Commit all staged parameter values.
    fn assign_parameters(&mut self, runtime: &Runtime) -> Result<()> {
        self.core_mut().commit_parameters(runtime)
    }

    fn describe(&self) -> String {
        format!(
            "<{} overrides {}>",
            self.kind(),
            self.name().unwrap_or("<unbound>")
        )
    }

    fn info(&self) -> OverriderInfo {
        OverriderInfo {
            kind: self.kind().to_string(),
            name: self.name().map(str::to_string),
            fields: self.info_fields(),
            children: Vec::new(),
        }
    }

    /// Threshold-search hooks, if this overrider is searchable.
    fn as_tunable(&self) -> Option<&dyn Tunable> {
        None
    }

    fn as_tunable_mut(&mut self) -> Option<&mut dyn Tunable> {
        None
    }
}

// ── Tunable ─────────────────────────────────────────────────────────────────

/// Hooks the retraining controller uses to tighten an overrider.
///
/// The threshold grows by `scale` per tightening step; an overshoot is undone
/// with `scale_roll_back` and the step shrunk with `scale_update`.
pub trait Tunable {
    /// One-time setup before the search starts.
    fn setup(&mut self, config: &RetrainConfig);

    /// Current mask; zero entries are compressed away.
    fn mask(&self) -> Result<Tensor>;

    fn threshold(&self) -> f64;

    fn scale(&self) -> f64;

    fn threshold_update(&mut self);

    fn scale_roll_back(&mut self);

    fn scale_update(&mut self, factor: f64);
}
