//! Execution runtime: named state cells backed by Candle `Var`s.
//!
//! Every trainable weight, bias and overrider-internal value (masks,
//! fixed-point parameters) lives in one [`Runtime`] as a [`StateCell`].
//! Cells are created through the [`Getter`] trait, which is get-or-create:
//! asking for an existing name returns a handle to the same cell. Handles are
//! cheap clones sharing storage, so a write through the runtime is visible to
//! every holder.
//!
//! A snapshot of all cells is written/read as safetensors; this is what
//! checkpoints store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Init;

use crate::error::{OverrideError, Result};

// ── StateCell ───────────────────────────────────────────────────────────────

/// A named, runtime-backed value together with its initial value.
#[derive(Debug, Clone)]
pub struct StateCell {
    name: String,
    var: Var,
    initial: Tensor,
    trainable: bool,
}

impl StateCell {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn as_tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Value the cell held when it was created.
    pub fn initial(&self) -> &Tensor {
        &self.initial
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Read a rank-0 cell as `f64`.
    pub fn scalar(&self) -> Result<f64> {
        Ok(self.var.as_tensor().to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    /// Overwrite the cell. The source is copied first so that a tensor
    /// sharing this cell's storage can be written back safely.
    fn set(&self, value: &Tensor) -> Result<()> {
        if value.dims() != self.dims() {
            return Err(OverrideError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        let value = value
            .detach()
            .to_dtype(self.var.dtype())?
            .to_device(self.var.device())?
            .copy()?;
        self.var.set(&value)?;
        Ok(())
    }
}

// ── Getter ──────────────────────────────────────────────────────────────────

/// Description of a state cell to fetch or create.
#[derive(Debug, Clone)]
pub struct CellRequest<'a> {
    pub name: &'a str,
    pub shape: Vec<usize>,
    pub init: Init,
    pub trainable: bool,
}

impl<'a> CellRequest<'a> {
    /// Non-trainable cell filled with `value`.
    pub fn constant(name: &'a str, shape: Vec<usize>, value: f64) -> Self {
        Self {
            name,
            shape,
            init: Init::Const(value),
            trainable: false,
        }
    }

    /// Trainable cell with an arbitrary initialiser.
    pub fn trainable(name: &'a str, shape: Vec<usize>, init: Init) -> Self {
        Self {
            name,
            shape,
            init,
            trainable: true,
        }
    }
}

/// Get-or-create access to state cells.
///
/// Overriders receive a `&mut dyn Getter` during `apply`; wrapping getters
/// (see [`TrackingGetter`](crate::overrider::TrackingGetter)) observe every
/// cell handed out.
pub trait Getter {
    fn get(&mut self, request: &CellRequest<'_>) -> Result<StateCell>;
}

// ── Runtime ─────────────────────────────────────────────────────────────────

/// Owner of every state cell on one device.
pub struct Runtime {
    device: Device,
    cells: BTreeMap<String, StateCell>,
}

impl Runtime {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            cells: BTreeMap::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    pub fn cell(&self, name: &str) -> Result<&StateCell> {
        self.cells
            .get(name)
            .ok_or_else(|| OverrideError::UnknownCell(name.to_string()))
    }

    /// All cells in name order.
    pub fn cells(&self) -> impl Iterator<Item = &StateCell> {
        self.cells.values()
    }

    /// Current value of a cell.
    pub fn value(&self, name: &str) -> Result<Tensor> {
        Ok(self.cell(name)?.as_tensor().clone())
    }

    /// Commit `value` into the named cell.
    pub fn assign(&self, name: &str, value: &Tensor) -> Result<()> {
        self.cell(name)?.set(value)
    }

    /// Fill the named cell with a constant.
    pub fn assign_scalar(&self, name: &str, value: f64) -> Result<()> {
        let cell = self.cell(name)?;
        let filled = Tensor::full(value, cell.dims(), &self.device)?;
        cell.set(&filled)
    }

    /// Restore the named cell to the value it was created with.
    pub fn reset(&self, name: &str) -> Result<()> {
        let cell = self.cell(name)?;
        cell.set(cell.initial())
    }

    /// Vars the optimiser should update.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.cells
            .values()
            .filter(|c| c.trainable)
            .map(|c| c.var.clone())
            .collect()
    }

    /// Total number of scalar values across all trainable cells.
    pub fn num_trainable_elements(&self) -> usize {
        self.cells
            .values()
            .filter(|c| c.trainable)
            .map(|c| c.as_tensor().elem_count())
            .sum()
    }

    // ── Snapshots ───────────────────────────────────────────────────────────

    /// Write every cell to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .cells
            .iter()
            .map(|(name, cell)| (name.clone(), cell.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Restore cells from a safetensors file; returns how many were restored.
    ///
    /// Cells absent from the file keep their current value.
    pub fn load(&self, path: &Path) -> Result<usize> {
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let mut restored = 0;
        for (name, cell) in &self.cells {
            match tensors.get(name) {
                Some(tensor) => {
                    cell.set(tensor)?;
                    restored += 1;
                }
                None => tracing::warn!(cell = %name, "cell missing from snapshot, keeping current value"),
            }
        }
        Ok(restored)
    }
}

impl Getter for Runtime {
    fn get(&mut self, request: &CellRequest<'_>) -> Result<StateCell> {
        if let Some(cell) = self.cells.get(request.name) {
            if cell.dims() != request.shape.as_slice() {
                return Err(OverrideError::ShapeMismatch {
                    name: request.name.to_string(),
                    expected: cell.dims().to_vec(),
                    actual: request.shape.clone(),
                });
            }
            return Ok(cell.clone());
        }
        let var = request
            .init
            .var(request.shape.clone(), DType::F32, &self.device)?;
        let initial = var.as_tensor().copy()?;
        let cell = StateCell {
            name: request.name.to_string(),
            var,
            initial,
            trainable: request.trainable,
        };
        tracing::debug!(cell = request.name, shape = ?request.shape, trainable = request.trainable, "created state cell");
        self.cells.insert(cell.name.clone(), cell.clone());
        Ok(cell)
    }
}

/// Number of exactly-zero elements in `t`.
pub fn count_zeros(t: &Tensor) -> Result<usize> {
    let zeros = t.eq(0f64)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(zeros as usize)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_is_get_or_create() {
        let mut rt = Runtime::new(Device::Cpu);
        let a = rt
            .get(&CellRequest::constant("fc/mask", vec![2, 3], 1.0))
            .unwrap();
        let b = rt
            .get(&CellRequest::constant("fc/mask", vec![2, 3], 5.0))
            .unwrap();
        assert_eq!(a.as_tensor().id(), b.as_tensor().id());
        assert_eq!(rt.cells().count(), 1);
        assert!(!a.trainable());
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut rt = Runtime::new(Device::Cpu);
        rt.get(&CellRequest::constant("w", vec![2], 0.0)).unwrap();
        let err = rt.get(&CellRequest::constant("w", vec![3], 0.0)).unwrap_err();
        assert!(matches!(err, OverrideError::ShapeMismatch { .. }));
    }

    #[test]
    fn assign_is_visible_through_handles_and_reset_restores() {
        let mut rt = Runtime::new(Device::Cpu);
        let cell = rt.get(&CellRequest::constant("p", vec![], 3.0)).unwrap();
        rt.assign_scalar("p", 7.0).unwrap();
        assert_eq!(cell.scalar().unwrap(), 7.0);
        rt.reset("p").unwrap();
        assert_eq!(cell.scalar().unwrap(), 3.0);
    }

    #[test]
    fn assign_from_own_storage() {
        let mut rt = Runtime::new(Device::Cpu);
        let cell = rt.get(&CellRequest::constant("p", vec![2], 2.0)).unwrap();
        let same = cell.as_tensor().clone();
        rt.assign("p", &same).unwrap();
        assert_eq!(cell.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn unknown_cell() {
        let rt = Runtime::new(Device::Cpu);
        assert!(matches!(rt.value("nope"), Err(OverrideError::UnknownCell(_))));
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.safetensors");
        let mut rt = Runtime::new(Device::Cpu);
        let w = rt
            .get(&CellRequest::trainable("w", vec![4], Init::Const(1.0)))
            .unwrap();
        rt.save(&path).unwrap();
        rt.assign_scalar("w", -2.0).unwrap();
        assert_eq!(rt.load(&path).unwrap(), 1);
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0; 4]);
        assert_eq!(rt.trainable_vars().len(), 1);
        assert_eq!(rt.num_trainable_elements(), 4);
    }

    #[test]
    fn zeros_counted() {
        let t = Tensor::new(&[0f32, 1.0, 0.0, 0.5], &Device::Cpu).unwrap();
        assert_eq!(count_zeros(&t).unwrap(), 2);
    }
}
