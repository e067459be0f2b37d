//! Magnitude pruning with a searchable threshold.
//!
//! ```text
//! mask[i] = |w[i]| > alpha · std(w)
//! out     = w ⊙ mask
//! ```
//!
//! The mask lives in a tracked, non-trainable cell and only changes on
//! `update`; between updates the pruned entries stay pruned. `alpha` and
//! its step `scale` are host-side search state driven by the retrainer.

use candle_core::{DType, Tensor};
use squeeze_common::RetrainConfig;

use crate::error::{OverrideError, Result};
use crate::overrider::{Overrider, OverriderCore, Tunable};
use crate::runtime::{count_zeros, CellRequest, Getter, Runtime};

const MASK: &str = "mask";

pub struct ThresholdPruner {
    core: OverriderCore,
    alpha: f64,
    scale: f64,
}

impl ThresholdPruner {
    pub fn new(alpha: f64, scale: f64, should_update: bool) -> Self {
        Self {
            core: OverriderCore::new(should_update),
            alpha,
            scale,
        }
    }

    /// Fraction of entries the current mask keeps.
    pub fn density(&self) -> Result<f64> {
        let mask = self.mask()?;
        let total = mask.elem_count();
        if total == 0 {
            return Ok(1.0);
        }
        Ok(1.0 - count_zeros(&mask)? as f64 / total as f64)
    }
}

/// Population standard deviation over every element.
fn std_all(t: &Tensor) -> Result<f64> {
    let t = t.to_dtype(DType::F64)?.flatten_all()?;
    let mean = t.mean_all()?;
    let var = t.broadcast_sub(&mean)?.sqr()?.mean_all()?;
    Ok(var.to_scalar::<f64>()?.sqrt())
}

impl Overrider for ThresholdPruner {
    fn kind(&self) -> &'static str {
        "ThresholdPruner"
    }

    fn core(&self) -> &OverriderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OverriderCore {
        &mut self.core
    }

    fn transform(&mut self, getter: &mut dyn Getter, value: &Tensor) -> Result<Tensor> {
        let name = self.core.scoped(MASK)?;
        let mask = getter.get(&CellRequest::constant(&name, value.dims().to_vec(), 1.0))?;
        Ok(value.mul(mask.as_tensor())?)
    }

    fn refresh(&mut self, runtime: &Runtime) -> Result<()> {
        let before = self
            .core
            .before()
            .ok_or_else(|| OverrideError::NotApplied(self.describe()))?
            .detach();
        let threshold = self.alpha * std_all(&before)?;
        let mask = before.abs()?.gt(threshold)?.to_dtype(DType::F32)?;
        runtime.assign(self.core.internal(MASK)?.name(), &mask)
    }

    fn info_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("alpha".to_string(), format!("{:.4}", self.alpha)),
            ("scale".to_string(), format!("{:.4}", self.scale)),
        ];
        if let Ok(density) = self.density() {
            fields.push(("density".to_string(), format!("{density:.4}")));
        }
        fields
    }

    fn as_tunable(&self) -> Option<&dyn Tunable> {
        Some(self)
    }

    fn as_tunable_mut(&mut self) -> Option<&mut dyn Tunable> {
        Some(self)
    }
}

impl Tunable for ThresholdPruner {
    fn setup(&mut self, config: &RetrainConfig) {
        if let Some(scale) = config.init_scale {
            self.scale = scale;
        }
    }

    fn mask(&self) -> Result<Tensor> {
        Ok(self.core.internal(MASK)?.as_tensor().clone())
    }

    fn threshold(&self) -> f64 {
        self.alpha
    }

    fn scale(&self) -> f64 {
        self.scale
    }

    fn threshold_update(&mut self) {
        self.alpha += self.scale;
    }

    fn scale_roll_back(&mut self) {
        self.alpha -= self.scale;
    }

    fn scale_update(&mut self, factor: f64) {
        self.scale *= factor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn weights(rt: &mut Runtime) -> Tensor {
        let cell = rt
            .get(&CellRequest::trainable("fc/weights", vec![2, 3], candle_nn::Init::Const(0.0)))
            .unwrap();
        let w = Tensor::new(&[[0.1f32, -2.0, 0.05], [1.5, -0.2, 3.0]], &Device::Cpu).unwrap();
        rt.assign("fc/weights", &w).unwrap();
        cell.as_tensor().clone()
    }

    #[test]
    fn mask_starts_open() {
        let mut rt = Runtime::new(Device::Cpu);
        let w = weights(&mut rt);
        let mut p = ThresholdPruner::new(0.5, 0.1, true);
        let out = p.apply(&mut rt, "fc/weights", &w).unwrap();
        assert_eq!(out.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
        assert_eq!(p.density().unwrap(), 1.0);
        assert_eq!(rt.cell("fc/weights/mask").unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn update_prunes_small_weights() {
        let mut rt = Runtime::new(Device::Cpu);
        let w = weights(&mut rt);
        let mut p = ThresholdPruner::new(0.5, 0.1, true);
        assert!(matches!(p.update(&rt), Err(OverrideError::NotApplied(_))));
        p.apply(&mut rt, "fc/weights", &w).unwrap();
        p.update(&rt).unwrap();

        // std ≈ 1.54, threshold ≈ 0.77
        let mask = p.mask().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mask, vec![vec![0.0, 1.0, 0.0], vec![1.0, 0.0, 1.0]]);
        assert_eq!(count_zeros(&p.mask().unwrap()).unwrap(), 3);
        assert_eq!(p.density().unwrap(), 0.5);

        let out = p.apply(&mut rt, "fc/weights", &w).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, -2.0, 0.0], vec![1.5, 0.0, 3.0]]
        );

        p.reset(&rt).unwrap();
        assert_eq!(p.density().unwrap(), 1.0);
    }

    #[test]
    fn disabled_update_keeps_mask() {
        let mut rt = Runtime::new(Device::Cpu);
        let w = weights(&mut rt);
        let mut p = ThresholdPruner::new(0.5, 0.1, false);
        p.apply(&mut rt, "fc/weights", &w).unwrap();
        p.update(&rt).unwrap();
        assert_eq!(p.density().unwrap(), 1.0);
    }

    #[test]
    fn tunable_steps() {
        let mut p = ThresholdPruner::new(1.0, 0.4, true);
        p.threshold_update();
        assert!((p.threshold() - 1.4).abs() < 1e-12);
        p.scale_roll_back();
        p.scale_update(0.5);
        assert!((p.threshold() - 1.0).abs() < 1e-12);
        assert!((p.scale() - 0.2).abs() < 1e-12);

        p.setup(&RetrainConfig {
            iter_max_epoch: 1.0,
            min_scale: 0.01,
            scale_update_factor: 0.5,
            tolerance: 0.1,
            init_scale: Some(0.05),
        });
        assert_eq!(p.scale(), 0.05);
    }

    #[test]
    fn mask_needs_apply() {
        let p = ThresholdPruner::new(1.0, 0.4, true);
        assert!(p.mask().is_err());
        assert_eq!(p.info_fields().len(), 2);
    }
}
