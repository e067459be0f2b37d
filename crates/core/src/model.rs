//! Feed-forward classifier assembled from a [`ModelConfig`].
//!
//! Each layer owns two cells, `{layer}/weights` (`in × units`) and
//! `{layer}/biases` (`units`). A declared overrider replaces the cell's value
//! on every forward pass; the raw cell stays the trainable latent value.
//! Overriders are kept in one ordered list in declaration order.

use candle_core::{DType, Tensor};
use candle_nn::Init;
use squeeze_common::{Activation, ModelConfig};

use crate::error::Result;
use crate::overrider::Overrider;
use crate::registry::build_overrider;
use crate::runtime::{count_zeros, CellRequest, Getter, Runtime};

// ── Layer ───────────────────────────────────────────────────────────────────

struct Layer {
    weights: String,
    biases: String,
    inputs: usize,
    units: usize,
    activation: Activation,
    weights_overrider: Option<usize>,
    biases_overrider: Option<usize>,
}

impl Layer {
    /// Fetch one cell and pass it through its overrider, if any.
    fn value(
        runtime: &mut Runtime,
        overriders: &mut [Box<dyn Overrider>],
        request: CellRequest<'_>,
        overrider: Option<usize>,
    ) -> Result<Tensor> {
        let cell = runtime.get(&request)?;
        match overrider.and_then(|i| overriders.get_mut(i)) {
            Some(o) => o.apply(runtime, request.name, cell.as_tensor()),
            None => Ok(cell.as_tensor().clone()),
        }
    }
}

// ── Net ─────────────────────────────────────────────────────────────────────

pub struct Net {
    name: String,
    input_size: usize,
    layers: Vec<Layer>,
    overriders: Vec<Box<dyn Overrider>>,
}

impl Net {
    pub fn new(config: &ModelConfig, input_size: usize) -> Self {
        let mut layers = Vec::with_capacity(config.layers.len());
        let mut overriders: Vec<Box<dyn Overrider>> = Vec::new();
        let mut inputs = input_size;

        for spec in &config.layers {
            let mut attach = |spec: &Option<squeeze_common::OverriderSpec>| {
                spec.as_ref().map(|s| {
                    overriders.push(build_overrider(s));
                    overriders.len() - 1
                })
            };
            let weights_overrider = attach(&spec.overriders.weights);
            let biases_overrider = attach(&spec.overriders.biases);
            layers.push(Layer {
                weights: format!("{}/weights", spec.name),
                biases: format!("{}/biases", spec.name),
                inputs,
                units: spec.units,
                activation: spec.activation,
                weights_overrider,
                biases_overrider,
            });
            inputs = spec.units;
        }

        Self {
            name: config.name.clone(),
            input_size,
            layers,
            overriders,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(self.input_size, |l| l.units)
    }

    pub fn overriders(&self) -> &[Box<dyn Overrider>] {
        &self.overriders
    }

    pub fn overriders_mut(&mut self) -> &mut [Box<dyn Overrider>] {
        &mut self.overriders
    }

    /// Logits `[batch, output_size]` for inputs `[batch, input_size]`.
    pub fn forward(&mut self, runtime: &mut Runtime, x: &Tensor) -> Result<Tensor> {
        let Self {
            layers, overriders, ..
        } = self;
        let mut h = x.clone();
        for layer in layers.iter() {
            let stdev = (2.0 / layer.inputs.max(1) as f64).sqrt();
            let w = Layer::value(
                runtime,
                overriders.as_mut_slice(),
                CellRequest::trainable(
                    &layer.weights,
                    vec![layer.inputs, layer.units],
                    Init::Randn { mean: 0.0, stdev },
                ),
                layer.weights_overrider,
            )?;
            let b = Layer::value(
                runtime,
                overriders.as_mut_slice(),
                CellRequest::trainable(&layer.biases, vec![layer.units], Init::Const(0.0)),
                layer.biases_overrider,
            )?;
            h = h.matmul(&w)?.broadcast_add(&b)?;
            h = match layer.activation {
                Activation::Relu => h.relu()?,
                Activation::Tanh => h.tanh()?,
                Activation::Identity => h,
            };
        }
        Ok(h)
    }

    /// Create every cell and bind every overrider.
    pub fn materialize(&mut self, runtime: &mut Runtime) -> Result<()> {
        let x = Tensor::zeros((1, self.input_size), DType::F32, runtime.device())?;
        self.forward(runtime, &x)?;
        tracing::debug!(
            model = %self.name,
            layers = self.layers.len(),
            overriders = self.overriders.len(),
            "materialized graph"
        );
        Ok(())
    }
}

// ── Compression Stats ───────────────────────────────────────────────────────

/// Masked-element counts over every tunable overrider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompressionStats {
    pub layers: Vec<(String, usize, usize)>,
    pub total: usize,
    pub zeroed: usize,
}

impl CompressionStats {
    /// Fraction of masked elements kept.
    pub fn density(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        1.0 - self.zeroed as f64 / self.total as f64
    }
}

/// Collect `(name, zeroed, total)` for every applied tunable overrider.
pub fn compression_stats(overriders: &[Box<dyn Overrider>]) -> Result<CompressionStats> {
    let mut stats = CompressionStats::default();
    for o in overriders {
        let (Some(name), Some(tunable)) = (o.name(), o.as_tunable()) else {
            continue;
        };
        let mask = tunable.mask()?;
        let zeroed = count_zeros(&mask)?;
        let total = mask.elem_count();
        stats.zeroed += zeroed;
        stats.total += total;
        stats.layers.push((name.to_string(), zeroed, total));
    }
    Ok(stats)
}

// ── Tests ───────────────────────────────────────────────────────────────────
