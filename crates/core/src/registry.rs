//! Overrider construction from declarative specs.

use squeeze_common::OverriderSpec;

use crate::chain::ChainOverrider;
use crate::overrider::Overrider;
use crate::prune::ThresholdPruner;
use crate::quantize::FixedPointQuantizer;

/// Build a detached overrider from its config description.
pub fn build_overrider(spec: &OverriderSpec) -> Box<dyn Overrider> {
    match spec {
        OverriderSpec::Prune {
            alpha,
            scale,
            should_update,
        } => Box::new(ThresholdPruner::new(*alpha, *scale, *should_update)),
        OverriderSpec::FixedPoint {
            width,
            point,
            should_update,
        } => Box::new(FixedPointQuantizer::new(*width, *point, *should_update)),
        OverriderSpec::Chain {
            overriders,
            should_update,
        } => Box::new(ChainOverrider::new(
            overriders.iter().map(build_overrider).collect(),
            *should_update,
        )),
    }
}
