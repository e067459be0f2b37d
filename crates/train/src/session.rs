//! The seam between the retraining controller and whatever runs steps.

use squeeze_core::{Overrider, Runtime};

/// Result of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f64,
    pub accuracy: f64,
    /// Fractional epochs since the last `reset_num_epochs`.
    pub epoch: f64,
}

/// A training session the retrainer can drive.
pub trait TrainSession {
    /// Run one blocking training step.
    fn once(&mut self) -> anyhow::Result<StepOutcome>;

    /// Restart the fractional epoch counter from zero.
    fn reset_num_epochs(&mut self);

    fn overriders(&self) -> &[Box<dyn Overrider>];

    /// Overriders together with the runtime holding their cells.
    fn overriders_with_runtime(&mut self) -> (&Runtime, &mut [Box<dyn Overrider>]);

    fn save_checkpoint(&mut self, tag: &str) -> anyhow::Result<()>;

    fn load_checkpoint(&mut self, tag: &str) -> anyhow::Result<()>;

    fn checkpoint_exists(&self, tag: &str) -> bool;

    fn save_summary(&mut self, outcome: &StepOutcome) -> anyhow::Result<()>;

    fn overriders_update(&mut self) -> anyhow::Result<()> {
        let (runtime, overriders) = self.overriders_with_runtime();
        for o in overriders.iter_mut() {
            o.update(runtime)?;
        }
        Ok(())
    }

    fn overriders_assign(&mut self) -> anyhow::Result<()> {
        let (runtime, overriders) = self.overriders_with_runtime();
        for o in overriders.iter() {
            o.assign(runtime)?;
        }
        Ok(())
    }

    fn overriders_reset(&mut self) -> anyhow::Result<()> {
        let (runtime, overriders) = self.overriders_with_runtime();
        for o in overriders.iter_mut() {
            o.reset(runtime)?;
        }
        Ok(())
    }

    fn overriders_assign_parameters(&mut self) -> anyhow::Result<()> {
        let (runtime, overriders) = self.overriders_with_runtime();
        for o in overriders.iter_mut() {
            o.assign_parameters(runtime)?;
        }
        Ok(())
    }
}
