//! Ordered composition of overriders.

use std::ops::Index;

use candle_core::Tensor;

use crate::error::Result;
use crate::overrider::{Overrider, OverriderCore, OverriderInfo, Tunable};
use crate::runtime::{Getter, Runtime};

/// Applies its children in order, each child's output feeding the next.
///
/// Child `i` binds to `"{name}/{i}"`, so cells of different children never
/// collide. Lifecycle operations visit children in the same order.
pub struct ChainOverrider {
    core: OverriderCore,
    overriders: Vec<Box<dyn Overrider>>,
}

impl ChainOverrider {
    pub fn new(overriders: Vec<Box<dyn Overrider>>, should_update: bool) -> Self {
        let mut chain = Self {
            core: OverriderCore::new(should_update),
            overriders,
        };
        chain.set_should_update(should_update);
        chain
    }

    pub fn len(&self) -> usize {
        self.overriders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overriders.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Overrider> {
        self.overriders.get(index).map(|o| o.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Overrider> {
        self.overriders.iter().map(|o| o.as_ref())
    }
}

impl Index<usize> for ChainOverrider {
    type Output = dyn Overrider;

    fn index(&self, index: usize) -> &Self::Output {
        self.overriders[index].as_ref()
    }
}

impl Overrider for ChainOverrider {
    fn kind(&self) -> &'static str {
        "Chain"
    }

    fn core(&self) -> &OverriderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut OverriderCore {
        &mut self.core
    }

    fn transform(&mut self, getter: &mut dyn Getter, value: &Tensor) -> Result<Tensor> {
        let prefix = self.core.scoped("")?;
        let mut value = value.clone();
        for (i, overrider) in self.overriders.iter_mut().enumerate() {
            value = overrider.apply(getter, &format!("{prefix}{i}"), &value)?;
        }
        Ok(value)
    }

    fn refresh(&mut self, runtime: &Runtime) -> Result<()> {
        for overrider in &mut self.overriders {
            overrider.update(runtime)?;
        }
        Ok(())
    }

    fn set_should_update(&mut self, should_update: bool) {
        self.core.set_should_update(should_update);
        for overrider in &mut self.overriders {
            overrider.set_should_update(should_update);
        }
    }

    fn reset(&mut self, runtime: &Runtime) -> Result<()> {
        for overrider in &mut self.overriders {
            overrider.reset(runtime)?;
        }
        Ok(())
    }

    fn assign_parameters(&mut self, runtime: &Runtime) -> Result<()> {
        self.core.commit_parameters(runtime)?;
        for overrider in &mut self.overriders {
            overrider.assign_parameters(runtime)?;
        }
        Ok(())
    }

    fn info(&self) -> OverriderInfo {
        OverriderInfo {
            kind: self.kind().to_string(),
            name: self.name().map(str::to_string),
            fields: vec![("len".to_string(), self.len().to_string())],
            children: self.overriders.iter().map(|o| o.info()).collect(),
        }
    }

    fn as_tunable(&self) -> Option<&dyn Tunable> {
        self.overriders.iter().find_map(|o| o.as_tunable())
    }

    fn as_tunable_mut(&mut self) -> Option<&mut dyn Tunable> {
        self.overriders.iter_mut().find_map(|o| o.as_tunable_mut())
    }
}
