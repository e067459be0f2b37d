//! Interval triggers over a monotonically growing counter (usually epochs).

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct Change {
    next: HashMap<String, f64>,
}

impl Change {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `value` reaches the next multiple of `interval` tracked
    /// under `key`. The first boundary is `interval` itself; a non-positive
    /// interval never fires.
    pub fn every(&mut self, key: &str, value: f64, interval: f64) -> bool {
        if !(interval > 0.0) {
            return false;
        }
        let next = self.next.entry(key.to_string()).or_insert(interval);
        if value < *next {
            return false;
        }
        *next = ((value / interval).floor() + 1.0) * interval;
        true
    }

    /// Forget every boundary; used when the counter restarts from zero.
    pub fn reset(&mut self) {
        self.next.clear();
    }
}
