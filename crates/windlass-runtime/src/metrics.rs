//! Replay-aware metrics.
//!
//! Replaying a workflow re-executes its code; emitting metrics from those
//! re-runs would double-count every operation. The context suppresses
//! recording while the replay flag is set and emits through `tracing` so
//! the transport can scrape or forward.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

#[derive(Default)]
struct MetricsInner {
    replaying: bool,
    counters: HashMap<&'static str, u64>,
}

#[derive(Clone, Default)]
pub struct MetricsContext {
    inner: Rc<RefCell<MetricsInner>>,
}

impl MetricsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror of the coordinator's replay flag; counters freeze while set.
    pub fn set_replaying(&self, replaying: bool) {
        self.inner.borrow_mut().replaying = replaying;
    }

    pub fn counter(&self, name: &'static str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &'static str, delta: u64) {
        let mut inner = self.inner.borrow_mut();
        if inner.replaying {
            return;
        }
        let value = inner.counters.entry(name).or_insert(0);
        *value += delta;
        trace!(metric = name, value = *value, "metric");
    }

    pub fn get(&self, name: &'static str) -> u64 {
        self.inner.borrow().counters.get(name).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_suppresses_counts() {
        let metrics = MetricsContext::new();
        metrics.counter("workflow_task_completed");
        metrics.set_replaying(true);
        metrics.counter("workflow_task_completed");
        metrics.counter("workflow_task_completed");
        metrics.set_replaying(false);
        metrics.counter("workflow_task_completed");
        assert_eq!(metrics.get("workflow_task_completed"), 2);
    }
}
