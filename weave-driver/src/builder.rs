use std::{cell::RefCell, rc::Rc};

use crate::{backend::Backend, driver::Driver};

/// Chainable configuration for a [`Driver`], in the style of
/// `compio_runtime::RuntimeBuilder`/`ProactorBuilder` (§6.1).
#[derive(Debug, Clone)]
pub struct DriverBuilder {
    capacity: usize,
    event_interval: usize,
}

impl Default for DriverBuilder {
    fn default() -> Self {
        Self {
            capacity: 256,
            // Mirrors the teacher's own starvation-guard default for the
            // equivalent tunable.
            event_interval: 61,
        }
    }
}

impl DriverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial reservation for the id→record table and the
    /// pending-activation set.
    pub fn capacity(&mut self, capacity: usize) -> &mut Self {
        self.capacity = capacity;
        self
    }

    /// Upper bound on microtasks drained per outer loop iteration
    /// before a dispatch is forced (§6.1).
    pub fn event_interval(&mut self, event_interval: usize) -> &mut Self {
        self.event_interval = event_interval;
        self
    }

    pub fn build<B: Backend>(&self, backend: B) -> Driver<B> {
        Driver::new(backend, self.event_interval, self.capacity)
    }

    /// Build a driver already wrapped in the shared handle [`Driver::run_shared`]
    /// expects, for callers that want reentrant access from callbacks
    /// without a separate wrapping step.
    pub fn build_shared<B: Backend>(&self, backend: B) -> Rc<RefCell<Driver<B>>> {
        Rc::new(RefCell::new(self.build(backend)))
    }
}
