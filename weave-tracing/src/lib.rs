//! `TracingDriver`, a transparent decorator over any [`Driver`] that
//! records where every callback was created and cancelled from (§4.6).
//!
//! Trace capture goes through `std::backtrace::Backtrace::capture()`,
//! which is itself gated by `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` — this
//! crate doesn't invent a second environment variable to control it.

use std::{
    backtrace::Backtrace,
    cell::RefCell,
    collections::HashMap,
    fmt::Write as _,
    rc::Rc,
};

use weave_core::{CallbackId, RawStream, Result, WeaveError};
use weave_driver::{Backend, Driver};

fn capture_trace() -> String {
    Backtrace::capture().to_string()
}

fn augment(err: WeaveError, traces: &TraceTables) -> WeaveError {
    match err {
        WeaveError::InvalidCallback {
            callback_id, detail, ..
        } => {
            let creation_trace = traces.creation.borrow().get(&callback_id).cloned();
            let cancellation_trace = traces.cancellation.borrow().get(&callback_id).cloned();
            WeaveError::with_traces(callback_id, detail, creation_trace, cancellation_trace)
        }
        other => other,
    }
}

struct TraceTables {
    creation: RefCell<HashMap<CallbackId, String>>,
    cancellation: RefCell<HashMap<CallbackId, String>>,
}

impl TraceTables {
    fn new() -> Self {
        Self {
            creation: RefCell::new(HashMap::new()),
            cancellation: RefCell::new(HashMap::new()),
        }
    }

    fn record_creation(&self, id: CallbackId) {
        self.creation.borrow_mut().insert(id, capture_trace());
    }

    fn record_cancellation(&self, id: CallbackId) {
        if self.creation.borrow().contains_key(&id) {
            self.cancellation.borrow_mut().insert(id, capture_trace());
        }
    }
}

/// Wraps a `Rc<RefCell<Driver<B>>>`, capturing a creation trace on every
/// registration and a cancellation trace on every `cancel`, and
/// augmenting `InvalidCallback` errors from `enable`/`reference` with
/// both. Every other operation passes straight through to the inner
/// driver.
pub struct TracingDriver<B: Backend> {
    inner: Rc<RefCell<Driver<B>>>,
    traces: Rc<TraceTables>,
}

impl<B: Backend> TracingDriver<B> {
    pub fn new(inner: Rc<RefCell<Driver<B>>>) -> Self {
        Self {
            inner,
            traces: Rc::new(TraceTables::new()),
        }
    }

    /// The wrapped driver's shared handle, for callers that need to run
    /// it directly (`Driver::run_shared`) or register raw callbacks this
    /// decorator doesn't wrap.
    pub fn inner(&self) -> &Rc<RefCell<Driver<B>>> {
        &self.inner
    }

    pub fn defer(&self, callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        let id = self.inner.borrow_mut().defer(callback);
        self.traces.record_creation(id);
        id
    }

    pub fn delay(&self, seconds: f64, callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        let id = self.inner.borrow_mut().delay(seconds, callback);
        self.traces.record_creation(id);
        id
    }

    pub fn repeat(&self, interval: f64, callback: impl FnMut(CallbackId) + 'static) -> Result<CallbackId> {
        let id = self.inner.borrow_mut().repeat(interval, callback)?;
        self.traces.record_creation(id);
        Ok(id)
    }

    pub fn on_readable(&self, stream: RawStream, callback: impl FnMut(CallbackId, RawStream) + 'static) -> CallbackId {
        let id = self.inner.borrow_mut().on_readable(stream, callback);
        self.traces.record_creation(id);
        id
    }

    pub fn on_writable(&self, stream: RawStream, callback: impl FnMut(CallbackId, RawStream) + 'static) -> CallbackId {
        let id = self.inner.borrow_mut().on_writable(stream, callback);
        self.traces.record_creation(id);
        id
    }

    pub fn on_signal(&self, signo: i32, callback: impl FnMut(CallbackId, i32) + 'static) -> Result<CallbackId> {
        let id = self.inner.borrow_mut().on_signal(signo, callback)?;
        self.traces.record_creation(id);
        Ok(id)
    }

    pub fn cancel(&self, id: CallbackId) {
        self.inner.borrow_mut().cancel(id);
        self.traces.record_cancellation(id);
    }

    pub fn enable(&self, id: CallbackId) -> Result<CallbackId> {
        self.inner.borrow_mut().enable(id).map_err(|err| augment(err, &self.traces))
    }

    pub fn disable(&self, id: CallbackId) -> Result<CallbackId> {
        self.inner.borrow_mut().disable(id)
    }

    pub fn reference(&self, id: CallbackId) -> Result<CallbackId> {
        self.inner.borrow_mut().reference(id).map_err(|err| augment(err, &self.traces))
    }

    pub fn unreference(&self, id: CallbackId) -> Result<CallbackId> {
        self.inner.borrow_mut().unreference(id)
    }

    pub fn stop(&self) {
        self.inner.borrow_mut().stop();
    }

    /// One block per live callback id: a `Callback identifier: <id>`
    /// line followed by its creation trace, blocks separated by a blank
    /// line. An id whose record has since been cancelled or otherwise
    /// removed from the driver is omitted, even though its trace is
    /// kept around for `enable`/`reference` error augmentation.
    pub fn dump(&self) -> String {
        let driver = self.inner.borrow();
        let creation = self.traces.creation.borrow();
        let mut ids: Vec<_> = creation.keys().copied().filter(|id| driver.is_live(*id)).collect();
        ids.sort();
        let mut out = String::new();
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "Callback identifier: {id}");
            out.push_str(&creation[id]);
            out.push('\n');
        }
        out
    }
}

impl<B: Backend> Clone for TracingDriver<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            traces: self.traces.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use weave_select::SelectBackend;

    use super::*;

    fn new_tracing_driver() -> TracingDriver<SelectBackend> {
        TracingDriver::new(weave_driver::DriverBuilder::new().build_shared(SelectBackend::new()))
    }

    #[test]
    fn s6_cancelled_id_fails_enable_with_both_traces() {
        let tracing = new_tracing_driver();
        let id = tracing.defer(|_| {});
        tracing.cancel(id);
        let err = tracing.enable(id).unwrap_err();
        match err {
            WeaveError::InvalidCallback {
                creation_trace,
                cancellation_trace,
                ..
            } => {
                assert!(creation_trace.is_some());
                assert!(cancellation_trace.is_some());
            }
            other => panic!("expected InvalidCallback, got {other:?}"),
        }
    }

    #[test]
    fn dump_contains_live_ids_and_omits_cancelled_ones() {
        let tracing = new_tracing_driver();
        let live = tracing.defer(|_| {});
        let cancelled = tracing.defer(|_| {});
        tracing.cancel(cancelled);
        let dump = tracing.dump();
        assert!(dump.contains(&live.to_string()));
        assert!(!dump.contains(&cancelled.to_string()));
    }

    #[test]
    fn unknown_id_still_reaches_enable_as_invalid_callback() {
        let tracing = new_tracing_driver();
        let bogus = weave_core::IdGenerator::new().next();
        let err = tracing.enable(bogus).unwrap_err();
        assert!(matches!(err, WeaveError::InvalidCallback { .. }));
    }
}
