use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

use weave_core::{
    BoxedCallback, CallbackArgs, CallbackId, CallbackKind, CallbackOutcome, CallbackRecord, IdGenerator,
    RawStream, Result, WeaveError,
};
use weave_fiber::SuspensionQueue;

use crate::backend::Backend;

#[derive(Debug)]
struct PanicPayload(String);

impl std::fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PanicPayload {}

fn panic_payload_to_error(payload: Box<dyn Any + Send>) -> Box<dyn std::error::Error + Send + Sync> {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callback panicked with a non-string payload".to_string()
    };
    Box::new(PanicPayload(message))
}

/// The backend-neutral reactor state machine (§4.1 of the expanded
/// spec). Owns every [`CallbackRecord`] by id, the pending-activation
/// set, the microtask queue, and the installed error handler; delegates
/// readiness/expiration tracking to `B`.
///
/// Registration and lifecycle methods (`defer`, `cancel`, `enable`, ...)
/// take `&mut self` and are meant to be called either before `run` or
/// reentrantly, through a `Rc<RefCell<Driver<B>>>` shared with running
/// callbacks — see [`Driver::run_shared`]. The loop itself is driven
/// through that shared handle rather than a plain `&mut self` call so a
/// callback can borrow the driver again (e.g. to cancel a sibling
/// registration) without the whole loop having to hold one long-lived
/// borrow across user code.
pub struct Driver<B: Backend> {
    backend: B,
    records: HashMap<CallbackId, Rc<CallbackRecord>>,
    pending_activation: Vec<Rc<CallbackRecord>>,
    microtasks: VecDeque<Box<dyn FnOnce()>>,
    error_handler: Option<Box<dyn FnMut(WeaveError)>>,
    id_gen: IdGenerator,
    next_insertion_seq: Cell<u64>,
    running: bool,
    stop_requested: bool,
    fatal: Option<WeaveError>,
    event_interval: usize,
}

impl<B: Backend> Driver<B> {
    pub fn new(backend: B, event_interval: usize, capacity: usize) -> Self {
        Self {
            backend,
            records: HashMap::with_capacity(capacity),
            pending_activation: Vec::with_capacity(capacity),
            microtasks: VecDeque::new(),
            error_handler: None,
            id_gen: IdGenerator::new(),
            next_insertion_seq: Cell::new(0),
            running: false,
            stop_requested: false,
            fatal: None,
            event_interval: event_interval.max(1),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    pub fn get_handle(&self) -> Option<B::Handle> {
        self.backend.handle()
    }

    pub fn set_error_handler(
        &mut self,
        handler: Option<Box<dyn FnMut(WeaveError)>>,
    ) -> Option<Box<dyn FnMut(WeaveError)>> {
        std::mem::replace(&mut self.error_handler, handler)
    }

    pub fn queue(&mut self, task: impl FnOnce() + 'static) {
        self.microtasks.push_back(Box::new(task));
    }

    // -- registration: raw family -------------------------------------

    pub fn defer_raw(
        &mut self,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> CallbackId {
        self.insert_record(CallbackKind::Deferred, Box::new(callback))
    }

    pub fn delay_raw(
        &mut self,
        seconds: f64,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> CallbackId {
        let sequence = self.backend.next_timer_sequence();
        let expiration = self.backend.now() + seconds;
        let kind = CallbackKind::Timer {
            interval: seconds,
            expiration: Cell::new(expiration),
            repeat: false,
            sequence: Cell::new(sequence),
        };
        self.insert_record(kind, Box::new(callback))
    }

    pub fn repeat_raw(
        &mut self,
        interval: f64,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> Result<CallbackId> {
        if interval <= 0.0 {
            return Err(WeaveError::LifecycleError(
                "repeat() interval must be greater than zero".into(),
            ));
        }
        let sequence = self.backend.next_timer_sequence();
        let expiration = self.backend.now() + interval;
        let kind = CallbackKind::Timer {
            interval,
            expiration: Cell::new(expiration),
            repeat: true,
            sequence: Cell::new(sequence),
        };
        Ok(self.insert_record(kind, Box::new(callback)))
    }

    pub fn on_readable_raw(
        &mut self,
        stream: RawStream,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> CallbackId {
        self.insert_record(CallbackKind::StreamReadable { stream }, Box::new(callback))
    }

    pub fn on_writable_raw(
        &mut self,
        stream: RawStream,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> CallbackId {
        self.insert_record(CallbackKind::StreamWritable { stream }, Box::new(callback))
    }

    pub fn on_signal_raw(
        &mut self,
        signo: i32,
        callback: impl FnMut(CallbackId, CallbackArgs) -> CallbackOutcome + 'static,
    ) -> Result<CallbackId> {
        if !self.backend.supports_signals() {
            return Err(WeaveError::UnsupportedFeature("signals".into()));
        }
        Ok(self.insert_record(CallbackKind::Signal { signo }, Box::new(callback)))
    }

    // -- registration: ergonomic family --------------------------------

    pub fn defer(&mut self, mut callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        self.defer_raw(move |id, _args| {
            callback(id);
            CallbackOutcome::Void
        })
    }

    pub fn delay(&mut self, seconds: f64, mut callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        self.delay_raw(seconds, move |id, _args| {
            callback(id);
            CallbackOutcome::Void
        })
    }

    pub fn repeat(
        &mut self,
        interval: f64,
        mut callback: impl FnMut(CallbackId) + 'static,
    ) -> Result<CallbackId> {
        self.repeat_raw(interval, move |id, _args| {
            callback(id);
            CallbackOutcome::Void
        })
    }

    pub fn on_readable(
        &mut self,
        stream: RawStream,
        mut callback: impl FnMut(CallbackId, RawStream) + 'static,
    ) -> CallbackId {
        self.on_readable_raw(stream, move |id, args| {
            if let CallbackArgs::Stream(stream) = args {
                callback(id, stream);
            }
            CallbackOutcome::Void
        })
    }

    pub fn on_writable(
        &mut self,
        stream: RawStream,
        mut callback: impl FnMut(CallbackId, RawStream) + 'static,
    ) -> CallbackId {
        self.on_writable_raw(stream, move |id, args| {
            if let CallbackArgs::Stream(stream) = args {
                callback(id, stream);
            }
            CallbackOutcome::Void
        })
    }

    pub fn on_signal(
        &mut self,
        signo: i32,
        mut callback: impl FnMut(CallbackId, i32) + 'static,
    ) -> Result<CallbackId> {
        self.on_signal_raw(signo, move |id, args| {
            if let CallbackArgs::Signal(signo) = args {
                callback(id, signo);
            }
            CallbackOutcome::Void
        })
    }

    // -- lifecycle ops on an existing id --------------------------------

    pub fn enable(&mut self, id: CallbackId) -> Result<CallbackId> {
        let record = self.lookup(id)?;
        if !record.enabled() {
            record.set_enabled(true);
            self.pending_activation.push(record);
        }
        Ok(id)
    }

    pub fn disable(&mut self, id: CallbackId) -> Result<CallbackId> {
        let record = self.lookup(id)?;
        if record.enabled() {
            record.set_enabled(false);
            self.backend.deactivate(&record);
            self.pending_activation.retain(|r| r.id() != id);
        }
        Ok(id)
    }

    pub fn reference(&mut self, id: CallbackId) -> Result<CallbackId> {
        let record = self.lookup(id)?;
        record.set_referenced(true);
        Ok(id)
    }

    pub fn unreference(&mut self, id: CallbackId) -> Result<CallbackId> {
        let record = self.lookup(id)?;
        record.set_referenced(false);
        Ok(id)
    }

    /// No-op on an unknown id, matching §4.1.
    pub fn cancel(&mut self, id: CallbackId) {
        if let Some(record) = self.records.remove(&id) {
            record.set_cancelled(true);
            self.backend.deactivate(&record);
            self.pending_activation.retain(|r| r.id() != id);
        }
    }

    /// Whether `id` currently refers to a live record, for diagnostic
    /// decorators (`TracingDriver::dump`) that need to tell a cancelled
    /// or auto-removed one-shot id apart from one still tracked.
    pub fn is_live(&self, id: CallbackId) -> bool {
        self.records.contains_key(&id)
    }

    fn lookup(&self, id: CallbackId) -> Result<Rc<CallbackRecord>> {
        self.records
            .get(&id)
            .cloned()
            .ok_or_else(|| WeaveError::invalid_callback(id))
    }

    fn insert_record(&mut self, kind: CallbackKind, callable: BoxedCallback) -> CallbackId {
        let id = self.id_gen.next();
        let seq = self.next_insertion_seq.get();
        self.next_insertion_seq.set(seq + 1);
        let record = Rc::new(CallbackRecord::new(id, kind, callable, seq));
        self.records.insert(id, record.clone());
        self.pending_activation.push(record);
        id
    }

    fn any_keeps_loop_alive(&self) -> bool {
        self.records.values().any(|r| r.keeps_loop_alive())
    }

    fn should_block(&self) -> bool {
        self.any_keeps_loop_alive() && self.microtasks.is_empty() && !self.stop_requested
    }

    /// Hands every pending-activation record to the backend, in
    /// insertion order, then clears the set. Never invokes user code
    /// itself, but returns any `Deferred` records encountered: those
    /// have no backend-tracked readiness to wait for (`activate` is a
    /// no-op for them) and are meant to run once in this very
    /// iteration, so the caller invokes them right after this pass.
    fn activation_pass(&mut self) -> Vec<Rc<CallbackRecord>> {
        let pending = std::mem::take(&mut self.pending_activation);
        let mut deferred_ready = Vec::new();
        for record in pending {
            if record.cancelled() || !record.enabled() {
                continue;
            }
            if matches!(*record.kind(), CallbackKind::Deferred) {
                deferred_ready.push(record);
                continue;
            }
            if let Err(err) = self.backend.activate(&record) {
                self.route_error(err);
            }
        }
        deferred_ready
    }

    fn rearm_repeating_timer(&mut self, record: &Rc<CallbackRecord>) {
        let next_sequence = self.backend.next_timer_sequence();
        let next_now = self.backend.now();
        if let CallbackKind::Timer {
            interval,
            expiration,
            sequence,
            ..
        } = &*record.kind()
        {
            expiration.set(next_now + *interval);
            sequence.set(next_sequence);
        }
        if let Err(err) = self.backend.activate(record) {
            self.route_error(err);
        }
    }

    fn route_error(&mut self, err: WeaveError) {
        if let Some(handler) = self.error_handler.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| handler(err))).is_err() {
                self.fatal = Some(WeaveError::LifecycleError(
                    "installed error handler panicked".into(),
                ));
                self.stop_requested = true;
            }
        } else {
            self.fatal = Some(err);
            self.stop_requested = true;
        }
    }

    // -- the loop itself, driven through a shared handle --------------

    /// Enters the loop. Fails with `LifecycleError` if already running.
    /// Returns once `stop()` was called or no enabled+referenced
    /// callback remains, or propagates the first error that escapes an
    /// unhandled callback when no error handler is installed.
    ///
    /// Takes `this` by shared handle, rather than `&mut self`, so the
    /// borrow the loop holds for each bookkeeping step can be dropped
    /// before a user callback runs — that callback (or a closure it
    /// schedules) may clone `this` and call back into the driver, e.g.
    /// to cancel a sibling registration (§4.4 step 5, scenario S3).
    pub fn run_shared(this: &Rc<RefCell<Self>>) -> Result<()> {
        weave_log::instrument!(weave_log::Level::DEBUG, "weave_driver::run");
        {
            let mut driver = this.borrow_mut();
            if driver.running {
                return Err(WeaveError::LifecycleError("run() was re-entered".into()));
            }
            driver.running = true;
            driver.stop_requested = false;
            driver.backend.on_loop_enter();
        }
        let result = Self::run_loop_shared(this);
        {
            let mut driver = this.borrow_mut();
            driver.backend.on_loop_exit();
            driver.running = false;
        }
        result
    }

    fn run_loop_shared(this: &Rc<RefCell<Self>>) -> Result<()> {
        loop {
            {
                let driver = this.borrow();
                if driver.stop_requested || !driver.any_keeps_loop_alive() {
                    return Ok(());
                }
            }
            Self::drain_microtasks_shared(this);
            if let Some(err) = this.borrow_mut().fatal.take() {
                return Err(err);
            }
            let deferred_ready = this.borrow_mut().activation_pass();
            for record in deferred_ready {
                if record.cancelled() {
                    continue;
                }
                Self::invoke_callback_shared(this, record, CallbackArgs::None);
            }
            if let Some(err) = this.borrow_mut().fatal.take() {
                return Err(err);
            }
            let blocking = this.borrow().should_block();
            if let Err(err) = Self::dispatch_shared(this, blocking) {
                this.borrow_mut().route_error(err);
            }
            if let Some(err) = this.borrow_mut().fatal.take() {
                return Err(err);
            }
        }
    }

    fn drain_microtasks_shared(this: &Rc<RefCell<Self>>) {
        let event_interval = this.borrow().event_interval;
        let mut drained = 0usize;
        loop {
            let task = this.borrow_mut().microtasks.pop_front();
            let Some(task) = task else { break };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                this.borrow_mut()
                    .route_error(WeaveError::UserCallbackError(panic_payload_to_error(panic)));
            }
            drained += 1;
            let empty = this.borrow().microtasks.is_empty();
            if drained >= event_interval && !empty {
                break;
            }
        }
    }

    fn dispatch_shared(this: &Rc<RefCell<Self>>, blocking: bool) -> Result<()> {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_driver::dispatch");
        let ready = this.borrow_mut().backend.dispatch(blocking)?;
        for (record, args) in ready {
            // Skip-if-removed-in-pass: an earlier callback in this same
            // batch may have cancelled this one (§4.4 step 5).
            if record.cancelled() {
                continue;
            }
            let is_repeating_timer = record.kind().is_repeating_timer();
            Self::invoke_callback_shared(this, record.clone(), args);
            if is_repeating_timer && record.enabled() && !record.cancelled() {
                this.borrow_mut().rearm_repeating_timer(&record);
            }
        }
        Ok(())
    }

    /// The invocation pipeline (§4.1 `invokeCallback`): pre-cancels
    /// one-shot registrations before running the body, catches panics,
    /// and routes a non-void `CallbackOutcome` to the error handler.
    /// Holds no borrow of `this` while `callable` itself runs.
    fn invoke_callback_shared(this: &Rc<RefCell<Self>>, record: Rc<CallbackRecord>, args: CallbackArgs) {
        weave_log::instrument!(weave_log::Level::TRACE, "weave_driver::invoke_callback");
        record.set_invokable(true);

        let is_one_shot = matches!(*record.kind(), CallbackKind::Deferred)
            || (record.kind().is_timer() && !record.kind().is_repeating_timer());
        if is_one_shot {
            this.borrow_mut().records.remove(&record.id());
            record.set_cancelled(true);
        }

        let Some(mut callable) = record.take_callable() else {
            record.set_invokable(false);
            return;
        };
        let id = record.id();
        let outcome = catch_unwind(AssertUnwindSafe(|| callable(id, args)));
        if !is_one_shot && !record.cancelled() {
            record.restore_callable(callable);
        }
        record.set_invokable(false);

        match outcome {
            Ok(CallbackOutcome::Void) => {}
            Ok(CallbackOutcome::Invalid(detail)) => {
                this.borrow_mut().route_error(WeaveError::invalid_return(id, detail));
            }
            Ok(CallbackOutcome::Err(err)) => {
                this.borrow_mut().route_error(WeaveError::UserCallbackError(err));
            }
            Err(panic) => {
                this.borrow_mut()
                    .route_error(WeaveError::UserCallbackError(panic_payload_to_error(panic)));
            }
        }
    }
}

impl<B: Backend> SuspensionQueue for Driver<B> {
    fn schedule(&mut self, task: Box<dyn FnOnce()>) {
        self.microtasks.push_back(task);
    }
}
