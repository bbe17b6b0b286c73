use std::{cell::RefCell, io, rc::Rc};

use weave_core::{CallbackId, RawStream, Result, WeaveError};
use weave_driver::{Driver, DriverBuilder};
use weave_fiber::{Suspension, SuspensionHandle};
#[cfg(feature = "native")]
use weave_native::NativeBackend;
use weave_select::SelectBackend;

/// Which concrete [`weave_driver::Backend`] a [`Runtime`] drives.
///
/// `Select` is always available; `Native` only compiles in with this
/// crate's `native` feature, mirroring `weave-native`'s own optional
/// place in the workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    Select,
    #[cfg(feature = "native")]
    Native,
}

enum Inner {
    Select(Rc<RefCell<Driver<SelectBackend>>>),
    #[cfg(feature = "native")]
    Native(Rc<RefCell<Driver<NativeBackend>>>),
}

/// The facade over the reactor: a single-threaded cooperative event
/// loop with deferred work, timers, I/O readiness, and POSIX signals.
///
/// Cheap to clone — every clone shares the same underlying driver, the
/// same way `Rc<RefCell<Driver<B>>>` is shared with running callbacks
/// so they can reach back into the loop (§5).
pub struct Runtime {
    inner: Inner,
}

impl Runtime {
    /// Build a `Runtime` with default configuration on the `select(2)`
    /// backend.
    pub fn new() -> io::Result<Self> {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn defer(&self, callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().defer(callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().defer(callback),
        }
    }

    pub fn delay(&self, seconds: f64, callback: impl FnMut(CallbackId) + 'static) -> CallbackId {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().delay(seconds, callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().delay(seconds, callback),
        }
    }

    pub fn repeat(
        &self,
        interval: f64,
        callback: impl FnMut(CallbackId) + 'static,
    ) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().repeat(interval, callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().repeat(interval, callback),
        }
    }

    pub fn on_readable(
        &self,
        stream: RawStream,
        callback: impl FnMut(CallbackId, RawStream) + 'static,
    ) -> CallbackId {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().on_readable(stream, callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().on_readable(stream, callback),
        }
    }

    pub fn on_writable(
        &self,
        stream: RawStream,
        callback: impl FnMut(CallbackId, RawStream) + 'static,
    ) -> CallbackId {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().on_writable(stream, callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().on_writable(stream, callback),
        }
    }

    pub fn on_signal(
        &self,
        signo: i32,
        callback: impl FnMut(CallbackId, i32) + 'static,
    ) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().on_signal(signo, callback),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().on_signal(signo, callback),
        }
    }

    pub fn cancel(&self, id: CallbackId) {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().cancel(id),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().cancel(id),
        }
    }

    pub fn enable(&self, id: CallbackId) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().enable(id),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().enable(id),
        }
    }

    pub fn disable(&self, id: CallbackId) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().disable(id),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().disable(id),
        }
    }

    pub fn reference(&self, id: CallbackId) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().reference(id),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().reference(id),
        }
    }

    pub fn unreference(&self, id: CallbackId) -> Result<CallbackId> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().unreference(id),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().unreference(id),
        }
    }

    /// Queue a microtask, run to completion before the next dispatch.
    pub fn queue(&self, task: impl FnOnce() + 'static) {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().queue(task),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().queue(task),
        }
    }

    pub fn set_error_handler(&self, handler: Option<Box<dyn FnMut(WeaveError)>>) {
        match &self.inner {
            Inner::Select(driver) => {
                driver.borrow_mut().set_error_handler(handler);
            }
            #[cfg(feature = "native")]
            Inner::Native(driver) => {
                driver.borrow_mut().set_error_handler(handler);
            }
        }
    }

    pub fn stop(&self) {
        match &self.inner {
            Inner::Select(driver) => driver.borrow_mut().stop(),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow_mut().stop(),
        }
    }

    /// The backend's native wait handle (e.g. `NativeBackend`'s poller
    /// fd), for embedding this loop inside another one. `None` on
    /// `select(2)`, which has no such handle (§4.4).
    pub fn get_handle(&self) -> Option<RawStream> {
        match &self.inner {
            Inner::Select(driver) => driver.borrow().get_handle(),
            #[cfg(feature = "native")]
            Inner::Native(driver) => driver.borrow().get_handle(),
        }
    }

    /// Run the loop until no callback keeps it alive or `stop()` is
    /// called.
    pub fn run(&self) -> Result<()> {
        match &self.inner {
            Inner::Select(driver) => Driver::run_shared(driver),
            #[cfg(feature = "native")]
            Inner::Native(driver) => Driver::run_shared(driver),
        }
    }

    /// Spawn a fiber (§5.1) bound to this runtime. Blocks the calling
    /// thread until the fiber's body reaches its first `suspend()` or
    /// returns, exactly like [`weave_fiber::spawn`].
    pub fn spawn_fiber<R, F>(&self, body: F) -> SuspensionHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&Suspension) -> R + Send + 'static,
    {
        SuspensionHandle::new(Rc::new(weave_fiber::spawn(body)))
    }

    /// Queue a resume-with-`value` for `suspension` to run on the next
    /// microtask drain.
    pub fn resume<T, R>(&self, suspension: &SuspensionHandle<R>, value: T) -> Result<()>
    where
        T: Send + 'static,
        R: Send + 'static,
    {
        match &self.inner {
            Inner::Select(driver) => suspension.schedule_resume(value, &mut *driver.borrow_mut()),
            #[cfg(feature = "native")]
            Inner::Native(driver) => suspension.schedule_resume(value, &mut *driver.borrow_mut()),
        }
    }

    /// Queue a throw-with-`error` for `suspension` to run on the next
    /// microtask drain.
    pub fn throw<E, R>(&self, suspension: &SuspensionHandle<R>, error: E) -> Result<()>
    where
        E: std::error::Error + Send + Sync + 'static,
        R: Send + 'static,
    {
        match &self.inner {
            Inner::Select(driver) => suspension.schedule_throw(error, &mut *driver.borrow_mut()),
            #[cfg(feature = "native")]
            Inner::Native(driver) => suspension.schedule_throw(error, &mut *driver.borrow_mut()),
        }
    }
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            Inner::Select(driver) => Inner::Select(driver.clone()),
            #[cfg(feature = "native")]
            Inner::Native(driver) => Inner::Native(driver.clone()),
        };
        Self { inner }
    }
}

/// Chainable configuration for a [`Runtime`], in the style of
/// `compio_runtime::RuntimeBuilder` (§6.1).
#[derive(Debug, Clone)]
pub struct RuntimeBuilder {
    inner: DriverBuilder,
    backend: BackendKind,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            inner: DriverBuilder::new(),
            backend: BackendKind::default(),
        }
    }

    /// Initial reservation for the id→record table and the timer
    /// queue.
    pub fn capacity(&mut self, capacity: usize) -> &mut Self {
        self.inner.capacity(capacity);
        self
    }

    /// Upper bound on microtasks drained per outer loop iteration
    /// before a dispatch is forced.
    pub fn event_interval(&mut self, event_interval: usize) -> &mut Self {
        self.inner.event_interval(event_interval);
        self
    }

    pub fn backend(&mut self, backend: BackendKind) -> &mut Self {
        self.backend = backend;
        self
    }

    pub fn build(&self) -> io::Result<Runtime> {
        let inner = match self.backend {
            BackendKind::Select => Inner::Select(self.inner.build_shared(SelectBackend::new())),
            #[cfg(feature = "native")]
            BackendKind::Native => Inner::Native(self.inner.build_shared(NativeBackend::new()?)),
        };
        Ok(Runtime { inner })
    }
}
