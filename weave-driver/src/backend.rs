use std::rc::Rc;

use weave_core::{CallbackArgs, CallbackRecord, Result};

/// A pluggable reactor backend (§4.1/§6 of the expanded spec).
///
/// `SelectBackend` and `NativeBackend` are the two implementations in
/// this workspace; both live in their own crates so `weave-driver`
/// never depends on `libc` or `polling` directly.
pub trait Backend {
    /// An opaque handle to the backend's native loop object, if it has
    /// one worth exposing for interop (`getHandle()` in §4.1).
    type Handle;

    /// Monotonic clock reading in fractional seconds.
    fn now(&self) -> f64;

    /// Whether this backend can arm POSIX signal registrations.
    fn supports_signals(&self) -> bool;

    /// The next stable tie-break value for a timer record's
    /// `(expiration, insertion_sequence)` heap key (§4.2). Backends
    /// delegate to their own `TimerQueue::next_sequence`.
    fn next_timer_sequence(&mut self) -> u64;

    /// Register `record` for readiness/expiration tracking.
    fn activate(&mut self, record: &Rc<CallbackRecord>) -> Result<()>;

    /// Remove `record` from whatever internal set currently holds it.
    /// Must be a no-op if the backend never activated it (or already
    /// deactivated it).
    fn deactivate(&mut self, record: &Rc<CallbackRecord>);

    /// Run one blocking-or-not readiness pass and return every ready
    /// callback in the fixed order of §5: ready streams, then due
    /// timers, then delivered signals. The backend removes due/one-shot
    /// registrations from its own bookkeeping as it produces them but
    /// never invokes them itself or interprets a return value — that is
    /// the driver's `invoke_callback` pipeline, run after this call
    /// returns so the backend is never mutably reborrowed from inside a
    /// user callback.
    fn dispatch(&mut self, blocking: bool) -> Result<Vec<(Rc<CallbackRecord>, CallbackArgs)>>;

    /// The backend's native loop handle, if any.
    fn handle(&self) -> Option<Self::Handle>;

    /// Called once when this backend's driver enters `run()`. Backends
    /// that arm process-global signal state (§4.5/§9: only one loop
    /// instance at a time may have signal events armed) use this to
    /// disarm whichever loop was previously topmost and arm themselves.
    /// A no-op for backends without `supports_signals()`.
    fn on_loop_enter(&mut self) {}

    /// Called once when `run()` returns, mirroring [`on_loop_enter`].
    /// Restores whichever loop was armed before this one entered.
    ///
    /// [`on_loop_enter`]: Backend::on_loop_enter
    fn on_loop_exit(&mut self) {}
}
