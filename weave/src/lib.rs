//! `weave`: a single-threaded cooperative event-loop reactor.
//!
//! A [`Runtime`] schedules four kinds of work — deferred callbacks,
//! one-shot/periodic timers, stream readiness, and POSIX signals — and
//! lets fibers (stackful-coroutine-style contexts, see [`spawn_fiber`](Runtime::spawn_fiber))
//! suspend themselves mid-callback and resume later. It is the facade
//! over `weave-core`, `weave-driver`, `weave-select`, optionally
//! `weave-native`, `weave-fiber`, and `weave-tracing`; pulling in just
//! this crate (plus its `native`/`enable_log` features, if wanted) is
//! the only thing a consumer needs to do.
//!
//! ```no_run
//! let runtime = weave::Runtime::new().unwrap();
//! runtime.delay(0.5, |_id| println!("half a second later"));
//! runtime.run().unwrap();
//! ```

mod runtime;

pub use runtime::{BackendKind, Runtime, RuntimeBuilder};

pub use weave_core::{CallbackId, RawStream, Result, WeaveError};
pub use weave_fiber::{spawn, FiberHandle, Suspension, SuspensionHandle, SuspensionQueue};
pub use weave_tracing::TracingDriver;

/// Re-export the always-available `select(2)` backend, for callers who
/// want `weave_driver::Driver<SelectBackend>` directly rather than the
/// [`Runtime`] facade (e.g. to wrap it in a [`TracingDriver`]).
pub use weave_select::SelectBackend;
#[cfg(feature = "native")]
pub use weave_native::NativeBackend;
pub use weave_driver::{Backend, Driver, DriverBuilder};

/// Commonly imported items, in the style of `compio::prelude`.
pub mod prelude {
    pub use crate::{
        BackendKind, CallbackId, FiberHandle, Runtime, RuntimeBuilder, Suspension,
        SuspensionHandle, WeaveError,
    };
}
