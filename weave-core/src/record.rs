use std::cell::{Cell, RefCell};

use crate::id::CallbackId;

/// An opaque, platform-projected I/O handle.
///
/// The source event loop this workspace grows from accepts any OS
/// resource or socket-like object for `onReadable`/`onWritable`; here
/// that is modeled as a raw descriptor, the same projection the
/// teacher crate uses at its own backend boundary (`AsRawFd`/`RawFd`).
#[cfg(unix)]
pub type RawStream = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawStream = std::os::windows::io::RawSocket;

/// Arguments handed to a callback at invocation time, beyond its own id.
pub enum CallbackArgs {
    /// Deferred and timer callbacks take no extra argument.
    None,
    /// Readable/writable callbacks are passed the stream that is ready.
    Stream(RawStream),
    /// Signal callbacks are passed the delivered signal number.
    Signal(i32),
}

/// What a callback reported back to the driver.
///
/// `Void` is what every ergonomic registration (`defer`, `delay`, ...)
/// produces; `Invalid`/`Err` are reachable only through the `_raw`
/// registration family and are this crate's Rust binding of "a callback
/// that returned something other than nothing is an error" (§3.1 of
/// the expanded spec).
pub enum CallbackOutcome {
    Void,
    Invalid(String),
    Err(Box<dyn std::error::Error + Send + Sync>),
}

impl From<()> for CallbackOutcome {
    fn from(_: ()) -> Self {
        CallbackOutcome::Void
    }
}

pub type BoxedCallback = Box<dyn FnMut(CallbackId, CallbackArgs) -> CallbackOutcome>;

/// The variant-specific data of a [`CallbackRecord`].
pub enum CallbackKind {
    Deferred,
    Timer {
        interval: f64,
        expiration: Cell<f64>,
        repeat: bool,
        /// Tie-breaker for the timer heap; assigned once at creation and
        /// bumped on every re-arm so repeated firings keep a stable FIFO
        /// order among siblings with equal expiration.
        sequence: Cell<u64>,
    },
    StreamReadable {
        stream: RawStream,
    },
    StreamWritable {
        stream: RawStream,
    },
    Signal {
        signo: i32,
    },
}

impl CallbackKind {
    pub fn is_timer(&self) -> bool {
        matches!(self, CallbackKind::Timer { .. })
    }

    pub fn is_repeating_timer(&self) -> bool {
        matches!(self, CallbackKind::Timer { repeat: true, .. })
    }
}

/// One registration tracked by the driver.
///
/// Shared by `Rc` between the driver's canonical id→record table and
/// whatever backend-internal structures (read/write sets, the timer
/// heap, the signal map) currently hold it active; all mutable state
/// lives behind `Cell`/`RefCell` so every holder observes the same
/// single source of truth.
pub struct CallbackRecord {
    id: CallbackId,
    kind: RefCell<CallbackKind>,
    callable: RefCell<Option<BoxedCallback>>,
    enabled: Cell<bool>,
    referenced: Cell<bool>,
    invokable: Cell<bool>,
    cancelled: Cell<bool>,
    insertion_seq: u64,
}

impl CallbackRecord {
    pub fn new(
        id: CallbackId,
        kind: CallbackKind,
        callable: BoxedCallback,
        insertion_seq: u64,
    ) -> Self {
        Self {
            id,
            kind: RefCell::new(kind),
            callable: RefCell::new(Some(callable)),
            enabled: Cell::new(true),
            referenced: Cell::new(true),
            invokable: Cell::new(false),
            cancelled: Cell::new(false),
            insertion_seq,
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn insertion_seq(&self) -> u64 {
        self.insertion_seq
    }

    pub fn kind(&self) -> std::cell::Ref<'_, CallbackKind> {
        self.kind.borrow()
    }

    pub fn kind_mut(&self) -> std::cell::RefMut<'_, CallbackKind> {
        self.kind.borrow_mut()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.set(value);
    }

    pub fn referenced(&self) -> bool {
        self.referenced.get()
    }

    pub fn set_referenced(&self, value: bool) {
        self.referenced.set(value);
    }

    pub fn invokable(&self) -> bool {
        self.invokable.get()
    }

    pub fn set_invokable(&self, value: bool) {
        self.invokable.set(value);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn set_cancelled(&self, value: bool) {
        self.cancelled.set(value);
    }

    /// Whether this record, in its current state, keeps `run()` alive.
    pub fn keeps_loop_alive(&self) -> bool {
        self.enabled() && self.referenced() && !self.cancelled()
    }

    /// Take the callable out for the duration of invocation, so a
    /// reentrant call through the same id cannot double-borrow it.
    pub fn take_callable(&self) -> Option<BoxedCallback> {
        self.callable.borrow_mut().take()
    }

    /// Give the callable back after invocation (repeating timers, and
    /// any record that outlives a single firing, need it again).
    pub fn restore_callable(&self, callable: BoxedCallback) {
        *self.callable.borrow_mut() = Some(callable);
    }
}

impl std::fmt::Debug for CallbackRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRecord")
            .field("id", &self.id)
            .field("enabled", &self.enabled.get())
            .field("referenced", &self.referenced.get())
            .field("invokable", &self.invokable.get())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}
