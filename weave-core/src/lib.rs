//! Core, backend-neutral data model for the `weave` event loop.
//!
//! This crate owns the pieces the rest of the workspace builds on: the
//! monotonic [`Clock`], the [`CallbackId`]/[`CallbackRecord`] data
//! model, the [`TimerQueue`] priority queue, and the [`WeaveError`]
//! enum. It has no I/O and no threads of its own.

mod clock;
mod error;
mod id;
mod record;
mod timer_queue;

pub use clock::Clock;
pub use error::{Result, WeaveError};
pub use id::{CallbackId, IdGenerator};
pub use record::{BoxedCallback, CallbackArgs, CallbackKind, CallbackOutcome, CallbackRecord, RawStream};
pub use timer_queue::TimerQueue;
