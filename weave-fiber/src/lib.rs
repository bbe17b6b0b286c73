//! Stackful-coroutine emulation for `weave`.
//!
//! Rust has no stackful coroutines and no unsafe stack-switching crate
//! appears anywhere in this workspace's dependency tree, so a fiber is
//! emulated with a dedicated OS thread and a pair of zero-capacity
//! rendezvous channels acting as a baton: at any instant exactly one of
//! {scheduler, fiber} is ever actually running, the other blocked on a
//! channel recv. See `spawn` for the mechanics.

mod fiber;
mod suspension;

pub use fiber::{spawn, FiberHandle, Suspension};
pub use suspension::{SuspensionHandle, SuspensionQueue};
