//! `SelectBackend` has one implementation per platform's native readiness
//! primitive: `select(2)`'s `fd_set` on Unix, winsock's `select` (which
//! uses its own array-based `FD_SET` rather than a bitmask) on Windows.
//! Both are exposed under the same name and the same [`weave_driver::Backend`]
//! contract, so callers never match on platform themselves.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::SelectBackend;
#[cfg(windows)]
pub use windows::SelectBackend;
