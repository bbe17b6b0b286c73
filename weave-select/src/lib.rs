//! The always-available, dependency-light backend: `select(2)`/winsock
//! `select` depending on platform, plus the process-global self-pipe
//! signal plumbing `weave-native`'s backend shares with it on Unix.

mod backend;
/// Process-global signal arming/self-pipe plumbing, public so
/// `weave-native`'s `NativeBackend` can share the same process-wide
/// arming stack and OS handler installation rather than fighting over
/// `libc::signal` with its own, separate bookkeeping. Unix-only: POSIX
/// signal delivery has no Windows equivalent, so `SelectBackend` on
/// Windows reports `supports_signals() == false` instead.
#[cfg(unix)]
pub mod signal;

pub use backend::SelectBackend;
