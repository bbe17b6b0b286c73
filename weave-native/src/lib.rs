//! The `polling`-backed reactor backend (§4.5): real epoll/kqueue/IOCP
//! readiness instead of `select(2)`'s descriptor-count scan, behind the
//! identical `weave_driver::Backend` surface `SelectBackend` presents.

mod backend;

pub use backend::NativeBackend;
