use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Opaque, stable callback identifier.
///
/// Ids are monotonically increasing and never reused: once a record is
/// cancelled, its id is dead forever, even if a later registration would
/// otherwise have reused the counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw monotonic counter value, for backends that need a cheap
    /// hashable/sortable key distinct from the `Display` form.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Monotonic id generator, one per driver instance.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> CallbackId {
        CallbackId::from_raw(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
