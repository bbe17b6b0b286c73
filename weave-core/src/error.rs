use std::io;

use crate::id::CallbackId;

/// The five error kinds of the reactor (spec §7), as one `thiserror`
/// enum, following the one-error-enum-per-concern convention the rest
/// of this crate family uses (`compio-quic`, `compio-h2`, `compio-net`).
#[derive(Debug, thiserror::Error)]
pub enum WeaveError {
    /// `id` does not refer to a live record, or a callback returned a
    /// non-empty value where one was expected.
    #[error("invalid callback {callback_id}: {detail}")]
    InvalidCallback {
        callback_id: CallbackId,
        detail: String,
        creation_trace: Option<String>,
        cancellation_trace: Option<String>,
    },

    /// A capability (e.g. signals) is not available on this backend or
    /// platform.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// An OS-level failure occurred while dispatching.
    #[error("backend error: {0}")]
    BackendError(#[from] io::Error),

    /// The backend's readiness set exceeded a hard platform limit (e.g.
    /// `select(2)`'s `FD_SETSIZE`).
    #[error(
        "descriptor {fd} exceeds the backend's limit of {limit} concurrently registered \
         descriptors; switch to a NativeBackend to lift this limit"
    )]
    FdLimitExceeded { limit: usize, fd: i32 },

    /// `run()` was re-entered, or a suspension was used incorrectly
    /// (double resume, suspend from the scheduler fiber, resume after
    /// completion).
    #[error("lifecycle error: {0}")]
    LifecycleError(String),

    /// An error escaped a user callback (including a caught panic).
    #[error("user callback error: {0}")]
    UserCallbackError(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl WeaveError {
    pub fn invalid_callback(callback_id: CallbackId) -> Self {
        Self::InvalidCallback {
            callback_id,
            detail: "no such callback".to_string(),
            creation_trace: None,
            cancellation_trace: None,
        }
    }

    pub fn invalid_return(callback_id: CallbackId, detail: String) -> Self {
        Self::InvalidCallback {
            callback_id,
            detail,
            creation_trace: None,
            cancellation_trace: None,
        }
    }

    pub fn with_traces(
        callback_id: CallbackId,
        detail: String,
        creation_trace: Option<String>,
        cancellation_trace: Option<String>,
    ) -> Self {
        Self::InvalidCallback {
            callback_id,
            detail,
            creation_trace,
            cancellation_trace,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeaveError>;
