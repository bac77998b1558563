use std::path::PathBuf;

use tide_types::Tid;

/// Errors from storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A batch was offered with a tid that does not advance the store.
    #[error("non-monotonic tid {offered}: store is already at {current}")]
    NonMonotonicTid { offered: Tid, current: Tid },

    /// History before `oldest` has been discarded; `iterate_since(requested)`
    /// cannot be answered.
    #[error("history since {requested} unavailable (oldest retained is {oldest})")]
    HistoryUnavailable { requested: Tid, oldest: Tid },

    /// A transaction batch contained no writes.
    #[error("empty transaction batch for tid {0}")]
    EmptyBatch(Tid),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A log record failed its integrity check.
    #[error("corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// The data file could not be opened.
    #[error("data file not accessible: {0}")]
    PathNotAccessible(PathBuf),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend opened read-only.
    #[error("store is read-only")]
    ReadOnly,
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
