use thiserror::Error;

use tide_protocol::{ErrorCode, ProtocolError};
use tide_types::Oid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("stale basis for {oids:?}: {message}")]
    StaleBasis { oids: Vec<Oid>, message: String },

    #[error("conflicting writes to {oids:?}")]
    Conflict { oids: Vec<Oid> },

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("object {0} not found")]
    NotFound(Oid),

    #[error("session is read-only")]
    ReadOnly,

    #[error("connection lost")]
    ConnectionLost,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("request timed out")]
    Timeout,

    #[error("transaction is {0}")]
    TransactionState(&'static str),

    #[error("server error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Build the error for a server `Error` reply.
    pub fn from_remote(code: ErrorCode, message: String, oids: Vec<Oid>) -> Self {
        match code {
            ErrorCode::StaleBasis => Self::StaleBasis { oids, message },
            ErrorCode::Conflict => Self::Conflict { oids },
            ErrorCode::Aborted => Self::Aborted(message),
            ErrorCode::NotFound => match oids.first() {
                Some(oid) => Self::NotFound(*oid),
                None => Self::Remote { code, message },
            },
            ErrorCode::ReadOnly => Self::ReadOnly,
            _ => Self::Remote { code, message },
        }
    }

    /// Whether re-reading and retrying the transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StaleBasis { .. } | Self::Conflict { .. })
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A cache entry that failed verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("checksum mismatch for {oid}: stored {stored:08x}, computed {computed:08x}")]
    ChecksumMismatch { oid: Oid, stored: u32, computed: u32 },

    #[error("entry for {oid} is newer ({entry}) than the cache watermark ({watermark})")]
    FromTheFuture {
        oid: Oid,
        entry: tide_types::Tid,
        watermark: tide_types::Tid,
    },
}
