use thiserror::Error;

use tide_types::{Oid, Tid, TxId};

/// Failures of the two-phase commit state machine.
///
/// `StaleBasis` and `Conflict` are returned to the client for an
/// application-level retry; the server never retries a transaction itself.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("stale basis for {oid}: written against {basis}, current is {current}")]
    StaleBasis { oid: Oid, basis: Tid, current: Tid },

    #[error("conflicting writes to {oids:?}")]
    Conflict { oids: Vec<Oid> },

    #[error("transaction {0} was aborted")]
    Aborted(TxId),

    #[error("unknown transaction {0}")]
    UnknownTransaction(TxId),

    #[error("transaction {tx} is {status}, cannot {operation}")]
    InvalidState {
        tx: TxId,
        status: &'static str,
        operation: &'static str,
    },

    #[error("session is read-only")]
    ReadOnly,

    #[error("store error: {0}")]
    Store(#[from] tide_store::StoreError),
}

pub type CommitResult<T> = Result<T, CommitError>;

/// Failures of the per-store commit lock.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock wait for {0} was cancelled")]
    Cancelled(TxId),

    #[error("{0} is already waiting for the lock")]
    AlreadyQueued(TxId),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] tide_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] tide_store::StoreError),

    #[error("commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
