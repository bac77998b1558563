use serde::{Deserialize, Serialize};
use tide_types::{ObjectRecord, Oid, SessionId, Tid, TxId};

use crate::auth::Credentials;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Limit on the first frame of a connection, read before the peer is known.
pub const MAX_HANDSHAKE_SIZE: usize = 64 * 1024;

/// Request id carried by unsolicited server pushes.
pub const PUSH_REQUEST_ID: u64 = 0;

/// A message plus the id that correlates a reply with its request.
///
/// Clients number requests from 1 upwards per connection; the server echoes
/// the id on the reply. Pushes carry [`PUSH_REQUEST_ID`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub request_id: u64,
    pub message: Message,
}

impl Frame {
    pub fn new(request_id: u64, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }

    pub fn push(message: Message) -> Self {
        Self::new(PUSH_REQUEST_ID, message)
    }

    pub fn is_push(&self) -> bool {
        self.request_id == PUSH_REQUEST_ID
    }
}

/// All message types in the Tide protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Handshake { version: u32, credentials: Credentials, read_only: bool },
    HandshakeAck { session: SessionId, store: String, current_tid: Tid },
    HandshakeRejected { reason: String },
    Begin,
    TxBegun { tx: TxId },
    Store { tx: TxId, oid: Oid, basis: Tid, state: Vec<u8> },
    Vote { tx: TxId },
    Finish { tx: TxId },
    Committed { tid: Tid },
    Abort { tx: TxId },
    Load { oid: Oid },
    Loaded { record: ObjectRecord },
    NewOids { count: u32 },
    Oids { oids: Vec<Oid> },
    Resync { last_known_tid: Tid },
    ResyncIncremental { current_tid: Tid, oids: Vec<Oid> },
    FullInvalidate { current_tid: Tid },
    Ping,
    Pong { current_tid: Tid },
    Status,
    StatusReport(ServerStatus),
    Quiesce,
    Quiesced { tid: Tid },
    Ok,
    Invalidate { tid: Tid, oids: Vec<Oid> },
    Error { code: ErrorCode, message: String, oids: Vec<Oid> },
}

/// Machine-readable error classes carried by [`Message::Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    StaleBasis,
    Conflict,
    Aborted,
    NotFound,
    ReadOnly,
    UnknownTransaction,
    InvalidState,
    Storage,
    Protocol,
}

/// Snapshot of server-side counters, returned for [`Message::Status`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub store: String,
    pub current_tid: Tid,
    pub sessions: usize,
    pub active_transactions: usize,
    pub lock_waiters: usize,
    pub commits: u64,
    pub aborts: u64,
    pub conflicts: u64,
    pub loads: u64,
    pub invalidations_sent: u64,
    /// Newest tid the requesting session has been told about.
    pub session_tid: Tid,
}

impl Message {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            oids: Vec::new(),
        }
    }

    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Handshake { .. } => 1,
            Self::HandshakeAck { .. } => 2,
            Self::HandshakeRejected { .. } => 3,
            Self::Begin => 4,
            Self::TxBegun { .. } => 5,
            Self::Store { .. } => 6,
            Self::Vote { .. } => 7,
            Self::Finish { .. } => 8,
            Self::Committed { .. } => 9,
            Self::Abort { .. } => 10,
            Self::Load { .. } => 11,
            Self::Loaded { .. } => 12,
            Self::NewOids { .. } => 13,
            Self::Oids { .. } => 14,
            Self::Resync { .. } => 15,
            Self::ResyncIncremental { .. } => 16,
            Self::FullInvalidate { .. } => 17,
            Self::Ping => 18,
            Self::Pong { .. } => 19,
            Self::Status => 20,
            Self::StatusReport(_) => 21,
            Self::Quiesce => 22,
            Self::Quiesced { .. } => 23,
            Self::Ok => 24,
            Self::Invalidate { .. } => 25,
            Self::Error { .. } => 255,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "Handshake",
            Self::HandshakeAck { .. } => "HandshakeAck",
            Self::HandshakeRejected { .. } => "HandshakeRejected",
            Self::Begin => "Begin",
            Self::TxBegun { .. } => "TxBegun",
            Self::Store { .. } => "Store",
            Self::Vote { .. } => "Vote",
            Self::Finish { .. } => "Finish",
            Self::Committed { .. } => "Committed",
            Self::Abort { .. } => "Abort",
            Self::Load { .. } => "Load",
            Self::Loaded { .. } => "Loaded",
            Self::NewOids { .. } => "NewOids",
            Self::Oids { .. } => "Oids",
            Self::Resync { .. } => "Resync",
            Self::ResyncIncremental { .. } => "ResyncIncremental",
            Self::FullInvalidate { .. } => "FullInvalidate",
            Self::Ping => "Ping",
            Self::Pong { .. } => "Pong",
            Self::Status => "Status",
            Self::StatusReport(_) => "StatusReport",
            Self::Quiesce => "Quiesce",
            Self::Quiesced { .. } => "Quiesced",
            Self::Ok => "Ok",
            Self::Invalidate { .. } => "Invalidate",
            Self::Error { .. } => "Error",
        }
    }

    /// Transaction commands must be handled in arrival order on a
    /// connection; everything else may be served concurrently.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            Self::Begin
                | Self::Store { .. }
                | Self::Vote { .. }
                | Self::Finish { .. }
                | Self::Abort { .. }
        )
    }
}
