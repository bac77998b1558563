use tracing::info;

use tide_protocol::Message;
use tide_types::{Oid, Tid};

use crate::cache::ObjectCache;
use crate::error::{ClientError, ClientResult};

/// What a reconnect did to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncReport {
    /// The listed objects changed while the client was away and were
    /// dropped from the cache.
    Incremental { current_tid: Tid, invalidated: Vec<Oid> },
    /// The whole cache was dropped.
    Full { current_tid: Tid },
}

impl ResyncReport {
    pub fn from_reply(reply: &Message) -> ClientResult<Self> {
        match reply {
            Message::ResyncIncremental { current_tid, oids } => Ok(Self::Incremental {
                current_tid: *current_tid,
                invalidated: oids.clone(),
            }),
            Message::FullInvalidate { current_tid } => Ok(Self::Full {
                current_tid: *current_tid,
            }),
            other => Err(ClientError::UnexpectedReply {
                expected: "ResyncIncremental",
                got: other.type_name(),
            }),
        }
    }

    pub fn current_tid(&self) -> Tid {
        match self {
            Self::Incremental { current_tid, .. } | Self::Full { current_tid } => *current_tid,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    /// Bring `cache` in line with the server as of `current_tid`.
    pub fn apply(&self, cache: &mut ObjectCache) {
        match self {
            Self::Incremental {
                current_tid,
                invalidated,
            } => {
                cache.discard(*current_tid, invalidated);
                info!(%current_tid, invalidated = invalidated.len(), "cache resynchronized");
            }
            Self::Full { current_tid } => {
                cache.clear(*current_tid);
                info!(%current_tid, "cache invalidated entirely");
            }
        }
    }
}
