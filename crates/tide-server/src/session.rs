use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use tide_types::{SessionId, Tid, TxId};

use crate::auth::Identity;

/// One-shot "close this connection" signal shared between a connection's
/// tasks and the broadcaster.
#[derive(Clone, Debug)]
pub struct DisconnectSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl DisconnectSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Ask every task of the connection to stop.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only ends on `true`.
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}

impl Default for DisconnectSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side state of one connected client.
///
/// Owned by the connection's tasks. The broadcaster never touches it; it only
/// holds the connection's outbound sender and [`DisconnectSignal`].
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: String,
    identity: Identity,
    read_only: bool,
    last_known_tid: AtomicU64,
    open_tx: Mutex<Option<TxId>>,
}

impl Session {
    pub fn new(peer: impl Into<String>, identity: Identity, read_only: bool, tid: Tid) -> Self {
        Self {
            id: SessionId::new(),
            peer: peer.into(),
            identity,
            read_only,
            last_known_tid: AtomicU64::new(tid.as_u64()),
            open_tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Newest tid this session is known to have caught up with.
    pub fn last_known_tid(&self) -> Tid {
        Tid::new(self.last_known_tid.load(Ordering::Acquire))
    }

    /// Advance the watermark; never moves it backwards.
    pub fn observe_tid(&self, tid: Tid) {
        self.last_known_tid
            .fetch_max(tid.as_u64(), Ordering::AcqRel);
    }

    /// The transaction this session has begun and not yet resolved.
    pub fn open_transaction(&self) -> Option<TxId> {
        *self.open_tx.lock().expect("session lock poisoned")
    }

    pub fn set_open_transaction(&self, tx: Option<TxId>) {
        *self.open_tx.lock().expect("session lock poisoned") = tx;
    }

    /// Forget `tx` if it is the open transaction.
    pub fn close_transaction(&self, tx: TxId) {
        let mut open = self.open_tx.lock().expect("session lock poisoned");
        if *open == Some(tx) {
            *open = None;
        }
    }
}
