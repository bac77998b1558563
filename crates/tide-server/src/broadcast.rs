use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use tide_protocol::{Frame, Message};
use tide_types::{Invalidation, SessionId, Tid};

use crate::session::DisconnectSignal;

/// A registered session: where to push, and how to cut it off.
struct Subscriber {
    outbound: mpsc::Sender<Frame>,
    disconnect: DisconnectSignal,
}

/// Recent invalidations, oldest first.
struct History {
    entries: VecDeque<Invalidation>,
    /// Every commit at or before this tid has been evicted (or predates the
    /// broadcaster).
    floor: Tid,
}

/// Fan-out of commit invalidations to every connected session.
///
/// `publish` is only called by the commit coordinator while it holds the
/// store's commit lock, so invalidations are enqueued in commit order and
/// every session's outbound queue sees them in that order. Enqueueing never
/// blocks: a session whose queue is full is unregistered and told to
/// disconnect, and will resynchronize when it reconnects.
pub struct InvalidationBroadcaster {
    subscribers: RwLock<HashMap<SessionId, Subscriber>>,
    history: Mutex<History>,
    history_size: usize,
    sent: AtomicU64,
}

impl InvalidationBroadcaster {
    /// `start` is the store's current tid; history before it is not known.
    pub fn new(history_size: usize, start: Tid) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: Mutex::new(History {
                entries: VecDeque::with_capacity(history_size),
                floor: start,
            }),
            history_size,
            sent: AtomicU64::new(0),
        }
    }

    /// Start delivering invalidations to `session`.
    pub fn register(
        &self,
        session: SessionId,
        outbound: mpsc::Sender<Frame>,
        disconnect: DisconnectSignal,
    ) {
        self.subscribers
            .write()
            .expect("broadcaster lock poisoned")
            .insert(session, Subscriber { outbound, disconnect });
        debug!(%session, "session subscribed to invalidations");
    }

    /// Stop delivering to `session`. Returns `true` if it was registered.
    pub fn unregister(&self, session: SessionId) -> bool {
        self.subscribers
            .write()
            .expect("broadcaster lock poisoned")
            .remove(&session)
            .is_some()
    }

    /// Enqueue `invalidation` for every session except `origin`.
    pub fn publish(&self, invalidation: &Invalidation, origin: Option<SessionId>) {
        self.remember(invalidation);

        let mut subs = self.subscribers.write().expect("broadcaster lock poisoned");
        subs.retain(|session, sub| {
            if Some(*session) == origin {
                return true;
            }
            let frame = Frame::push(Message::Invalidate {
                tid: invalidation.tid,
                oids: invalidation.oids.clone(),
            });
            match sub.outbound.try_send(frame) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        %session,
                        tid = %invalidation.tid,
                        "outbound queue full; dropping session"
                    );
                    sub.disconnect.trigger();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        debug!(
            tid = %invalidation.tid,
            oids = invalidation.oids.len(),
            sessions = subs.len(),
            "invalidation published"
        );
    }

    fn remember(&self, invalidation: &Invalidation) {
        if self.history_size == 0 {
            let mut history = self.history.lock().expect("history lock poisoned");
            history.floor = invalidation.tid;
            return;
        }
        let mut history = self.history.lock().expect("history lock poisoned");
        history.entries.push_back(invalidation.clone());
        while history.entries.len() > self.history_size {
            if let Some(evicted) = history.entries.pop_front() {
                history.floor = evicted.tid;
            }
        }
    }

    /// Invalidations committed after `since`, if the retained history
    /// reaches back that far.
    pub fn changes_since(&self, since: Tid) -> Option<Vec<Invalidation>> {
        let history = self.history.lock().expect("history lock poisoned");
        if since.is_before(&history.floor) {
            return None;
        }
        Some(
            history
                .entries
                .iter()
                .filter(|inv| inv.tid.is_after(&since))
                .cloned()
                .collect(),
        )
    }

    /// Number of registered sessions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("broadcaster lock poisoned")
            .len()
    }

    /// Total invalidation messages enqueued so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
