use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

use tide_types::TxId;

use crate::error::LockError;

/// Exclusive commit lock for one store, with a FIFO wait queue.
///
/// A transaction holds the lock from vote until finish or abort; while it
/// does, no other transaction can write to the store's backend. Waiters are
/// granted the lock strictly in arrival order.
///
/// Waiting is cancellable two ways: dropping the [`acquire`](Self::acquire)
/// future (the connection task went away), or calling
/// [`cancel`](Self::cancel) from another task (the transaction was aborted).
/// Either way the waiter leaves the queue without ever holding the lock.
pub struct LockManager {
    store: String,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
}

struct Holder {
    tx: TxId,
    since: Instant,
}

struct Waiter {
    tx: TxId,
    grant: oneshot::Sender<()>,
}

impl LockState {
    /// Hand the lock to the first waiter still listening, or clear it.
    fn grant_next(&mut self, store: &str) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.grant.send(()).is_ok() {
                debug!(store, tx = %waiter.tx, "commit lock handed over");
                self.holder = Some(Holder {
                    tx: waiter.tx,
                    since: Instant::now(),
                });
                return;
            }
        }
        self.holder = None;
    }

    fn remove_waiter(&mut self, tx: TxId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|w| w.tx != tx);
        self.queue.len() != before
    }
}

/// Cleans up after an `acquire` future that is dropped mid-wait.
struct PendingAcquire<'a> {
    manager: &'a LockManager,
    tx: TxId,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.manager.state.lock().expect("lock state poisoned");
        if state.holder.as_ref().map(|h| h.tx) == Some(self.tx) {
            // Granted after the waiting task stopped listening: pass it on.
            state.grant_next(&self.manager.store);
        } else {
            state.remove_waiter(self.tx);
        }
        debug!(store = %self.manager.store, tx = %self.tx, "abandoned lock wait");
    }
}

impl LockManager {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Name of the store this lock guards.
    pub fn store(&self) -> &str {
        &self.store
    }

    /// Wait until `tx` is the sole holder of the lock.
    ///
    /// Returns immediately if `tx` already holds it.
    pub async fn acquire(&self, tx: TxId) -> Result<(), LockError> {
        let granted = {
            let mut state = self.state.lock().expect("lock state poisoned");
            match state.holder.as_ref().map(|h| h.tx) {
                Some(holder) if holder == tx => return Ok(()),
                None if state.queue.is_empty() => {
                    state.holder = Some(Holder {
                        tx,
                        since: Instant::now(),
                    });
                    debug!(store = %self.store, %tx, "commit lock acquired");
                    return Ok(());
                }
                _ => {}
            }
            if state.queue.iter().any(|w| w.tx == tx) {
                return Err(LockError::AlreadyQueued(tx));
            }
            let (grant, granted) = oneshot::channel();
            state.queue.push_back(Waiter { tx, grant });
            debug!(
                store = %self.store,
                %tx,
                position = state.queue.len(),
                "waiting for commit lock"
            );
            granted
        };

        let mut pending = PendingAcquire {
            manager: self,
            tx,
            armed: true,
        };
        let outcome = granted.await;
        pending.armed = false;
        outcome.map_err(|_| LockError::Cancelled(tx))
    }

    /// Release the lock if `tx` holds it. Returns `true` if it did.
    pub fn release(&self, tx: TxId) -> bool {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.holder.as_ref().map(|h| h.tx) != Some(tx) {
            return false;
        }
        state.grant_next(&self.store);
        debug!(store = %self.store, %tx, "commit lock released");
        true
    }

    /// Remove `tx` from the wait queue. Its pending `acquire` fails with
    /// [`LockError::Cancelled`]. Returns `true` if it was queued.
    pub fn cancel(&self, tx: TxId) -> bool {
        self.state
            .lock()
            .expect("lock state poisoned")
            .remove_waiter(tx)
    }

    /// The transaction currently holding the lock.
    pub fn holder(&self) -> Option<TxId> {
        self.state
            .lock()
            .expect("lock state poisoned")
            .holder
            .as_ref()
            .map(|h| h.tx)
    }

    /// How long `tx` has held the lock; `None` unless it is the holder.
    pub fn held_for(&self, tx: TxId) -> Option<Duration> {
        self.state
            .lock()
            .expect("lock state poisoned")
            .holder
            .as_ref()
            .filter(|h| h.tx == tx)
            .map(|h| h.since.elapsed())
    }

    /// Number of transactions waiting.
    pub fn waiters(&self) -> usize {
        self.state.lock().expect("lock state poisoned").queue.len()
    }

    /// Returns `true` if `tx` is waiting in the queue.
    pub fn is_queued(&self, tx: TxId) -> bool {
        self.state
            .lock()
            .expect("lock state poisoned")
            .queue
            .iter()
            .any(|w| w.tx == tx)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.store)
            .field("holder", &self.holder())
            .field("waiters", &self.waiters())
            .finish()
    }
}
