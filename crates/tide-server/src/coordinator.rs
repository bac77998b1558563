use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tide_store::{StorageBackend, StoreResult};
use tide_types::{Invalidation, Oid, SessionId, Tid, TxId};

use crate::broadcast::InvalidationBroadcaster;
use crate::error::{CommitError, CommitResult};
use crate::lock::LockManager;

/// Tunables for the commit state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Check each write's basis against the store as soon as it is buffered,
    /// before the commit lock is held. Vote always re-checks.
    pub eager_conflict_detection: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            eager_conflict_detection: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Voted,
    Committed,
    Aborted,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Voted => "voted",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }
}

/// A buffered write: the new state, and the tid the client based it on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub oid: Oid,
    pub basis: Tid,
    pub state: Vec<u8>,
}

struct Transaction {
    session: SessionId,
    status: TxStatus,
    read_only: bool,
    writes: Vec<PendingWrite>,
    /// Oids already known to conflict; vote fails on them without locking.
    doomed: Vec<Oid>,
}

impl Transaction {
    fn expect_pending(&self, tx: TxId, operation: &'static str) -> CommitResult<()> {
        match self.status {
            TxStatus::Pending => Ok(()),
            TxStatus::Aborted => Err(CommitError::Aborted(tx)),
            status => Err(CommitError::InvalidState {
                tx,
                status: status.as_str(),
                operation,
            }),
        }
    }

    /// Buffer a write; a second write to the same oid replaces the first in
    /// place.
    fn buffer(&mut self, write: PendingWrite) {
        match self.writes.iter_mut().find(|w| w.oid == write.oid) {
            Some(existing) => *existing = write,
            None => self.writes.push(write),
        }
    }

    fn mark_aborted(&mut self) -> bool {
        match self.status {
            TxStatus::Pending | TxStatus::Voted => {
                self.status = TxStatus::Aborted;
                self.writes.clear();
                self.doomed.clear();
                true
            }
            TxStatus::Committed | TxStatus::Aborted => false,
        }
    }
}

/// Commit/abort/conflict counters.
#[derive(Debug, Default)]
pub struct CommitStats {
    commits: AtomicU64,
    aborts: AtomicU64,
    conflicts: AtomicU64,
}

impl CommitStats {
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn aborts(&self) -> u64 {
        self.aborts.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

/// Two-phase commit coordinator for one store.
///
/// Drives every transaction through `begin → store* → vote → finish`, with
/// `abort` allowed at any point before finish:
///
/// - `store` buffers writes and, with eager detection, rejects writes whose
///   basis is already stale.
/// - `vote` takes the store's commit lock (waiting in FIFO order) and
///   re-checks every basis against the backend. Any mismatch aborts the
///   whole transaction.
/// - `finish` assigns the next tid, persists the batch, publishes the
///   invalidation, then releases the lock. Tid assignment, persistence and
///   publication all happen under the lock, so commits are totally ordered
///   and invalidations leave in that order.
///
/// Reads that must be ordered against commits (loads, resync replies) go
/// through [`read_consistent`](Self::read_consistent), which excludes the
/// persist-and-publish step of `finish`.
pub struct CommitCoordinator {
    backend: Arc<dyn StorageBackend>,
    lock: LockManager,
    broadcaster: Arc<InvalidationBroadcaster>,
    config: CoordinatorConfig,
    transactions: Mutex<HashMap<TxId, Transaction>>,
    next_tx: AtomicU64,
    last_tid: Mutex<Tid>,
    gate: RwLock<()>,
    stats: CommitStats,
}

impl CommitCoordinator {
    pub fn new(
        store: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        broadcaster: Arc<InvalidationBroadcaster>,
        config: CoordinatorConfig,
    ) -> StoreResult<Self> {
        let current = backend.current_tid()?;
        Ok(Self {
            backend,
            lock: LockManager::new(store),
            broadcaster,
            config,
            transactions: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
            last_tid: Mutex::new(current),
            gate: RwLock::new(()),
            stats: CommitStats::default(),
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub fn broadcaster(&self) -> &Arc<InvalidationBroadcaster> {
        &self.broadcaster
    }

    pub fn stats(&self) -> &CommitStats {
        &self.stats
    }

    fn allocate_tx(&self) -> TxId {
        TxId::new(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    fn with_tx<T>(
        &self,
        session: SessionId,
        tx: TxId,
        f: impl FnOnce(&mut Transaction) -> CommitResult<T>,
    ) -> CommitResult<T> {
        let mut txs = self.transactions.lock().expect("transaction table poisoned");
        match txs.get_mut(&tx) {
            Some(t) if t.session == session => f(t),
            _ => Err(CommitError::UnknownTransaction(tx)),
        }
    }

    /// Abort `tx` from inside the coordinator and give up its lock slot.
    fn abort_internal(&self, tx: TxId) {
        let transitioned = {
            let mut txs = self.transactions.lock().expect("transaction table poisoned");
            txs.get_mut(&tx).map(Transaction::mark_aborted).unwrap_or(false)
        };
        self.lock.cancel(tx);
        self.lock.release(tx);
        if transitioned {
            self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn fail_with_conflict(&self, tx: TxId, oids: Vec<Oid>) -> CommitError {
        self.abort_internal(tx);
        self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
        warn!(%tx, ?oids, "transaction failed with conflict");
        CommitError::Conflict { oids }
    }

    /// Start a transaction for `session`. Does not take the lock.
    pub fn begin(&self, session: SessionId, read_only: bool) -> TxId {
        let tx = self.allocate_tx();
        self.transactions
            .lock()
            .expect("transaction table poisoned")
            .insert(
                tx,
                Transaction {
                    session,
                    status: TxStatus::Pending,
                    read_only,
                    writes: Vec::new(),
                    doomed: Vec::new(),
                },
            );
        debug!(%session, %tx, "transaction begun");
        tx
    }

    /// Buffer a write of `state` to `oid`, based on the client's view `basis`.
    pub fn store(
        &self,
        session: SessionId,
        tx: TxId,
        oid: Oid,
        basis: Tid,
        state: Vec<u8>,
    ) -> CommitResult<()> {
        let read_only = self.with_tx(session, tx, |t| {
            t.expect_pending(tx, "store")?;
            Ok(t.read_only)
        })?;
        if read_only {
            return Err(CommitError::ReadOnly);
        }

        if self.config.eager_conflict_detection {
            let current = self.backend.tid_of(oid)?.unwrap_or(Tid::ZERO);
            if current != basis {
                self.with_tx(session, tx, |t| {
                    if !t.doomed.contains(&oid) {
                        t.doomed.push(oid);
                    }
                    Ok(())
                })?;
                debug!(%tx, %oid, %basis, %current, "stale basis rejected at store");
                return Err(CommitError::StaleBasis {
                    oid,
                    basis,
                    current,
                });
            }
        }

        self.with_tx(session, tx, |t| {
            t.expect_pending(tx, "store")?;
            t.buffer(PendingWrite { oid, basis, state });
            Ok(())
        })
    }

    /// Take the commit lock and validate every buffered write.
    ///
    /// Suspends while other transactions hold or wait for the lock. On
    /// success the transaction is `voted` and keeps the lock until finish or
    /// abort. On conflict the transaction is aborted and the lock released.
    pub async fn vote(&self, session: SessionId, tx: TxId) -> CommitResult<()> {
        let doomed = self.with_tx(session, tx, |t| {
            t.expect_pending(tx, "vote")?;
            Ok(t.doomed.clone())
        })?;
        if !doomed.is_empty() {
            return Err(self.fail_with_conflict(tx, doomed));
        }

        if self.lock.acquire(tx).await.is_err() {
            return Err(CommitError::Aborted(tx));
        }

        let bases = match self.with_tx(session, tx, |t| {
            t.expect_pending(tx, "vote")?;
            Ok(t.writes.iter().map(|w| (w.oid, w.basis)).collect::<Vec<_>>())
        }) {
            Ok(bases) => bases,
            Err(e) => {
                self.lock.release(tx);
                return Err(e);
            }
        };

        let mut conflicts = Vec::new();
        for (oid, basis) in bases {
            let current = match self.backend.tid_of(oid) {
                Ok(current) => current.unwrap_or(Tid::ZERO),
                Err(e) => {
                    self.abort_internal(tx);
                    return Err(e.into());
                }
            };
            if current != basis {
                conflicts.push(oid);
            }
        }
        if !conflicts.is_empty() {
            return Err(self.fail_with_conflict(tx, conflicts));
        }

        self.with_tx(session, tx, |t| {
            t.expect_pending(tx, "vote")?;
            t.status = TxStatus::Voted;
            Ok(())
        })?;
        debug!(%tx, "transaction voted");
        Ok(())
    }

    /// Commit a voted transaction and return its tid.
    pub fn finish(&self, session: SessionId, tx: TxId) -> CommitResult<Tid> {
        let writes = self.with_tx(session, tx, |t| match t.status {
            TxStatus::Voted => Ok(std::mem::take(&mut t.writes)),
            TxStatus::Aborted => Err(CommitError::Aborted(tx)),
            status => Err(CommitError::InvalidState {
                tx,
                status: status.as_str(),
                operation: "finish",
            }),
        })?;
        let count = writes.len();

        match self.persist(session, writes) {
            Ok(tid) => {
                self.transactions
                    .lock()
                    .expect("transaction table poisoned")
                    .remove(&tx);
                self.lock.release(tx);
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                info!(%session, %tx, %tid, objects = count, "transaction committed");
                Ok(tid)
            }
            Err(e) => {
                warn!(%tx, error = %e, "commit failed; aborting");
                self.abort_internal(tx);
                Err(e)
            }
        }
    }

    /// Assign a tid, write the batch, and publish the invalidation.
    fn persist(&self, session: SessionId, writes: Vec<PendingWrite>) -> CommitResult<Tid> {
        let _gate = self.gate.write().expect("commit gate poisoned");
        let mut last = self.last_tid.lock().expect("tid lock poisoned");
        let current = self.backend.current_tid()?;
        if writes.is_empty() {
            // Nothing to persist or announce.
            return Ok((*last).max(current));
        }

        let tid = last.later_than(&current);
        let oids: Vec<Oid> = writes.iter().map(|w| w.oid).collect();
        let batch: Vec<(Oid, Vec<u8>)> = writes.into_iter().map(|w| (w.oid, w.state)).collect();
        self.backend.store_batch(tid, &batch)?;
        *last = tid;

        self.broadcaster
            .publish(&Invalidation::new(tid, oids), Some(session));
        Ok(tid)
    }

    /// Abort `tx`. Calling it again on an aborted transaction is a no-op.
    pub fn abort(&self, session: SessionId, tx: TxId) -> CommitResult<()> {
        let transitioned = self.with_tx(session, tx, |t| match t.status {
            TxStatus::Committed => Err(CommitError::InvalidState {
                tx,
                status: "committed",
                operation: "abort",
            }),
            _ => Ok(t.mark_aborted()),
        })?;
        if transitioned {
            self.lock.cancel(tx);
            self.lock.release(tx);
            self.stats.aborts.fetch_add(1, Ordering::Relaxed);
            debug!(%session, %tx, "transaction aborted");
        }
        Ok(())
    }

    /// Abort every unresolved transaction of a closing session and forget
    /// all of its transactions. Returns how many were aborted.
    pub fn abort_session(&self, session: SessionId) -> usize {
        let open: Vec<TxId> = {
            let mut txs = self.transactions.lock().expect("transaction table poisoned");
            let mut open = Vec::new();
            txs.retain(|tx, t| {
                if t.session != session {
                    return true;
                }
                if t.mark_aborted() {
                    open.push(*tx);
                }
                false
            });
            open
        };
        for tx in &open {
            self.lock.cancel(*tx);
            self.lock.release(*tx);
            self.stats.aborts.fetch_add(1, Ordering::Relaxed);
        }
        if !open.is_empty() {
            info!(%session, aborted = open.len(), "aborted transactions of closed session");
        }
        open.len()
    }

    /// Current status of `tx`, if the coordinator still tracks it.
    pub fn status_of(&self, tx: TxId) -> Option<TxStatus> {
        self.transactions
            .lock()
            .expect("transaction table poisoned")
            .get(&tx)
            .map(|t| t.status)
    }

    /// Number of transactions that are pending or voted.
    pub fn active_transactions(&self) -> usize {
        self.transactions
            .lock()
            .expect("transaction table poisoned")
            .values()
            .filter(|t| matches!(t.status, TxStatus::Pending | TxStatus::Voted))
            .count()
    }

    /// Wait for any in-progress commit to finish, then report the current
    /// tid. For administrative tooling.
    pub async fn quiesce(&self) -> CommitResult<Tid> {
        let tx = self.allocate_tx();
        self.lock
            .acquire(tx)
            .await
            .map_err(|_| CommitError::Aborted(tx))?;
        let current = self.backend.current_tid();
        self.lock.release(tx);
        let current = current?;
        info!(tid = %current, "store quiesced");
        Ok(current)
    }

    /// Run `f` against the backend with no commit persisting or publishing
    /// concurrently.
    pub fn read_consistent<T>(&self, f: impl FnOnce(&dyn StorageBackend) -> T) -> T {
        let _gate = self.gate.read().expect("commit gate poisoned");
        f(self.backend.as_ref())
    }
}
