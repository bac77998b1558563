use tide_types::{Invalidation, ObjectRecord, Oid, Tid};

use crate::error::StoreResult;

/// Durable, tid-versioned object storage.
///
/// This is the only surface the commit machinery depends on. All
/// implementations must satisfy these invariants:
/// - `store_batch` is only ever called by the transaction that holds the
///   store's commit lock; implementations need not serialize writers
///   themselves, but must stay safe for concurrent readers.
/// - Tids passed to `store_batch` strictly increase; a backend rejects a
///   tid that does not advance `current_tid()`.
/// - A batch is durable (per the backend's own guarantee) before
///   `store_batch` returns.
/// - `load` always returns the newest committed state of an object.
pub trait StorageBackend: Send + Sync {
    /// Short human-readable name, used in logs and status reports.
    fn name(&self) -> &str;

    /// Newest committed record for `oid`, or `Ok(None)` if the object has
    /// never been stored.
    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>>;

    /// Tid of the newest committed record for `oid`.
    ///
    /// Conflict checks call this for every buffered write. The default goes
    /// through `load`; backends with a separate index should override it.
    fn tid_of(&self, oid: Oid) -> StoreResult<Option<Tid>> {
        Ok(self.load(oid)?.map(|rec| rec.tid))
    }

    /// Persist every write of one transaction under `tid`.
    fn store_batch(&self, tid: Tid, writes: &[(Oid, Vec<u8>)]) -> StoreResult<()>;

    /// Tid of the last committed transaction (`Tid::ZERO` when empty).
    fn current_tid(&self) -> StoreResult<Tid>;

    /// Every committed transaction with a tid strictly after `since`, in
    /// commit order.
    ///
    /// Returns `StoreError::HistoryUnavailable` when `since` predates the
    /// retained history.
    fn iterate_since(&self, since: Tid) -> StoreResult<Vec<Invalidation>>;

    /// Allocate a fresh, never-used oid.
    fn new_oid(&self) -> StoreResult<Oid>;
}
