use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use tide_types::{Invalidation, ObjectRecord, Oid, Tid};

use crate::error::{StoreError, StoreResult};
use crate::traits::StorageBackend;

/// In-memory, HashMap-based backend.
///
/// Intended for tests and embedding. Only the newest record of each object
/// is kept. Transaction history can be bounded to simulate a packed store,
/// in which case `iterate_since` reports older watermarks as unavailable.
pub struct InMemoryBackend {
    name: String,
    history_limit: Option<usize>,
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    objects: HashMap<Oid, ObjectRecord>,
    history: VecDeque<Invalidation>,
    /// Everything at or before this tid has been dropped from `history`.
    history_floor: Tid,
    current: Tid,
    next_oid: Oid,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            name: "memory".into(),
            history_limit: None,
            inner: RwLock::new(MemoryState::default()),
        }
    }

    /// Keep at most `limit` transactions of history.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            history_limit: Some(limit),
            ..Self::new()
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.inner.read().expect("lock poisoned").objects.len()
    }

    /// Returns `true` if no object has been stored.
    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("lock poisoned").objects.is_empty()
    }

    /// Total bytes across all stored states.
    pub fn total_bytes(&self) -> u64 {
        self.inner
            .read()
            .expect("lock poisoned")
            .objects
            .values()
            .map(ObjectRecord::size)
            .sum()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, oid: Oid) -> StoreResult<Option<ObjectRecord>> {
        let state = self.inner.read().expect("lock poisoned");
        Ok(state.objects.get(&oid).cloned())
    }

    fn tid_of(&self, oid: Oid) -> StoreResult<Option<Tid>> {
        let state = self.inner.read().expect("lock poisoned");
        Ok(state.objects.get(&oid).map(|rec| rec.tid))
    }

    fn store_batch(&self, tid: Tid, writes: &[(Oid, Vec<u8>)]) -> StoreResult<()> {
        if writes.is_empty() {
            return Err(StoreError::EmptyBatch(tid));
        }
        let mut state = self.inner.write().expect("lock poisoned");
        if !tid.is_after(&state.current) {
            return Err(StoreError::NonMonotonicTid {
                offered: tid,
                current: state.current,
            });
        }
        let mut oids = Vec::with_capacity(writes.len());
        for (oid, data) in writes {
            state
                .objects
                .insert(*oid, ObjectRecord::new(*oid, tid, data.clone()));
            if *oid >= state.next_oid {
                state.next_oid = oid.next();
            }
            oids.push(*oid);
        }
        state.history.push_back(Invalidation::new(tid, oids));
        if let Some(limit) = self.history_limit {
            while state.history.len() > limit {
                if let Some(dropped) = state.history.pop_front() {
                    state.history_floor = dropped.tid;
                }
            }
        }
        state.current = tid;
        Ok(())
    }

    fn current_tid(&self) -> StoreResult<Tid> {
        Ok(self.inner.read().expect("lock poisoned").current)
    }

    fn iterate_since(&self, since: Tid) -> StoreResult<Vec<Invalidation>> {
        let state = self.inner.read().expect("lock poisoned");
        if since.is_before(&state.history_floor) {
            return Err(StoreError::HistoryUnavailable {
                requested: since,
                oldest: state.history_floor,
            });
        }
        Ok(state
            .history
            .iter()
            .filter(|inv| inv.tid.is_after(&since))
            .cloned()
            .collect())
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        let mut state = self.inner.write().expect("lock poisoned");
        let oid = state.next_oid;
        state.next_oid = oid.next();
        Ok(oid)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("object_count", &self.len())
            .field("history_limit", &self.history_limit)
            .finish()
    }
}
