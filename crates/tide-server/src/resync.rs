use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tide_store::{StorageBackend, StoreError, StoreResult};
use tide_types::{Oid, Tid};

use crate::broadcast::InvalidationBroadcaster;

/// Limits beyond which a reconnecting client is told to drop its cache
/// instead of receiving a list of changed oids.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncPolicy {
    /// Most distinct oids an incremental reply may carry.
    pub max_changed_oids: usize,
    /// Most commits a client may have missed and still resync incrementally.
    pub max_tid_gap: u64,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            max_changed_oids: 1000,
            max_tid_gap: 10_000,
        }
    }
}

/// Why a client must discard its whole cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FullReason {
    /// The client claims a tid this server never committed.
    AheadOfServer,
    /// Too many commits since the client's watermark.
    TooOld,
    /// Neither the broadcaster nor the backend retains that far back.
    HistoryUnavailable,
    /// The change set is larger than an incremental reply may carry.
    TooManyChanges,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncOutcome {
    Incremental { current_tid: Tid, oids: Vec<Oid> },
    FullInvalidate { current_tid: Tid, reason: FullReason },
}

impl ResyncOutcome {
    pub fn current_tid(&self) -> Tid {
        match self {
            Self::Incremental { current_tid, .. } | Self::FullInvalidate { current_tid, .. } => {
                *current_tid
            }
        }
    }
}

/// Decide what a client that last saw `last_known` must invalidate.
///
/// Must run with commits excluded (see
/// `CommitCoordinator::read_consistent`) so `current_tid` and the change
/// set describe the same state.
pub fn plan_resync(
    last_known: Tid,
    backend: &dyn StorageBackend,
    broadcaster: &InvalidationBroadcaster,
    policy: &ResyncPolicy,
) -> StoreResult<ResyncOutcome> {
    let current_tid = backend.current_tid()?;
    let full = |reason| {
        debug!(%last_known, %current_tid, ?reason, "full invalidation required");
        Ok(ResyncOutcome::FullInvalidate {
            current_tid,
            reason,
        })
    };

    if last_known == current_tid {
        return Ok(ResyncOutcome::Incremental {
            current_tid,
            oids: Vec::new(),
        });
    }
    if last_known.is_after(&current_tid) {
        return full(FullReason::AheadOfServer);
    }
    if current_tid.distance_from(&last_known) > policy.max_tid_gap {
        return full(FullReason::TooOld);
    }

    let changes = match broadcaster.changes_since(last_known) {
        Some(changes) => changes,
        None => match backend.iterate_since(last_known) {
            Ok(changes) => changes,
            Err(StoreError::HistoryUnavailable { .. }) => {
                return full(FullReason::HistoryUnavailable)
            }
            Err(e) => return Err(e),
        },
    };

    let mut oids = BTreeSet::new();
    for invalidation in &changes {
        oids.extend(invalidation.oids.iter().copied());
        if oids.len() > policy.max_changed_oids {
            return full(FullReason::TooManyChanges);
        }
    }

    debug!(%last_known, %current_tid, oids = oids.len(), "incremental resync");
    Ok(ResyncOutcome::Incremental {
        current_tid,
        oids: oids.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tide_store::InMemoryBackend;
    use tide_types::Invalidation;

    fn commit(
        backend: &InMemoryBackend,
        broadcaster: &InvalidationBroadcaster,
        tid: u64,
        oids: &[u64],
    ) {
        let writes: Vec<(Oid, Vec<u8>)> = oids
            .iter()
            .map(|o| (Oid::new(*o), vec![tid as u8]))
            .collect();
        backend.store_batch(Tid::new(tid), &writes).unwrap();
        broadcaster.publish(
            &Invalidation::new(Tid::new(tid), oids.iter().map(|o| Oid::new(*o)).collect()),
            None,
        );
    }

    fn oids(list: &[u64]) -> Vec<Oid> {
        list.iter().map(|o| Oid::new(*o)).collect()
    }

    #[test]
    fn up_to_date_client_gets_empty_incremental() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(10, Tid::ZERO);
        commit(&backend, &b, 1, &[1]);
        let outcome = plan_resync(Tid::new(1), &backend, &b, &ResyncPolicy::default()).unwrap();
        assert_eq!(
            outcome,
            ResyncOutcome::Incremental {
                current_tid: Tid::new(1),
                oids: vec![]
            }
        );
    }

    #[test]
    fn changes_are_deduplicated_and_sorted() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(10, Tid::ZERO);
        commit(&backend, &b, 1, &[5]);
        commit(&backend, &b, 2, &[3, 5]);
        commit(&backend, &b, 3, &[9]);

        let outcome = plan_resync(Tid::new(1), &backend, &b, &ResyncPolicy::default()).unwrap();
        assert_eq!(
            outcome,
            ResyncOutcome::Incremental {
                current_tid: Tid::new(3),
                oids: oids(&[3, 5, 9])
            }
        );
    }

    #[test]
    fn client_ahead_of_server_is_fully_invalidated() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(10, Tid::ZERO);
        let outcome = plan_resync(Tid::new(4), &backend, &b, &ResyncPolicy::default()).unwrap();
        assert_eq!(
            outcome,
            ResyncOutcome::FullInvalidate {
                current_tid: Tid::ZERO,
                reason: FullReason::AheadOfServer
            }
        );
    }

    #[test]
    fn large_gap_is_fully_invalidated() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(10, Tid::ZERO);
        for t in 1..=5 {
            commit(&backend, &b, t, &[t]);
        }
        let policy = ResyncPolicy {
            max_tid_gap: 3,
            ..ResyncPolicy::default()
        };
        let outcome = plan_resync(Tid::new(1), &backend, &b, &policy).unwrap();
        assert!(matches!(
            outcome,
            ResyncOutcome::FullInvalidate { reason: FullReason::TooOld, .. }
        ));
        // A gap of exactly the limit is still incremental.
        let outcome = plan_resync(Tid::new(2), &backend, &b, &policy).unwrap();
        assert!(matches!(outcome, ResyncOutcome::Incremental { .. }));
    }

    #[test]
    fn too_many_changes_is_fully_invalidated() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(10, Tid::ZERO);
        commit(&backend, &b, 1, &[1, 2, 3]);
        let policy = ResyncPolicy {
            max_changed_oids: 2,
            ..ResyncPolicy::default()
        };
        let outcome = plan_resync(Tid::ZERO, &backend, &b, &policy).unwrap();
        assert!(matches!(
            outcome,
            ResyncOutcome::FullInvalidate { reason: FullReason::TooManyChanges, .. }
        ));
    }

    #[test]
    fn falls_back_to_backend_history() {
        let backend = InMemoryBackend::new();
        let b = InvalidationBroadcaster::new(1, Tid::ZERO);
        commit(&backend, &b, 1, &[1]);
        commit(&backend, &b, 2, &[2]);
        commit(&backend, &b, 3, &[3]);
        assert!(b.changes_since(Tid::new(1)).is_none());

        let outcome = plan_resync(Tid::new(1), &backend, &b, &ResyncPolicy::default()).unwrap();
        assert_eq!(outcome.current_tid(), Tid::new(3));
        assert_eq!(
            outcome,
            ResyncOutcome::Incremental {
                current_tid: Tid::new(3),
                oids: oids(&[2, 3])
            }
        );
    }

    #[test]
    fn missing_history_everywhere_is_fully_invalidated() {
        let backend = InMemoryBackend::with_history_limit(1);
        let b = InvalidationBroadcaster::new(0, Tid::ZERO);
        commit(&backend, &b, 1, &[1]);
        commit(&backend, &b, 2, &[2]);
        commit(&backend, &b, 3, &[3]);

        let outcome = plan_resync(Tid::new(1), &backend, &b, &ResyncPolicy::default()).unwrap();
        assert!(matches!(
            outcome,
            ResyncOutcome::FullInvalidate { reason: FullReason::HistoryUnavailable, .. }
        ));
    }
}
