use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use tide_types::{ObjectRecord, Oid, Tid};

use crate::error::CacheError;

/// Invalidation markers kept even when the cache itself is tiny.
const MIN_TOMBSTONES: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub corruptions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct Entry {
    state: Vec<u8>,
    tid: Tid,
    checksum: u32,
    tick: u64,
}

impl Entry {
    fn verify(&self, oid: Oid, watermark: Tid) -> Result<(), CacheError> {
        let computed = crc32fast::hash(&self.state);
        if computed != self.checksum {
            return Err(CacheError::ChecksumMismatch {
                oid,
                stored: self.checksum,
                computed,
            });
        }
        if self.tid.is_after(&watermark) {
            return Err(CacheError::FromTheFuture {
                oid,
                entry: self.tid,
                watermark,
            });
        }
        Ok(())
    }
}

/// Client-side cache of object states, bounded by entry count with LRU
/// eviction.
///
/// Entries carry a CRC32 of their state; an entry that fails verification
/// is dropped and reported as a miss. The cache also tracks `last_tid`, the
/// newest commit whose invalidations have been applied: no entry may be
/// newer than it.
///
/// Invalidated oids leave a short-lived marker so that a load reply already
/// in flight cannot put back a state older than the invalidation.
pub struct ObjectCache {
    capacity: usize,
    entries: HashMap<Oid, Entry>,
    recency: BTreeMap<u64, Oid>,
    tick: u64,
    last_tid: Tid,
    tombstones: HashMap<Oid, Tid>,
    tombstone_order: VecDeque<(Oid, Tid)>,
    stats: CacheStats,
}

impl ObjectCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            last_tid: Tid::ZERO,
            tombstones: HashMap::new(),
            tombstone_order: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.entries.contains_key(&oid)
    }

    /// Newest tid whose invalidations have been applied.
    pub fn last_tid(&self) -> Tid {
        self.last_tid
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, oid: Oid) -> Option<Entry> {
        let entry = self.entries.remove(&oid)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    /// Cached state of `oid`, if present and intact.
    pub fn get(&mut self, oid: Oid) -> Option<ObjectRecord> {
        let verdict = match self.entries.get(&oid) {
            Some(entry) => entry.verify(oid, self.last_tid),
            None => {
                self.stats.misses += 1;
                return None;
            }
        };
        if let Err(err) = verdict {
            warn!(%oid, error = %err, "discarding corrupt cache entry");
            self.remove(oid);
            self.stats.corruptions += 1;
            self.stats.misses += 1;
            return None;
        }

        let tick = self.next_tick();
        let entry = self.entries.get_mut(&oid)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, oid);
        self.stats.hits += 1;
        Some(ObjectRecord::new(oid, entry.tid, entry.state.clone()))
    }

    /// Cache `record`. Returns `false` if it was refused because the cache
    /// already knows of a newer state or invalidation for that object.
    pub fn insert(&mut self, record: ObjectRecord) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let oid = record.oid;
        if let Some(invalidated) = self.tombstones.get(&oid) {
            if record.tid.is_before(invalidated) {
                debug!(
                    %oid,
                    tid = %record.tid,
                    %invalidated,
                    "ignoring state older than invalidation"
                );
                return false;
            }
        }
        if let Some(existing) = self.entries.get(&oid) {
            if record.tid.is_before(&existing.tid) {
                return false;
            }
        }

        self.remove(oid);
        let tick = self.next_tick();
        self.entries.insert(
            oid,
            Entry {
                checksum: crc32fast::hash(&record.state),
                state: record.state,
                tid: record.tid,
                tick,
            },
        );
        self.recency.insert(tick, oid);

        while self.entries.len() > self.capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            self.stats.evictions += 1;
        }
        true
    }

    /// Drop every entry `tid` changed and move the watermark up to `tid`.
    pub fn apply_invalidation(&mut self, tid: Tid, oids: &[Oid]) {
        for oid in oids {
            self.remove(*oid);
            self.tombstones.insert(*oid, tid);
            self.tombstone_order.push_back((*oid, tid));
        }
        let limit = self.capacity.max(MIN_TOMBSTONES);
        while self.tombstone_order.len() > limit {
            if let Some((oid, tid)) = self.tombstone_order.pop_front() {
                if self.tombstones.get(&oid) == Some(&tid) {
                    self.tombstones.remove(&oid);
                }
            }
        }
        self.advance(tid);
        self.stats.invalidations += 1;
    }

    /// Drop the entries for `oids` and move the watermark up to `tid`,
    /// leaving no tombstones. For resync replies, which the server orders
    /// after every push and load reply that could race with them.
    pub fn discard(&mut self, tid: Tid, oids: &[Oid]) {
        for oid in oids {
            self.remove(*oid);
        }
        if !oids.is_empty() {
            self.stats.invalidations += 1;
        }
        self.advance(tid);
    }

    /// Move the watermark forward without touching entries.
    pub fn advance(&mut self, tid: Tid) {
        if tid.is_after(&self.last_tid) {
            self.last_tid = tid;
        }
    }

    /// Empty the cache and set the watermark to `tid`.
    pub fn clear(&mut self, tid: Tid) {
        let dropped = self.entries.len();
        self.entries.clear();
        self.recency.clear();
        self.tombstones.clear();
        self.tombstone_order.clear();
        self.last_tid = tid;
        debug!(dropped, %tid, "cache cleared");
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .field("last_tid", &self.last_tid)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(oid: u64, tid: u64, state: &[u8]) -> ObjectRecord {
        ObjectRecord::new(Oid::new(oid), Tid::new(tid), state.to_vec())
    }

    fn cache_at(capacity: usize, tid: u64) -> ObjectCache {
        let mut cache = ObjectCache::new(capacity);
        cache.advance(Tid::new(tid));
        cache
    }

    #[test]
    fn hit_and_miss() {
        let mut cache = cache_at(10, 5);
        assert!(cache.get(Oid::new(1)).is_none());
        assert!(cache.insert(rec(1, 3, b"abc")));
        let got = cache.get(Oid::new(1)).unwrap();
        assert_eq!(got.tid, Tid::new(3));
        assert_eq!(got.state, b"abc");

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn insert_never_regresses() {
        let mut cache = cache_at(10, 9);
        assert!(cache.insert(rec(1, 5, b"new")));
        assert!(!cache.insert(rec(1, 4, b"old")));
        assert_eq!(cache.get(Oid::new(1)).unwrap().state, b"new");
        assert!(cache.insert(rec(1, 7, b"newer")));
        assert_eq!(cache.get(Oid::new(1)).unwrap().tid, Tid::new(7));
    }

    #[test]
    fn invalidation_removes_and_blocks_late_replies() {
        let mut cache = cache_at(10, 4);
        cache.insert(rec(7, 4, b"v4"));
        cache.insert(rec(8, 2, b"other"));

        cache.apply_invalidation(Tid::new(5), &[Oid::new(7)]);
        assert!(!cache.contains(Oid::new(7)));
        assert!(cache.contains(Oid::new(8)));
        assert_eq!(cache.last_tid(), Tid::new(5));

        // A reply for a load sent before the invalidation arrives late.
        assert!(!cache.insert(rec(7, 4, b"v4")));
        assert!(cache.get(Oid::new(7)).is_none());
        assert!(cache.insert(rec(7, 5, b"v5")));
        assert_eq!(cache.get(Oid::new(7)).unwrap().state, b"v5");
    }

    #[test]
    fn discarded_objects_can_be_cached_again() {
        let mut cache = cache_at(8, 3);
        cache.insert(rec(2, 2, b"old"));
        cache.discard(Tid::new(9), &[Oid::new(2)]);
        assert!(!cache.contains(Oid::new(2)));
        assert_eq!(cache.last_tid(), Tid::new(9));

        // Last written at tid 5, well before the resync point.
        assert!(cache.insert(rec(2, 5, b"new")));
        assert_eq!(cache.get(Oid::new(2)).unwrap().state, b"new".to_vec());
    }

    #[test]
    fn watermark_never_regresses() {
        let mut cache = cache_at(10, 8);
        cache.apply_invalidation(Tid::new(6), &[Oid::new(1)]);
        assert_eq!(cache.last_tid(), Tid::new(8));
        cache.advance(Tid::new(2));
        assert_eq!(cache.last_tid(), Tid::new(8));
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut cache = cache_at(2, 10);
        cache.insert(rec(1, 1, b"a"));
        cache.insert(rec(2, 1, b"b"));
        cache.get(Oid::new(1));
        cache.insert(rec(3, 1, b"c"));

        assert!(cache.contains(Oid::new(1)));
        assert!(!cache.contains(Oid::new(2)));
        assert!(cache.contains(Oid::new(3)));
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let mut cache = cache_at(10, 3);
        cache.insert(rec(1, 3, b"payload"));
        if let Some(entry) = cache.entries.get_mut(&Oid::new(1)) {
            entry.state[0] ^= 0xff;
        }
        assert!(cache.get(Oid::new(1)).is_none());
        assert!(!cache.contains(Oid::new(1)));
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[test]
    fn entry_newer_than_watermark_is_discarded() {
        let mut cache = cache_at(10, 3);
        cache.insert(rec(1, 4, b"future"));
        assert!(cache.get(Oid::new(1)).is_none());
        assert_eq!(cache.stats().corruptions, 1);
    }

    #[test]
    fn clear_empties_and_resets_watermark() {
        let mut cache = cache_at(10, 40);
        cache.insert(rec(1, 3, b"x"));
        cache.apply_invalidation(Tid::new(41), &[Oid::new(2)]);
        cache.clear(Tid::new(40));
        assert!(cache.is_empty());
        assert_eq!(cache.last_tid(), Tid::new(40));
        // Markers are gone with the entries.
        assert!(cache.insert(rec(2, 40, b"y")));
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let mut cache = ObjectCache::new(0);
        assert!(!cache.insert(rec(1, 0, b"x")));
        assert!(cache.is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Insert { oid: u64, back: u64 },
        Invalidate { oids: Vec<u64> },
        Get { oid: u64 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..8, 0u64..5).prop_map(|(oid, back)| Op::Insert { oid, back }),
            prop::collection::vec(0u64..8, 1..4).prop_map(|oids| Op::Invalidate { oids }),
            (0u64..8).prop_map(|oid| Op::Get { oid }),
        ]
    }

    proptest! {
        #[test]
        fn never_serves_state_older_than_its_invalidation(
            ops in prop::collection::vec(op(), 1..200)
        ) {
            let mut cache = ObjectCache::new(4);
            let mut invalidated: HashMap<u64, u64> = HashMap::new();
            let mut current = 0u64;

            for op in ops {
                match op {
                    Op::Insert { oid, back } => {
                        let tid = current.saturating_sub(back);
                        cache.insert(rec(oid, tid, &tid.to_be_bytes()));
                    }
                    Op::Invalidate { oids } => {
                        current += 1;
                        let oids: Vec<Oid> = oids.iter().map(|o| Oid::new(*o)).collect();
                        cache.apply_invalidation(Tid::new(current), &oids);
                        for oid in &oids {
                            invalidated.insert(oid.as_u64(), current);
                        }
                    }
                    Op::Get { oid } => {
                        if let Some(record) = cache.get(Oid::new(oid)) {
                            let floor = invalidated.get(&oid).copied().unwrap_or(0);
                            prop_assert!(record.tid.as_u64() >= floor);
                            let expected = record.tid.as_u64().to_be_bytes().to_vec();
                            prop_assert_eq!(record.state, expected);
                        }
                    }
                }
                prop_assert!(cache.len() <= cache.capacity());
                prop_assert_eq!(cache.last_tid(), Tid::new(current));
            }
        }
    }
}
