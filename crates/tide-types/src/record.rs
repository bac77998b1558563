use serde::{Deserialize, Serialize};

use crate::id::Oid;
use crate::tid::Tid;

/// One version of an object: the state written by commit `tid`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub oid: Oid,
    pub tid: Tid,
    pub state: Vec<u8>,
}

impl ObjectRecord {
    pub fn new(oid: Oid, tid: Tid, state: impl Into<Vec<u8>>) -> Self {
        Self {
            oid,
            tid,
            state: state.into(),
        }
    }

    /// Size of the state in bytes.
    pub fn size(&self) -> u64 {
        self.state.len() as u64
    }
}

/// Notification that a commit changed a set of objects.
///
/// Also the unit the backend reports from `iterate_since`: one entry per
/// committed transaction, oids in the order the transaction stored them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub tid: Tid,
    pub oids: Vec<Oid>,
}

impl Invalidation {
    pub fn new(tid: Tid, oids: Vec<Oid>) -> Self {
        Self { tid, oids }
    }

    /// Returns `true` if this commit changed `oid`.
    pub fn touches(&self, oid: Oid) -> bool {
        self.oids.contains(&oid)
    }

    pub fn is_empty(&self) -> bool {
        self.oids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_is_state_len() {
        let rec = ObjectRecord::new(Oid::new(1), Tid::new(2), b"hello".to_vec());
        assert_eq!(rec.size(), 5);
    }

    #[test]
    fn invalidation_touches() {
        let inv = Invalidation::new(Tid::new(5), vec![Oid::new(7), Oid::new(9)]);
        assert!(inv.touches(Oid::new(7)));
        assert!(!inv.touches(Oid::new(8)));
        assert!(!inv.is_empty());
    }

    #[test]
    fn record_serde_roundtrip() {
        let rec = ObjectRecord::new(Oid::new(3), Tid::new(4), vec![1, 2, 3]);
        let json = serde_json::to_string(&rec).unwrap();
        let parsed: ObjectRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, parsed);
    }
}
