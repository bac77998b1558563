use std::fmt;

use serde::{Deserialize, Serialize};

/// Transaction id: the position of a commit in the store's total order.
///
/// Tids are assigned by the server at finish time, strictly increasing
/// across all commits to a store. `Tid::ZERO` means "before any commit" and
/// is the basis a client uses when it creates a new object.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tid(u64);

impl Tid {
    /// The tid preceding every commit.
    pub const ZERO: Tid = Tid(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The smallest tid strictly after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns `true` if this tid is strictly after `other`.
    pub fn is_after(&self, other: &Self) -> bool {
        self > other
    }

    /// Returns `true` if this tid is strictly before `other`.
    pub fn is_before(&self, other: &Self) -> bool {
        self < other
    }

    /// Number of commits between `earlier` and `self` (zero if `earlier` is
    /// not actually earlier).
    pub fn distance_from(&self, earlier: &Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// A tid strictly after both `self` and `floor`.
    ///
    /// Used at finish time: the new tid must beat the last one handed out
    /// and whatever the backend already reports as current.
    pub fn later_than(&self, floor: &Self) -> Self {
        (*self).max(*floor).next()
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
