//! Vector clock of per-peer log sequence numbers
//!
//! Every peer owns one component which only ever grows. Two vclocks are
//! comparable only when one dominates the other in every component; callers
//! deciding whether a peer has caught up to a specific LSN must use the
//! partial order, never the scalar sum.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of a component-wise vclock comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VclockCmp {
    Equal,
    /// `self` is dominated by the other clock
    Less,
    /// `self` dominates the other clock
    Greater,
    /// Neither dominates; the clocks diverged
    Incomparable,
}

/// A mapping from peer id to the last known LSN of that peer's stream.
/// Missing components read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vclock {
    components: BTreeMap<u32, i64>,
}

impl Vclock {
    pub fn new() -> Self {
        Self::default()
    }

    /// LSN of the given peer's component.
    pub fn get(&self, peer_id: u32) -> i64 {
        self.components.get(&peer_id).copied().unwrap_or(0)
    }

    /// Bump the component by one and return the new value.
    pub fn inc(&mut self, peer_id: u32) -> i64 {
        let slot = self.components.entry(peer_id).or_insert(0);
        *slot += 1;
        *slot
    }

    /// Set the component to `lsn`, which must be a strict increase.
    pub fn follow(&mut self, peer_id: u32, lsn: i64) {
        let slot = self.components.entry(peer_id).or_insert(0);
        assert!(
            lsn > *slot,
            "vclock component {} must grow: {} -> {}",
            peer_id,
            *slot,
            lsn
        );
        *slot = lsn;
    }

    /// Component-wise maximum with `other`. Components never decrease.
    pub fn merge(&mut self, other: &Vclock) {
        for (&peer_id, &lsn) in &other.components {
            let slot = self.components.entry(peer_id).or_insert(0);
            if lsn > *slot {
                *slot = lsn;
            }
        }
    }

    /// Total of all components. A scalar signature; valid only as a
    /// tie-breaker once the partial order is established.
    pub fn sum(&self) -> i64 {
        self.components.values().sum()
    }

    /// Component-wise partial order.
    pub fn compare(&self, other: &Vclock) -> VclockCmp {
        let mut less = false;
        let mut greater = false;
        let peers = self
            .components
            .keys()
            .chain(other.components.keys())
            .copied()
            .collect::<std::collections::BTreeSet<u32>>();
        for peer_id in peers {
            let a = self.get(peer_id);
            let b = other.get(peer_id);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => VclockCmp::Equal,
            (true, false) => VclockCmp::Less,
            (false, true) => VclockCmp::Greater,
            (true, true) => VclockCmp::Incomparable,
        }
    }

    /// Whether `self` is at least `other` in every component.
    pub fn dominates(&self, other: &Vclock) -> bool {
        matches!(self.compare(other), VclockCmp::Equal | VclockCmp::Greater)
    }

    /// Partial order with the zero component excluded. Component 0 carries
    /// rows that never replicate, so cross-node comparisons must skip it.
    pub fn compare_ignore_local(&self, other: &Vclock) -> VclockCmp {
        let mut a = self.clone();
        let mut b = other.clone();
        a.components.remove(&0);
        b.components.remove(&0);
        a.compare(&b)
    }

    /// Iterate over the set components.
    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.components.iter().map(|(&k, &v)| (k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl fmt::Display for Vclock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (peer_id, lsn)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", peer_id, lsn)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_component_is_zero() {
        let clock = Vclock::new();
        assert_eq!(clock.get(5), 0);
        assert_eq!(clock.sum(), 0);
    }

    #[test]
    fn test_inc_and_follow() {
        let mut clock = Vclock::new();
        assert_eq!(clock.inc(1), 1);
        assert_eq!(clock.inc(1), 2);
        clock.follow(1, 10);
        assert_eq!(clock.get(1), 10);
        assert_eq!(clock.sum(), 10);
    }

    #[test]
    #[should_panic]
    fn test_follow_requires_strict_increase() {
        let mut clock = Vclock::new();
        clock.follow(1, 5);
        clock.follow(1, 5);
    }

    #[test]
    fn test_merge_never_decreases() {
        let mut a = Vclock::new();
        a.follow(1, 10);
        a.follow(2, 3);
        let mut b = Vclock::new();
        b.follow(1, 7);
        b.follow(3, 4);
        a.merge(&b);
        assert_eq!(a.get(1), 10);
        assert_eq!(a.get(2), 3);
        assert_eq!(a.get(3), 4);
    }

    #[test]
    fn test_compare_all_outcomes() {
        let mut a = Vclock::new();
        a.follow(1, 5);
        let mut b = Vclock::new();
        b.follow(1, 5);
        assert_eq!(a.compare(&b), VclockCmp::Equal);

        b.follow(1, 6);
        assert_eq!(a.compare(&b), VclockCmp::Less);
        assert_eq!(b.compare(&a), VclockCmp::Greater);

        // Diverged clocks: same sum, incomparable.
        let mut c = Vclock::new();
        c.follow(1, 1);
        c.follow(2, 2);
        let mut d = Vclock::new();
        d.follow(1, 2);
        d.follow(2, 1);
        assert_eq!(c.sum(), d.sum());
        assert_eq!(c.compare(&d), VclockCmp::Incomparable);
        assert!(!c.dominates(&d));
        assert!(!d.dominates(&c));
    }

    #[test]
    fn test_compare_ignore_local() {
        let mut a = Vclock::new();
        a.follow(0, 100);
        a.follow(1, 5);
        let mut b = Vclock::new();
        b.follow(0, 1);
        b.follow(1, 5);
        // Diverged zero components don't matter across nodes.
        assert_eq!(a.compare(&b), VclockCmp::Greater);
        assert_eq!(a.compare_ignore_local(&b), VclockCmp::Equal);
    }

    #[test]
    fn test_dominates() {
        let mut a = Vclock::new();
        a.follow(1, 3);
        a.follow(2, 2);
        let mut b = Vclock::new();
        b.follow(1, 3);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert!(a.dominates(&a.clone()));
    }
}
