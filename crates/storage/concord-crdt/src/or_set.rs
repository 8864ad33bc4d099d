//! Observed-Remove Set (OR-Set) CRDT implementation
//!
//! Every add is tagged with `(actor, sequence)`. A remove tombstones only the
//! tags it has observed, so an add concurrent with a remove survives the merge.

use crate::traits::{ActorId, Mergeable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique tag for one add operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementTag {
    pub actor: ActorId,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet<T: Ord> {
    entries: BTreeMap<T, BTreeSet<ElementTag>>,
    tombstones: BTreeSet<ElementTag>,
    clock: BTreeMap<ActorId, u64>,
}

impl<T: Ord> Default for OrSet<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            clock: BTreeMap::new(),
        }
    }
}

impl<T: Ord + Clone> OrSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `element` with a fresh tag owned by `actor`
    pub fn add(&mut self, actor: &ActorId, element: T) -> ElementTag {
        let sequence = self.clock.entry(actor.clone()).or_insert(0);
        *sequence += 1;
        let tag = ElementTag {
            actor: actor.clone(),
            sequence: *sequence,
        };
        self.entries.entry(element).or_default().insert(tag.clone());
        tag
    }

    /// Remove every observed instance of `element`; returns the tags removed
    pub fn remove(&mut self, element: &T) -> BTreeSet<ElementTag> {
        let observed = self.entries.remove(element).unwrap_or_default();
        self.tombstones.extend(observed.iter().cloned());
        observed
    }

    pub fn contains(&self, element: &T) -> bool {
        self.entries.contains_key(element)
    }

    /// Live elements in ascending order
    pub fn elements(&self) -> impl Iterator<Item = &T> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}

impl<T: Ord + Clone> Mergeable for OrSet<T> {
    fn merge(&mut self, other: &Self) {
        self.tombstones.extend(other.tombstones.iter().cloned());

        for (element, tags) in &other.entries {
            self.entries
                .entry(element.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }

        let tombstones = &self.tombstones;
        self.entries.retain(|_, tags| {
            tags.retain(|tag| !tombstones.contains(tag));
            !tags.is_empty()
        });

        for (actor, seq) in &other.clock {
            let slot = self.clock.entry(actor.clone()).or_insert(0);
            *slot = (*slot).max(*seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let a = ActorId::from("a");
        let mut set = OrSet::new();
        set.add(&a, "x".to_string());
        set.add(&a, "y".to_string());
        assert_eq!(set.len(), 2);

        let removed = set.remove(&"x".to_string());
        assert_eq!(removed.len(), 1);
        assert!(!set.contains(&"x".to_string()));
        assert_eq!(set.elements().collect::<Vec<_>>(), vec!["y"]);
    }

    #[test]
    fn test_concurrent_add_wins_over_remove() {
        let (a, b) = (ActorId::from("a"), ActorId::from("b"));
        let mut base = OrSet::new();
        base.add(&a, "x".to_string());

        let mut left = base.clone();
        let mut right = base.clone();
        left.remove(&"x".to_string());
        right.add(&b, "x".to_string());

        let l = left.merged(&right);
        let r = right.merged(&left);
        assert_eq!(l, r);
        assert!(l.contains(&"x".to_string()));
        assert_eq!(l.tombstone_count(), 1);
    }

    #[test]
    fn test_remove_propagates() {
        let a = ActorId::from("a");
        let mut left = OrSet::new();
        left.add(&a, 7u32);
        let mut right = left.clone();
        right.remove(&7);

        left.merge(&right);
        assert!(left.is_empty());
    }
}
