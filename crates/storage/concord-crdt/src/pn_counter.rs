//! PN-Counter (Increment/Decrement Counter) CRDT implementation
//!
//! Each actor owns one positive and one negative slot; merge takes the
//! per-actor maximum of both, and the value is the difference of the sums.

use crate::traits::{ActorId, Mergeable};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    positive: BTreeMap<ActorId, u64>,
    negative: BTreeMap<ActorId, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, actor: &ActorId, amount: u64) {
        let slot = self.positive.entry(actor.clone()).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    pub fn decrement(&mut self, actor: &ActorId, amount: u64) {
        let slot = self.negative.entry(actor.clone()).or_insert(0);
        *slot = slot.saturating_add(amount);
    }

    /// Add a signed delta on behalf of `actor`
    pub fn apply(&mut self, actor: &ActorId, delta: i64) {
        if delta >= 0 {
            self.increment(actor, delta as u64);
        } else {
            self.decrement(actor, delta.unsigned_abs());
        }
    }

    pub fn value(&self) -> i64 {
        self.positive_sum() as i64 - self.negative_sum() as i64
    }

    pub fn positive_sum(&self) -> u64 {
        self.positive.values().sum()
    }

    pub fn negative_sum(&self) -> u64 {
        self.negative.values().sum()
    }

    /// Actors that have touched this counter
    pub fn actors(&self) -> BTreeSet<ActorId> {
        self.positive
            .keys()
            .chain(self.negative.keys())
            .cloned()
            .collect()
    }
}

fn merge_max(into: &mut BTreeMap<ActorId, u64>, from: &BTreeMap<ActorId, u64>) {
    for (actor, count) in from {
        let slot = into.entry(actor.clone()).or_insert(0);
        *slot = (*slot).max(*count);
    }
}

impl Mergeable for PnCounter {
    fn merge(&mut self, other: &Self) {
        merge_max(&mut self.positive, &other.positive);
        merge_max(&mut self.negative, &other.negative);
    }
}

impl fmt::Display for PnCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PnCounter({})", self.value())
    }
}
