use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Dot;
use crate::model::WriterId;

/// Mapping from writer id to the highest counter observed for that writer.
///
/// `BTreeMap` keeps iteration (and thus CBOR/JSON encoding) in a stable,
/// byte-ordered sequence without a separate sort step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<WriterId, u64>);

impl VersionVector {
    /// An empty version vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter currently recorded for `writer`, or 0 if never observed.
    #[must_use]
    pub fn get(&self, writer: &WriterId) -> u64 {
        self.0.get(writer).copied().unwrap_or(0)
    }

    /// Advance `writer`'s counter by one and return the freshly minted dot.
    ///
    /// This is the only way a new [`Dot`] should be created for an add op.
    pub fn increment(&mut self, writer: WriterId) -> Dot {
        let counter = self.0.entry(writer.clone()).or_insert(0);
        *counter += 1;
        Dot::new(writer, *counter)
    }

    /// Record that `dot` has been observed, raising `writer`'s counter if
    /// `dot.counter` is higher than what's currently recorded.
    pub fn observe(&mut self, dot: &Dot) {
        let entry = self.0.entry(dot.writer.clone()).or_insert(0);
        if dot.counter > *entry {
            *entry = dot.counter;
        }
    }

    /// Whether `dot` is dominated by this vector (i.e. already observed).
    #[must_use]
    pub fn contains(&self, dot: &Dot) -> bool {
        self.get(&dot.writer) >= dot.counter
    }

    /// Componentwise maximum of `self` and `other`, producing a vector that
    /// dominates both.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Merge `other` into `self` in place (componentwise max).
    pub fn merge(&mut self, other: &Self) {
        for (writer, &counter) in &other.0 {
            let entry = self.0.entry(writer.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Iterate `(writer, counter)` pairs in writer-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&WriterId, u64)> {
        self.0.iter().map(|(w, &c)| (w, c))
    }

    /// Whether this vector dominates `other` componentwise (`self >= other`
    /// in every component present in `other`).
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        other.0.iter().all(|(w, &c)| self.get(w) >= c)
    }
}
