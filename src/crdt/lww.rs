//! Last-write-wins register, totally ordered by [`EventId`].
//!
//! Ties are impossible by construction: `EventId` is unique per op, so
//! there is no wall-clock or agent-id tie-break layer to fall back on.

use serde::{Deserialize, Serialize};

use crate::clock::EventId;

/// A single-value register ordered by [`EventId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<V> {
    /// The event that wrote the current value.
    pub event_id: EventId,
    /// The current value.
    pub value: V,
}

impl<V> LwwRegister<V> {
    /// Construct a register from its first write.
    #[must_use]
    pub const fn new(event_id: EventId, value: V) -> Self {
        Self { event_id, value }
    }
}

impl<V: Clone> LwwRegister<V> {
    /// Merge `other` into `self`, keeping the write with the greater
    /// `EventId`. Equal `EventId`s would mean two distinct writes claimed
    /// the same identity, which is a patch-construction bug.
    pub fn merge(&mut self, other: &Self) {
        debug_assert_ne!(
            self.event_id, other.event_id,
            "two distinct writes produced the same EventId"
        );
        if other.event_id > self.event_id {
            self.event_id = other.event_id.clone();
            self.value = other.value.clone();
        }
    }

    /// Merge, returning whether `other` superseded `self`'s prior value
    /// (used by the reducer to report `applied` vs `superseded`).
    #[must_use]
    pub fn merge_reporting(&mut self, other: &Self) -> bool {
        if other.event_id > self.event_id {
            self.event_id = other.event_id.clone();
            self.value = other.value.clone();
            true
        } else {
            false
        }
    }
}
