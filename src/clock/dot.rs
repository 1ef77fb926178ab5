use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::WriterId;

/// Uniquely identifies a single add event: the writer that performed it and
/// that writer's counter value at the time.
///
/// Comparable by `(writer, counter)` — the derived `Ord` orders componentwise,
/// since `writer` is compared byte-wise via `WriterId`'s own `Ord`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    /// The writer that owns this counter.
    pub writer: WriterId,
    /// The writer-local counter value, starting at 1.
    pub counter: u64,
}

impl Dot {
    /// Construct a dot directly. Prefer [`crate::clock::VersionVector::increment`]
    /// when producing a fresh dot for a new add.
    #[must_use]
    pub const fn new(writer: WriterId, counter: u64) -> Self {
        Self { writer, counter }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.writer, self.counter)
    }
}
