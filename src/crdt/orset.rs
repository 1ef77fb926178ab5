//! Observed-remove set (OR-Set) with add-wins semantics, keyed by element.
//!
//! A [`Dot`] is globally unique (minted once, by exactly one writer's
//! [`crate::clock::VersionVector::increment`]), so a single flat tombstone
//! set dominates across every element — there is no need to track
//! tombstones per element.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::clock::Dot;

/// Observed-remove set: maps each live element to its non-empty set of live
/// dots, plus a flat tombstone set of removed dots.
///
/// Invariants:
/// 1. No dot appears in both a live entry and `tombstones`.
/// 2. An element is present iff it has at least one live dot.
/// 3. Add-wins: a dot added concurrently with a remove that didn't observe
///    it survives the remove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrSet<T: Ord + Clone> {
    live: BTreeMap<T, BTreeSet<Dot>>,
    tombstones: BTreeSet<Dot>,
}

/// Outcome of an [`OrSet::add`] call, used by the reducer to populate
/// [`crate::reducer::OpResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The dot was not previously tombstoned and is now live; the element
    /// transitioned from absent to present.
    AppliedNewlyAlive,
    /// The dot was not previously tombstoned and is now live, but the
    /// element was already present via another dot.
    AppliedAlreadyAlive,
    /// The dot was already in the tombstone set; the add was dropped.
    Tombstoned,
}

impl<T: Ord + Clone> OrSet<T> {
    /// An empty OR-Set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }

    /// Add `dot` as a live witness of `element`.
    ///
    /// If `dot` is already tombstoned, the add is dropped: it has been
    /// causally superseded by a remove that already observed it (or a
    /// future remove that preemptively tombstoned it). Returns the
    /// resulting [`AddOutcome`].
    pub fn add(&mut self, element: T, dot: Dot) -> AddOutcome {
        if self.tombstones.contains(&dot) {
            return AddOutcome::Tombstoned;
        }
        let was_present = self.contains(&element);
        self.live.entry(element).or_default().insert(dot);
        if was_present {
            AddOutcome::AppliedAlreadyAlive
        } else {
            AddOutcome::AppliedNewlyAlive
        }
    }

    /// Tombstone every dot in `observed` that is currently live for
    /// `element`; unknown dots are tombstoned anyway so a late-arriving add
    /// for one is suppressed on arrival.
    ///
    /// Returns the dots that were live for `element` and got tombstoned
    /// (i.e. excluding unknown dots not actually associated with it).
    pub fn remove(&mut self, element: &T, observed: &[Dot]) -> Vec<Dot> {
        let mut actually_removed = Vec::new();
        if let Some(dots) = self.live.get_mut(element) {
            for dot in observed {
                if dots.remove(dot) {
                    actually_removed.push(dot.clone());
                }
            }
            if dots.is_empty() {
                self.live.remove(element);
            }
        }
        self.tombstones.extend(observed.iter().cloned());
        actually_removed
    }

    /// Whether `element` has at least one live dot.
    #[must_use]
    pub fn contains(&self, element: &T) -> bool {
        self.live.get(element).is_some_and(|d| !d.is_empty())
    }

    /// Live dots for `element`, if present.
    #[must_use]
    pub fn live_dots(&self, element: &T) -> Option<&BTreeSet<Dot>> {
        self.live.get(element)
    }

    /// Currently-present elements, in `T`'s order.
    pub fn elements(&self) -> impl Iterator<Item = &T> {
        self.live.keys()
    }

    /// Number of currently-present elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether the set has no present elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Number of tombstoned dots (for GC ratio accounting).
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Read-only access to the full live map, for checkpoint serialization.
    #[must_use]
    pub const fn live_map(&self) -> &BTreeMap<T, BTreeSet<Dot>> {
        &self.live
    }

    /// Read-only access to the tombstone set, for checkpoint serialization.
    #[must_use]
    pub const fn tombstone_set(&self) -> &BTreeSet<Dot> {
        &self.tombstones
    }

    /// Rebuild an OR-Set directly from its authoritative parts (checkpoint
    /// restore). Does not re-validate the no-dual-residency invariant;
    /// callers must supply a checkpoint produced by this module.
    #[must_use]
    pub fn from_parts(live: BTreeMap<T, BTreeSet<Dot>>, tombstones: BTreeSet<Dot>) -> Self {
        Self { live, tombstones }
    }

    /// Merge `other` into `self`: union of tombstones dominates the union of
    /// live dots (add-wins, tombstone-union-dominates).
    pub fn merge(&mut self, other: &Self) {
        self.tombstones.extend(other.tombstones.iter().cloned());

        for (element, dots) in &other.live {
            let entry = self.live.entry(element.clone()).or_default();
            entry.extend(dots.iter().cloned());
        }

        // Tombstone union dominates: drop any live dot that's now tombstoned.
        self.live.retain(|_, dots| {
            dots.retain(|d| !self.tombstones.contains(d));
            !dots.is_empty()
        });
    }

    /// Garbage-collect tombstones dominated by `frontier`: a tombstoned dot
    /// is safe to drop once the frontier has observed it on every replica
    /// that could still emit a late concurrent add for it.
    ///
    /// Must never drop a tombstone that could still be needed to suppress a
    /// late-arriving concurrent add, so callers should only pass a frontier
    /// that dominates all currently-applied patches.
    pub fn gc_tombstones(&mut self, frontier: &crate::clock::VersionVector) {
        self.tombstones.retain(|dot| !frontier.contains(dot));
    }
}
