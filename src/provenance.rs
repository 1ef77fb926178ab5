//! Provenance index: entity id -> the set of patch SHAs that read or wrote
//! it, built incrementally as patches are folded during materialization.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::PatchSha;
use crate::patch::Patch;

/// Maps an entity id (node id, edge key, or composite property key) to every
/// patch SHA that mentioned it in `reads` or `writes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceIndex(BTreeMap<String, BTreeSet<PatchSha>>);

impl ProvenanceIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `patch_sha` under every entity named in `patch.reads` and
    /// `patch.writes`.
    pub fn record(&mut self, patch: &Patch, patch_sha: &PatchSha) {
        for entity in patch.reads.iter().chain(patch.writes.iter()) {
            self.0
                .entry(entity.clone())
                .or_default()
                .insert(patch_sha.clone());
        }
    }

    /// The patch SHAs recorded against `entity`, if any.
    #[must_use]
    pub fn patches_for(&self, entity: &str) -> Option<&BTreeSet<PatchSha>> {
        self.0.get(entity)
    }

    /// Number of entities tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other`'s entries into `self` (used when resuming from a
    /// checkpoint's saved index and folding patches committed since).
    pub fn merge(&mut self, other: &Self) {
        for (entity, shas) in &other.0 {
            self.0.entry(entity.clone()).or_default().extend(shas.iter().cloned());
        }
    }
}
