//! Checkpoint codec: serializes and deserializes a full [`WarpState`] plus
//! its provenance index, so materialization can resume from a snapshot
//! instead of replaying a writer's entire chain.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::clock::{Dot, EventId, VersionVector};
use crate::crdt::{LwwRegister, OrSet};
use crate::model::{PatchSha, WriterId};
use crate::patch::PropValue;
use crate::provenance::ProvenanceIndex;
use crate::state::WarpState;

/// Current checkpoint schema version emitted by this crate.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// A decoded checkpoint: the materialized state at some frontier, plus the
/// provenance index accumulated up to that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Schema version the checkpoint was encoded with.
    pub schema_version: u32,
    /// The materialized state.
    pub state: WarpState,
    /// Provenance entries accumulated up to this checkpoint's frontier.
    pub provenance: ProvenanceIndex,
    /// Each writer's chain tip commit SHA at the moment this checkpoint was
    /// taken. Resuming materialization from this checkpoint walks each
    /// writer's chain only down to (exclusive of) the recorded tip, since
    /// everything at or below it is already folded into `state`.
    pub writer_tips: BTreeMap<WriterId, Option<String>>,
}

/// Edge-birth values may arrive in one of two shapes: the typed `EventId`
/// this crate emits, or a bare Lamport integer from an older writer.
/// Deserialization accepts either; this crate only ever emits the typed
/// form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum EdgeBirthWire {
    Typed(EventId),
    LegacyLamport(u64),
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointWire {
    schema_version: u32,
    node_alive: OrSet<String>,
    edge_alive: OrSet<String>,
    prop: BTreeMap<String, LwwRegister<PropValue>>,
    observed_frontier: VersionVector,
    edge_birth_event: BTreeMap<String, EdgeBirthWire>,
    provenance: ProvenanceIndex,
    #[serde(default)]
    writer_tips: BTreeMap<WriterId, Option<String>>,
}

/// Sentinel writer id used to synthesize an `EventId` for a legacy
/// `edgeBirthLamport` entry that carries no writer/patch-sha information.
fn legacy_writer() -> WriterId {
    WriterId::new("legacy").expect("static value is a valid writer id")
}

/// Sentinel patch sha used for the same purpose. `"0" * 4` is the shortest
/// valid hex patch sha.
fn legacy_patch_sha() -> PatchSha {
    PatchSha::new("0000").expect("static value is a valid patch sha")
}

impl Checkpoint {
    /// Build a checkpoint from the current state, provenance index, and
    /// each writer's chain tip at this moment.
    #[must_use]
    pub fn new(
        state: WarpState,
        provenance: ProvenanceIndex,
        writer_tips: BTreeMap<WriterId, Option<String>>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            state,
            provenance,
            writer_tips,
        }
    }

    /// Canonical CBOR encoding of this checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error only if CBOR encoding fails, which does not happen
    /// for this type's fields.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let wire = CheckpointWire {
            schema_version: self.schema_version,
            node_alive: self.state.node_alive.clone(),
            edge_alive: self.state.edge_alive.clone(),
            prop: self.state.prop.clone(),
            observed_frontier: self.state.observed_frontier.clone(),
            edge_birth_event: self
                .state
                .edge_birth_event
                .iter()
                .map(|(k, v)| (k.clone(), EdgeBirthWire::Typed(v.clone())))
                .collect(),
            provenance: self.provenance.clone(),
            writer_tips: self.writer_tips.clone(),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&wire, &mut bytes)?;
        Ok(bytes)
    }

    /// Decode a checkpoint previously produced by [`Checkpoint::encode`] (or
    /// by a writer using the legacy `edgeBirthLamport` field).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::MaterializeError::UnsupportedSchema`] if the
    /// embedded schema version is newer than this crate understands, or
    /// [`crate::error::MaterializeError::CorruptCheckpoint`] if CBOR
    /// decoding fails.
    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::MaterializeError> {
        let wire: CheckpointWire = ciborium::from_reader(bytes).map_err(|e| {
            crate::error::MaterializeError::CorruptCheckpoint {
                reason: e.to_string(),
            }
        })?;

        if wire.schema_version > CHECKPOINT_SCHEMA_VERSION {
            return Err(crate::error::MaterializeError::UnsupportedSchema {
                found: wire.schema_version,
                supported: CHECKPOINT_SCHEMA_VERSION,
            });
        }

        let mut edge_birth_event = BTreeMap::new();
        for (key, value) in wire.edge_birth_event {
            let event = match value {
                EdgeBirthWire::Typed(event) => event,
                EdgeBirthWire::LegacyLamport(lamport) => {
                    warn!(edge = %key, lamport, "upgrading legacy edgeBirthLamport on read");
                    EventId::new(lamport, legacy_writer(), legacy_patch_sha(), 0)
                }
            };
            edge_birth_event.insert(key, event);
        }

        let state = WarpState {
            node_alive: wire.node_alive,
            edge_alive: wire.edge_alive,
            prop: wire.prop,
            observed_frontier: wire.observed_frontier,
            edge_birth_event,
        };

        Ok(Self {
            schema_version: wire.schema_version,
            state,
            provenance: wire.provenance,
            writer_tips: wire.writer_tips,
        })
    }
}

/// Recompute the version vector implied by every dot recorded in `state`'s
/// OR-Sets, live or tombstoned. Used to validate that a checkpoint's
/// `observed_frontier` still dominates every dot it ever folded, even after
/// tombstone garbage collection has dropped some of them from the
/// tombstone set itself.
#[must_use]
pub fn derive_applied_vv(state: &WarpState) -> VersionVector {
    let mut vv = VersionVector::new();
    for dots in state.node_alive.live_map().values() {
        for dot in dots {
            vv.observe(dot);
        }
    }
    for dot in state.node_alive.tombstone_set() {
        vv.observe(dot);
    }
    for dots in state.edge_alive.live_map().values() {
        for dot in dots {
            vv.observe(dot);
        }
    }
    for dot in state.edge_alive.tombstone_set() {
        vv.observe(dot);
    }
    vv
}
