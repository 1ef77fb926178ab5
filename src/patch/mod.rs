//! Patches: the unit of commit. A patch is an ordered list of typed ops plus
//! the causal context and provenance it was built against.

mod ops;
mod value;

pub use ops::{Op, PropTarget};
pub use value::PropValue;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::clock::VersionVector;
use crate::model::WriterId;

/// Schema 2: no edge properties. Schema 3: may contain edge properties
/// (i.e. a [`Op::PropSet`] whose target is an edge-property key).
pub const SCHEMA_NO_EDGE_PROPS: u32 = 2;
/// See [`SCHEMA_NO_EDGE_PROPS`].
pub const SCHEMA_WITH_EDGE_PROPS: u32 = 3;

/// One commit's worth of CRDT ops, plus the causal context and provenance
/// needed to replay and audit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// 2 (no edge properties) or 3 (contains edge properties).
    pub schema: u32,
    /// The writer that authored this patch.
    pub writer: WriterId,
    /// Monotonically increasing along this writer's chain; strictly
    /// greater than every Lamport timestamp observed at commit time.
    pub lamport: u64,
    /// Causal context: the writer's version vector snapshot at build time.
    pub context: VersionVector,
    /// Ordered operations; op application order within a patch is index
    /// order.
    pub ops: Vec<Op>,
    /// Entity ids this patch observed (read) as a dependency.
    pub reads: BTreeSet<String>,
    /// Entity ids this patch newly created or mutated.
    pub writes: BTreeSet<String>,
}

impl Patch {
    /// Whether this patch carries any op whose target is an edge-property
    /// key, which forces `schema = 3`.
    #[must_use]
    pub fn requires_edge_prop_schema(&self) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::PropSet { target: PropTarget::Edge { .. }, .. }))
    }

    /// Canonical CBOR encoding: field order follows this struct's
    /// declaration, the same fixed-shape approach as
    /// [`crate::checkpoint::Checkpoint`] and [`crate::audit::Receipt`].
    ///
    /// # Errors
    ///
    /// Returns an error only if CBOR encoding fails, which does not happen
    /// for this type's fields.
    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }
}
