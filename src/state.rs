//! Materialized CRDT state: the fold target of the join reducer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::{EventId, VersionVector};
use crate::crdt::{LwwRegister, OrSet};
use crate::patch::PropValue;

/// The materialized snapshot produced by folding a patch set.
///
/// Every field here is either authoritative checkpoint content or a value
/// reconstructible from it on replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarpState {
    /// OR-Set of live node ids.
    pub node_alive: OrSet<String>,
    /// OR-Set of live edge keys (`from\0to\0label`).
    pub edge_alive: OrSet<String>,
    /// Composite property key -> LWW register.
    pub prop: BTreeMap<String, LwwRegister<PropValue>>,
    /// Componentwise max of every dot (and causal context) seen so far.
    pub observed_frontier: VersionVector,
    /// Edge key -> the `EventId` that first made the edge live. Used for
    /// deterministic edge-property tie-breaks; reconstructed on replay by
    /// recording the first `EdgeAdd` whose outcome is newly-alive.
    pub edge_birth_event: BTreeMap<String, EventId>,
}

impl WarpState {
    /// An empty state (genesis).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjacency view: `node -> [(neighbor, label)]` for outgoing edges,
    /// built fresh from `edge_alive` in sorted order for deterministic
    /// query results.
    #[must_use]
    pub fn outgoing_adjacency(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let mut out: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for key in self.edge_alive.elements() {
            if let Some((from, to, label)) = crate::keycodec::split_edge_key(key) {
                out.entry(from.to_string())
                    .or_default()
                    .push((to.to_string(), label.to_string()));
            }
        }
        for neighbors in out.values_mut() {
            neighbors.sort();
        }
        out
    }

    /// Adjacency view: `node -> [(neighbor, label)]` for incoming edges.
    #[must_use]
    pub fn incoming_adjacency(&self) -> BTreeMap<String, Vec<(String, String)>> {
        let mut inn: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
        for key in self.edge_alive.elements() {
            if let Some((from, to, label)) = crate::keycodec::split_edge_key(key) {
                inn.entry(to.to_string())
                    .or_default()
                    .push((from.to_string(), label.to_string()));
            }
        }
        for neighbors in inn.values_mut() {
            neighbors.sort();
        }
        inn
    }

    /// Highest Lamport timestamp reflected anywhere in this state: the max
    /// over every property register's `event_id.lamport` and every edge's
    /// birth event lamport. Used to seed a new patch's Lamport so it
    /// exceeds anything this replica has observed, not just its own
    /// writer's chain.
    #[must_use]
    pub fn observed_max_lamport(&self) -> u64 {
        let props = self.prop.values().map(|r| r.event_id.lamport);
        let edges = self.edge_birth_event.values().map(|e| e.lamport);
        props.chain(edges).max().unwrap_or(0)
    }

    /// A content hash over the authoritative fields, for convergence
    /// assertions: two states that fold the same patch multiset must hash
    /// identically.
    ///
    /// # Errors
    ///
    /// Returns an error only if CBOR encoding fails, which does not happen
    /// for this type's fields.
    pub fn content_hash(&self) -> Result<String, ciborium::ser::Error<std::io::Error>> {
        use sha2::{Digest, Sha256};
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)?;
        let digest = Sha256::digest(&bytes);
        Ok(crate::util::to_hex(&digest))
    }
}
