//! Patch Builder: accumulates ops against a materialized state snapshot,
//! then commits them as one writer-chain commit under ref CAS.

use std::collections::BTreeSet;

use tracing::{instrument, warn};

use crate::audit::{parse_trailers, render_commit_message, Trailer};
use crate::clock::VersionVector;
use crate::error::{PatchError, WarpError};
use crate::keycodec;
use crate::model::{GraphName, WriterId};
use crate::patch::{Op, Patch, PropTarget, PropValue, SCHEMA_NO_EDGE_PROPS, SCHEMA_WITH_EDGE_PROPS};
use crate::persistence::{Persistence, TreeEntry};
use crate::state::WarpState;

/// What to do when deleting a node that still has incident edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Fail with [`PatchError::NodeHasIncidentEdges`].
    Reject,
    /// Emit `EdgeRemove` for every incident edge before the `NodeRemove`.
    Cascade,
    /// Proceed anyway; the edges become dangling orphans.
    Warn,
}

/// The outcome of a successful [`PatchBuilder::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// SHA of the new writer-chain commit.
    pub commit_sha: String,
    /// The patch that was committed.
    pub patch: Patch,
}

/// Accumulates ops for one writer against a snapshot of materialized state,
/// then commits them as a single patch.
///
/// Borrows the snapshot it was built against (`state`) for the lifetime of
/// accumulation; `commit` only needs a [`Persistence`] handle, kept separate
/// so construction and accumulation never touch I/O.
pub struct PatchBuilder<'s> {
    graph: GraphName,
    writer: WriterId,
    expected_parent: Option<String>,
    context: VersionVector,
    vv: VersionVector,
    observed_max_lamport: u64,
    ops: Vec<Op>,
    reads: BTreeSet<String>,
    writes: BTreeSet<String>,
    delete_policy: DeletePolicy,
    state: &'s WarpState,
}

impl<'s> PatchBuilder<'s> {
    /// Start a new patch for `writer`, capturing the current tip (for CAS)
    /// and the materialized state's version vector (causal context).
    ///
    /// # Errors
    ///
    /// Propagates a read failure from the persistence layer.
    pub fn new<P: Persistence>(
        persistence: &P,
        graph: GraphName,
        writer: WriterId,
        state: &'s WarpState,
        delete_policy: DeletePolicy,
    ) -> Result<Self, WarpError> {
        let ref_name = format!("refs/warp/{graph}/writers/{writer}");
        let expected_parent = persistence.read_ref(&ref_name)?;
        Ok(Self {
            graph,
            writer,
            expected_parent,
            context: state.observed_frontier.clone(),
            vv: state.observed_frontier.clone(),
            observed_max_lamport: state.observed_max_lamport(),
            ops: Vec::new(),
            reads: BTreeSet::new(),
            writes: BTreeSet::new(),
            delete_policy,
            state,
        })
    }

    /// Whether any op has been accumulated yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Enqueue a `NodeAdd`, minting a fresh dot for this writer.
    pub fn add_node(&mut self, id: impl Into<String>) -> &mut Self {
        let id = id.into();
        let dot = self.vv.increment(self.writer.clone());
        self.ops.push(Op::NodeAdd { id: id.clone(), dot });
        self.writes.insert(id);
        self
    }

    /// Enqueue a `NodeRemove`, snapshotting the node's currently observed
    /// live dots. Incident edges are handled per this builder's
    /// [`DeletePolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::NodeHasIncidentEdges`] under the `reject`
    /// policy if the node has at least one incident edge.
    pub fn remove_node(&mut self, id: &str) -> Result<&mut Self, PatchError> {
        let outgoing = self.state.outgoing_adjacency().get(id).cloned().unwrap_or_default();
        let incoming = self.state.incoming_adjacency().get(id).cloned().unwrap_or_default();
        let incident_edges = outgoing.len() + incoming.len();

        if incident_edges > 0 {
            match self.delete_policy {
                DeletePolicy::Reject => {
                    return Err(PatchError::NodeHasIncidentEdges { node: id.to_string(), incident_edges });
                }
                DeletePolicy::Cascade => {
                    for (to, label) in &outgoing {
                        self.remove_edge(id, to, label);
                    }
                    for (from, label) in &incoming {
                        self.remove_edge(from, id, label);
                    }
                }
                DeletePolicy::Warn => {
                    warn!(node = id, incident_edges, "removing node with incident edges; orphans will remain");
                }
            }
        }

        let observed: Vec<_> = self
            .state
            .node_alive
            .live_dots(&id.to_string())
            .map(|dots| dots.iter().cloned().collect())
            .unwrap_or_default();
        self.ops.push(Op::NodeRemove { id: id.to_string(), observed });
        self.reads.insert(id.to_string());
        Ok(self)
    }

    /// Enqueue an `EdgeAdd`, minting a fresh dot for this writer.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> &mut Self {
        let (from, to, label) = (from.into(), to.into(), label.into());
        let dot = self.vv.increment(self.writer.clone());
        self.reads.insert(from.clone());
        self.reads.insert(to.clone());
        self.writes.insert(keycodec::edge_key(&from, &to, &label));
        self.ops.push(Op::EdgeAdd { from, to, label, dot });
        self
    }

    /// Enqueue an `EdgeRemove`, snapshotting the edge's currently observed
    /// live dots.
    pub fn remove_edge(&mut self, from: &str, to: &str, label: &str) -> &mut Self {
        let key = keycodec::edge_key(from, to, label);
        let observed: Vec<_> = self
            .state
            .edge_alive
            .live_dots(&key)
            .map(|dots| dots.iter().cloned().collect())
            .unwrap_or_default();
        self.reads.insert(key);
        self.ops.push(Op::EdgeRemove {
            from: from.to_string(),
            to: to.to_string(),
            label: label.to_string(),
            observed,
        });
        self
    }

    /// Enqueue a `PropSet` on a node.
    pub fn set_node_property(&mut self, id: impl Into<String>, key: impl Into<String>, value: impl Into<PropValue>) -> &mut Self {
        let id = id.into();
        self.reads.insert(id.clone());
        self.writes.insert(id.clone());
        self.ops.push(Op::PropSet { target: PropTarget::Node { id }, key: key.into(), value: value.into() });
        self
    }

    /// Enqueue a `PropSet` on an edge.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::EdgeNotFound`] unless the edge either already
    /// exists in current state or was added earlier in this same patch.
    pub fn set_edge_property(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        label: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<PropValue>,
    ) -> Result<&mut Self, PatchError> {
        let (from, to, label) = (from.into(), to.into(), label.into());
        let edge = keycodec::edge_key(&from, &to, &label);

        let exists_in_state = self.state.edge_alive.contains(&edge);
        let exists_in_patch = self.ops.iter().any(
            |op| matches!(op, Op::EdgeAdd { from: f, to: t, label: l, .. } if *f == from && *t == to && *l == label),
        );
        if !exists_in_state && !exists_in_patch {
            return Err(PatchError::EdgeNotFound { from, to, label });
        }

        self.reads.insert(edge.clone());
        self.writes.insert(edge);
        self.ops.push(Op::PropSet { target: PropTarget::Edge { from, to, label }, key: key.into(), value: value.into() });
        Ok(self)
    }

    /// Finalize and commit the accumulated ops as one patch.
    ///
    /// `on_commit` runs only after the commit (including the ref CAS)
    /// succeeds; it's the hook the materializer uses to fold the new patch
    /// into cached state without a full reload.
    ///
    /// # Errors
    ///
    /// Returns [`PatchError::EmptyPatch`] if nothing was enqueued,
    /// [`PatchError::CasConflict`] if the writer's tip moved since this
    /// builder was constructed, or a persistence failure from any I/O step.
    #[instrument(skip(self, persistence, on_commit), fields(writer = %self.writer, ops = self.ops.len()))]
    pub fn commit<P: Persistence, F>(self, persistence: &mut P, on_commit: F) -> Result<CommitOutcome, WarpError>
    where
        F: FnOnce(&Patch, &str),
    {
        if self.ops.is_empty() {
            return Err(PatchError::EmptyPatch.into());
        }

        let ref_name = format!("refs/warp/{}/writers/{}", self.graph, self.writer);
        let current_parent = persistence.read_ref(&ref_name)?;
        if current_parent != self.expected_parent {
            return Err(PatchError::CasConflict {
                expected_sha: self.expected_parent,
                actual_sha: current_parent,
            }
            .into());
        }

        let parent_lamport = match &current_parent {
            Some(parent_sha) => {
                let message = persistence.show_node(parent_sha)?;
                parse_trailers(&message)
                    .into_iter()
                    .find(|t| t.key == "eg-lamport")
                    .and_then(|t| t.value.parse::<u64>().ok())
                    .unwrap_or(0)
            }
            None => 0,
        };
        let lamport = parent_lamport.max(self.observed_max_lamport) + 1;

        let schema = if self.ops.iter().any(|op| matches!(op, Op::PropSet { target: PropTarget::Edge { .. }, .. })) {
            SCHEMA_WITH_EDGE_PROPS
        } else {
            SCHEMA_NO_EDGE_PROPS
        };

        let patch = Patch {
            schema,
            writer: self.writer.clone(),
            lamport,
            context: self.context,
            ops: self.ops,
            reads: self.reads,
            writes: self.writes,
        };

        let bytes = patch
            .encode()
            .map_err(|e| crate::error::PersistError::Backend { reason: e.to_string() })?;
        let blob_oid = persistence.write_blob(&bytes)?;
        let tree_oid = persistence.write_tree(&[TreeEntry { path: "patch.cbor".to_string(), oid: blob_oid.clone() }])?;

        let trailers = vec![
            Trailer { key: "eg-schema".to_string(), value: schema.to_string() },
            Trailer { key: "eg-graph".to_string(), value: self.graph.to_string() },
            Trailer { key: "eg-writer".to_string(), value: self.writer.to_string() },
            Trailer { key: "eg-lamport".to_string(), value: lamport.to_string() },
            Trailer { key: "eg-patch-oid".to_string(), value: blob_oid },
        ];
        let message = render_commit_message("patch commit", &trailers);

        let parents: Vec<String> = current_parent.clone().into_iter().collect();
        let commit_sha = persistence.commit_node_with_tree(&tree_oid, &parents, &message)?;

        match persistence.compare_and_swap_ref(&ref_name, &commit_sha, current_parent.as_deref()) {
            Ok(()) => {}
            Err(crate::error::PersistError::RefCasFailed { actual, .. }) => {
                return Err(PatchError::CasConflict { expected_sha: current_parent, actual_sha: actual }.into());
            }
            Err(other) => return Err(other.into()),
        }

        on_commit(&patch, &commit_sha);

        Ok(CommitOutcome { commit_sha, patch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::reducer;

    fn graph() -> GraphName {
        GraphName::new("g1").unwrap()
    }

    fn writer(name: &str) -> WriterId {
        WriterId::new(name).unwrap()
    }

    #[test]
    fn empty_patch_is_rejected() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        let err = builder.commit(&mut persistence, |_, _| {}).unwrap_err();
        assert!(matches!(err, WarpError::Patch(PatchError::EmptyPatch)));
    }

    #[test]
    fn first_commit_has_no_parent_and_lamport_one() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        builder.add_node("user:alice");
        let outcome = builder.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome.patch.lamport, 1);
        assert_eq!(outcome.patch.ops.len(), 1);
    }

    #[test]
    fn second_commit_lamport_increases_past_parent() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        builder.add_node("user:alice");
        builder.commit(&mut persistence, |_, _| {}).unwrap();

        let mut builder2 = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        builder2.add_node("user:bob");
        let outcome = builder2.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome.patch.lamport, 2);
    }

    #[test]
    fn stale_parent_raises_cas_conflict() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut first = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        first.add_node("user:stale-racer");

        // A concurrent commit lands on the ref before `first` commits.
        let mut concurrent = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        concurrent.add_node("user:winner");
        concurrent.commit(&mut persistence, |_, _| {}).unwrap();

        let err = first.commit(&mut persistence, |_, _| {}).unwrap_err();
        assert!(matches!(err, WarpError::Patch(PatchError::CasConflict { .. })));
    }

    #[test]
    fn remove_node_with_incident_edge_rejected_by_default() {
        let mut state = WarpState::new();
        let mut persistence = InMemoryPersistence::new();
        {
            let mut seed = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
            seed.add_node("user:a");
            seed.add_node("user:b");
            seed.add_edge("user:a", "user:b", "knows");
            let outcome = seed.commit(&mut persistence, |_, _| {}).unwrap();
            let mut receipts = Vec::new();
            reducer::fold(&mut state, vec![(outcome.patch, crate::model::PatchSha::new(outcome.commit_sha.chars().take(40).collect::<String>()).unwrap())], false)
                .into_iter()
                .for_each(|r| receipts.push(r));
        }

        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        let err = builder.remove_node("user:a").unwrap_err();
        assert!(matches!(err, PatchError::NodeHasIncidentEdges { incident_edges: 1, .. }));
    }

    #[test]
    fn cascade_policy_emits_edge_removes_before_node_remove() {
        let mut state = WarpState::new();
        let mut persistence = InMemoryPersistence::new();
        {
            let mut seed = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
            seed.add_node("user:a");
            seed.add_node("user:b");
            seed.add_edge("user:a", "user:b", "knows");
            let outcome = seed.commit(&mut persistence, |_, _| {}).unwrap();
            reducer::fold(&mut state, vec![(outcome.patch, crate::model::PatchSha::new("a".repeat(40)).unwrap())], false);
        }

        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Cascade).unwrap();
        builder.remove_node("user:a").unwrap();
        let outcome = builder.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome.patch.ops.len(), 2);
        assert!(matches!(outcome.patch.ops[0], Op::EdgeRemove { .. }));
        assert!(matches!(outcome.patch.ops[1], Op::NodeRemove { .. }));
    }

    #[test]
    fn set_edge_property_without_edge_is_rejected() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        let err = builder.set_edge_property("a", "b", "knows", "since", 2020).unwrap_err();
        assert!(matches!(err, PatchError::EdgeNotFound { .. }));
    }

    #[test]
    fn set_edge_property_on_edge_added_earlier_in_same_patch_succeeds() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        builder.add_edge("a", "b", "knows");
        builder.set_edge_property("a", "b", "knows", "since", 2020).unwrap();
        let outcome = builder.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome.patch.schema, SCHEMA_WITH_EDGE_PROPS);
    }

    #[test]
    fn post_commit_callback_runs_with_patch_and_sha() {
        let mut persistence = InMemoryPersistence::new();
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), writer("alice"), &state, DeletePolicy::Reject).unwrap();
        builder.add_node("user:a");
        let mut seen = None;
        let outcome = builder
            .commit(&mut persistence, |patch, sha| seen = Some((patch.lamport, sha.to_string())))
            .unwrap();
        assert_eq!(seen, Some((1, outcome.commit_sha)));
    }
}
