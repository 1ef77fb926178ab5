//! Graph Façade: the single entry point wiring together patch commits,
//! materialization, sync, and audit for one named graph over one
//! persistence backend.
//!
//! Responsibilities:
//! - Commit accumulation via [`PatchBuilder`], with a materialized state
//!   snapshot refreshed automatically on first use.
//! - Materialization caching, subscriber notification, and poll-driven
//!   watching via [`Materializer`].
//! - Frontier exchange with a remote peer via [`SyncController`].
//! - Best-effort tamper-evident audit trail via [`AuditReceiptService`],
//!   recorded once per commit and never allowed to fail the commit itself.
//!
//! Single-threaded cooperative model: every suspension point (ref reads,
//! commit CAS, sync round trips, audit commits) is ordinary synchronous
//! I/O against the injected [`Persistence`] backend; the only
//! cross-writer coordination is CAS on refs, never a lock held across
//! calls.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{instrument, warn};

use crate::audit::{AuditReceiptService, RecordOutcome};
use crate::builder::{CommitOutcome, DeletePolicy, PatchBuilder};
use crate::config::GraphConfig;
use crate::error::WarpError;
use crate::materializer::{CachedState, MaterializeOptions, Materializer, StateDiff, Status, SubscriptionId};
use crate::model::{GraphName, WriterId};
use crate::patch::Patch;
use crate::persistence::Persistence;
use crate::reducer;
use crate::sync::{AbortSignal, SyncController, SyncRequest, SyncResponse, SyncStatus, SyncTransport};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One named graph bound to a persistence backend.
///
/// `persistence` is `Option`-wrapped so it can be handed, whole, to a
/// per-commit [`AuditReceiptService`] (which owns its store rather than
/// borrowing it) and handed back once the audit receipt is recorded. It is
/// `None` only for the duration of that handoff; every public method
/// restores it before returning.
pub struct Graph<P: Persistence> {
    graph: GraphName,
    persistence: Option<P>,
    materializer: Materializer,
    sync: SyncController,
    watching: bool,
}

impl<P: Persistence> Graph<P> {
    /// Open `graph` over `persistence`, governed by `config`. Nothing is
    /// materialized yet; the first [`Graph::materialize`] or
    /// [`Graph::commit`] call discovers writer chains.
    #[must_use]
    pub fn open(persistence: P, graph: GraphName, config: GraphConfig) -> Self {
        Self {
            materializer: Materializer::new(graph.clone(), config.clone()),
            sync: SyncController::new(graph.clone(), config.sync),
            graph,
            persistence: Some(persistence),
            watching: false,
        }
    }

    fn persistence_mut(&mut self) -> &mut P {
        self.persistence.as_mut().expect("persistence is only absent during an audit handoff")
    }

    /// This graph's name.
    #[must_use]
    pub const fn name(&self) -> &GraphName {
        &self.graph
    }

    /// Produce the current materialized state, per the documented decision
    /// order (Lamport ceiling, then checkpoint resume, then genesis
    /// replay). See [`Materializer::materialize`].
    ///
    /// # Errors
    ///
    /// Propagates a persistence failure, or a checkpoint schema error the
    /// materializer could not recover from.
    pub fn materialize(&mut self, options: MaterializeOptions) -> Result<&CachedState, WarpError> {
        self.materializer.materialize(self.persistence.as_mut().expect("persistence present"), options)
    }

    /// The most recently materialized state, if any.
    #[must_use]
    pub fn cached(&self) -> Option<&CachedState> {
        self.materializer.cached()
    }

    /// A point-in-time health snapshot of materialization; never
    /// materializes.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn status(&self) -> Result<Status, WarpError> {
        self.materializer.status(self.persistence.as_ref().expect("persistence present"))
    }

    /// A point-in-time snapshot of sync health; never performs a round
    /// trip.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn sync_status(&self) -> Result<SyncStatus, WarpError> {
        self.sync.status(self.persistence.as_ref().expect("persistence present"))
    }

    /// Register a callback invoked with each non-empty [`StateDiff`]
    /// produced by a subsequent materialize call.
    pub fn subscribe(&mut self, callback: impl FnMut(&StateDiff) + 'static) -> SubscriptionId {
        self.materializer.subscribe(callback)
    }

    /// Remove a previously registered subscriber.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.materializer.unsubscribe(id);
    }

    /// Pull-on-interval counterpart to [`Graph::subscribe`]: re-materialize
    /// and hand back the refreshed state, for callers that poll on their
    /// own schedule rather than registering a push callback.
    ///
    /// At most one poll runs at a time. A call made while a prior poll on
    /// this graph is still in flight is an overrun: it is skipped outright,
    /// returning `Ok(None)`, rather than queuing or re-entering
    /// materialize (the same guard shape as the materializer's own
    /// checkpoint-creation reentrancy guard).
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Graph::materialize`] would.
    pub fn watch(&mut self) -> Result<Option<&CachedState>, WarpError> {
        if self.watching {
            return Ok(None);
        }
        self.watching = true;
        let result = self.materialize(MaterializeOptions::default()).map(|_| ());
        self.watching = false;
        result?;
        Ok(self.cached())
    }

    /// Accumulate and commit one patch for `writer`, materializing first if
    /// nothing is cached yet. On success, folds the new patch directly into
    /// the cached state (no rediscovery) and records a best-effort audit
    /// receipt; audit failures are counted, never propagated here.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PatchError::EmptyPatch`] if `build` enqueues
    /// nothing, [`crate::error::PatchError::CasConflict`] if the writer's
    /// tip moved concurrently, or a persistence failure from any I/O step.
    #[instrument(skip(self, build), fields(graph = %self.graph, writer = %writer))]
    pub fn commit(
        &mut self,
        writer: WriterId,
        delete_policy: DeletePolicy,
        build: impl FnOnce(&mut PatchBuilder),
    ) -> Result<CommitOutcome, WarpError> {
        if self.materializer.cached().is_none() {
            self.materialize(MaterializeOptions::default())?;
        }
        let state = self.materializer.cached().expect("just materialized").state.clone();

        let mut builder = PatchBuilder::new(self.persistence_mut(), self.graph.clone(), writer.clone(), &state, delete_policy)?;
        build(&mut builder);
        let outcome = builder.commit(self.persistence_mut(), |_, _| {})?;

        let patch_sha = crate::model::PatchSha::new(outcome.commit_sha.clone())
            .expect("persistence backends mint lowercase-hex commit shas");

        self.fold_and_audit(writer, outcome.patch.clone(), patch_sha, outcome.commit_sha.clone())?;
        Ok(outcome)
    }

    fn fold_and_audit(
        &mut self,
        writer: WriterId,
        patch: Patch,
        patch_sha: crate::model::PatchSha,
        commit_sha: String,
    ) -> Result<(), WarpError> {
        let mut scratch = self.materializer.cached().map(|c| c.state.clone()).unwrap_or_default();
        let receipt = reducer::fold(&mut scratch, vec![(patch.clone(), patch_sha.clone())], true)
            .pop()
            .expect("fold emits exactly one receipt per patch supplied");

        self.materializer.fold_external_patches(self.persistence_mut(), vec![(patch, patch_sha)])?;

        let persistence = self.persistence.take().expect("persistence present");
        let mut audit = AuditReceiptService::new(persistence, self.graph.clone(), writer);
        match audit.record(&receipt, &commit_sha, now_millis()) {
            RecordOutcome::Committed(sha) => {
                tracing::debug!(audit_commit = %sha, "recorded audit receipt");
            }
            RecordOutcome::Skipped { reason } => {
                warn!(reason = %reason, "audit receipt not recorded");
            }
        }
        self.persistence = Some(audit.into_persistence());
        Ok(())
    }

    /// Answer a peer's [`SyncRequest`] with the patches it's missing.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn process_sync_request(&self, request: &SyncRequest) -> Result<SyncResponse, WarpError> {
        self.sync.process_sync_request(self.persistence.as_ref().expect("persistence present"), request)
    }

    /// Run one full sync against `remote`, retried per this graph's
    /// [`crate::config::SyncPolicy`].
    ///
    /// # Errors
    ///
    /// See [`SyncController::sync_with`].
    pub fn sync_with<T: SyncTransport>(&mut self, transport: &mut T, remote: &str, abort: &AbortSignal) -> Result<(), WarpError> {
        if self.materializer.cached().is_none() {
            self.materialize(MaterializeOptions::default())?;
        }
        let Self { persistence, materializer, sync, .. } = self;
        sync.sync_with(persistence.as_mut().expect("persistence present"), materializer, transport, remote, abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    fn graph_name() -> GraphName {
        GraphName::new("g1").unwrap()
    }

    fn writer(name: &str) -> WriterId {
        WriterId::new(name).unwrap()
    }

    #[test]
    fn commit_materializes_lazily_and_updates_cache() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        graph
            .commit(writer("alice"), DeletePolicy::Reject, |b| {
                b.add_node("user:a");
            })
            .unwrap();

        let cached = graph.cached().unwrap();
        assert!(cached.state.node_alive.contains(&"user:a".to_string()));
    }

    #[test]
    fn second_commit_folds_without_full_rediscovery() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); }).unwrap();
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:b"); }).unwrap();

        let cached = graph.cached().unwrap();
        assert!(cached.state.node_alive.contains(&"user:a".to_string()));
        assert!(cached.state.node_alive.contains(&"user:b".to_string()));
    }

    #[test]
    fn subscriber_observes_commits_through_the_facade() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        graph.subscribe(move |diff| seen_clone.borrow_mut().push(diff.clone()));

        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); }).unwrap();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn watch_refreshes_cached_state_like_materialize() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); }).unwrap();

        let state = graph.watch().unwrap().expect("no poll in flight");
        assert!(state.state.node_alive.contains(&"user:a".to_string()));
    }

    #[test]
    fn watch_skips_an_overrunning_poll() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); }).unwrap();

        graph.watching = true;
        let overrun = graph.watch().unwrap();
        assert!(overrun.is_none(), "a poll already in flight must skip, not queue");

        graph.watching = false;
        let resumed = graph.watch().unwrap();
        assert!(resumed.is_some(), "once the in-flight poll clears, watch works again");
    }

    #[test]
    fn process_sync_request_reflects_committed_patches() {
        let mut graph = Graph::open(InMemoryPersistence::new(), graph_name(), GraphConfig::default());
        graph.commit(writer("alice"), DeletePolicy::Reject, |b| { b.add_node("user:a"); }).unwrap();

        let request = SyncRequest::new(std::collections::BTreeMap::new());
        let response = graph.process_sync_request(&request).unwrap();
        assert_eq!(response.patches.len(), 1);
    }
}
