//! Sync Controller: exchanges frontier state with a remote peer over an
//! injected [`SyncTransport`], folds the resulting patches into the local
//! materializer, and persists them into this graph's own writer chains so a
//! later materialize from genesis doesn't lose what was synced in.

mod backoff;
mod transport;

pub use backoff::AbortSignal;
pub use transport::SyncTransport;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::audit::{render_commit_message, Trailer};
use crate::config::SyncPolicy;
use crate::error::{SyncError, WarpError};
use crate::materializer::{discover_writers, walk_chain, writer_ref, Materializer, WalkControl};
use crate::model::{GraphName, PatchSha, WriterId};
use crate::patch::Patch;
use crate::persistence::{Persistence, TreeEntry};

use backoff::{next_delay_ms, Rng};

const PATCH_BLOB_PATH: &str = "patch.cbor";

/// A peer's offer to exchange state: each known writer's current chain tip,
/// or `None` for a writer the peer has never seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Always `"sync-request"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// `writerId -> tip commit sha`, `None` if the writer is unknown locally.
    pub frontier: BTreeMap<WriterId, Option<String>>,
}

impl SyncRequest {
    /// Build a request offering `frontier`.
    #[must_use]
    pub fn new(frontier: BTreeMap<WriterId, Option<String>>) -> Self {
        Self { kind: "sync-request".to_string(), frontier }
    }
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

/// One patch the responder is sending back because the requester's
/// frontier didn't already include it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPatchEntry {
    /// The writer whose chain this patch belongs to.
    #[serde(rename = "writerId")]
    pub writer: WriterId,
    /// Content-addressed sha of the patch blob.
    #[serde(rename = "sha")]
    pub patch_sha: PatchSha,
    /// The patch itself.
    pub patch: Patch,
}

/// A responder's answer to a [`SyncRequest`]: its own frontier, plus every
/// patch the requester's frontier didn't already cover, per writer in
/// root-to-tip order so the requester can replay each writer's chain
/// forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Always `"sync-response"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The responder's frontier at the moment it answered.
    pub frontier: BTreeMap<WriterId, Option<String>>,
    /// Missing patches, oldest-first per writer.
    pub patches: Vec<SyncPatchEntry>,
}

impl SyncResponse {
    /// Build a response carrying `frontier` and `patches`.
    #[must_use]
    pub fn new(frontier: BTreeMap<WriterId, Option<String>>, patches: Vec<SyncPatchEntry>) -> Self {
        Self { kind: "sync-response".to_string(), frontier, patches }
    }
}

impl Default for SyncResponse {
    fn default() -> Self {
        Self::new(BTreeMap::new(), Vec::new())
    }
}

/// Current health of a [`SyncController`], without performing I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether a sync is needed against the given frontier (i.e. the last
    /// known remote frontier differed from the local one).
    pub frontier_changed: bool,
    /// Writers known locally.
    pub writers: Vec<WriterId>,
}

/// Drives frontier exchange with a remote peer for one graph.
pub struct SyncController {
    graph: GraphName,
    policy: SyncPolicy,
    last_known_remote_frontier: Option<BTreeMap<WriterId, Option<String>>>,
}

impl SyncController {
    /// A controller for `graph`, governed by `policy`.
    #[must_use]
    pub fn new(graph: GraphName, policy: SyncPolicy) -> Self {
        Self {
            graph,
            policy,
            last_known_remote_frontier: None,
        }
    }

    /// This graph's current frontier: every known writer's chain tip.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn get_frontier<P: Persistence>(&self, persistence: &P) -> Result<BTreeMap<WriterId, Option<String>>, WarpError> {
        let mut frontier = BTreeMap::new();
        for writer in discover_writers(persistence, &self.graph)? {
            let tip = persistence.read_ref(&writer_ref(&self.graph, &writer))?;
            frontier.insert(writer, tip);
        }
        Ok(frontier)
    }

    /// Build the request this side would send to offer its frontier.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn create_sync_request<P: Persistence>(&self, persistence: &P) -> Result<SyncRequest, WarpError> {
        Ok(SyncRequest::new(self.get_frontier(persistence)?))
    }

    /// Answer a peer's [`SyncRequest`]: for each writer the peer's frontier
    /// doesn't already cover (unknown, or behind this side's tip), walk the
    /// missing suffix of that writer's chain and return it oldest-first.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    #[instrument(skip(self, persistence, request), fields(graph = %self.graph))]
    pub fn process_sync_request<P: Persistence>(&self, persistence: &P, request: &SyncRequest) -> Result<SyncResponse, WarpError> {
        let frontier = self.get_frontier(persistence)?;
        let mut patches = Vec::new();

        for (writer, tip) in &frontier {
            let Some(tip) = tip else { continue };
            let boundary = request.frontier.get(writer).cloned().flatten();
            if Some(tip.clone()) == boundary {
                continue;
            }
            let walked = walk_chain(persistence, tip, |_, sha| {
                if Some(sha.to_string()) == boundary { WalkControl::Stop } else { WalkControl::Include }
            })?;
            // `walk_chain` returns tip-to-genesis; the requester needs to
            // replay a writer's chain forward, so reverse to root-first.
            for (patch, patch_sha) in walked.into_iter().rev() {
                patches.push(SyncPatchEntry { writer: writer.clone(), patch_sha, patch });
            }
        }

        debug!(patches = patches.len(), "answered sync request");
        Ok(SyncResponse::new(frontier, patches))
    }

    /// Fold a [`SyncResponse`] into local state: persist every received
    /// patch into its writer's local chain (so the content-addressed commit
    /// lands at the same oid the responder has), then fold them into the
    /// materializer's cached state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NoState`] if `materializer` has no cached state
    /// yet (via [`Materializer::fold_external_patches`]), or a persistence
    /// failure while re-committing a patch.
    #[instrument(skip(self, persistence, materializer, response), fields(graph = %self.graph))]
    pub fn apply_sync_response<P: Persistence>(
        &mut self,
        persistence: &mut P,
        materializer: &mut Materializer,
        response: &SyncResponse,
    ) -> Result<(), WarpError> {
        let mut by_writer: BTreeMap<WriterId, Vec<(Patch, PatchSha)>> = BTreeMap::new();
        for entry in &response.patches {
            by_writer.entry(entry.writer.clone()).or_default().push((entry.patch.clone(), entry.patch_sha.clone()));
        }

        let mut all_patches = Vec::new();
        for (writer, entries) in by_writer {
            for (patch, patch_sha) in entries {
                persist_received_patch(persistence, &self.graph, &writer, &patch, &patch_sha)?;
                all_patches.push((patch, patch_sha));
            }
        }

        if !all_patches.is_empty() {
            materializer.fold_external_patches(persistence, all_patches)?;
        }

        self.last_known_remote_frontier = Some(response.frontier.clone());
        Ok(())
    }

    /// Whether the last-known remote frontier (from a prior sync) differs
    /// from the local one.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn has_frontier_changed<P: Persistence>(&self, persistence: &P) -> Result<bool, WarpError> {
        let local = self.get_frontier(persistence)?;
        Ok(self.last_known_remote_frontier.as_ref() != Some(&local))
    }

    /// A point-in-time snapshot; never performs a sync round trip.
    ///
    /// # Errors
    ///
    /// Propagates a persistence read failure.
    pub fn status<P: Persistence>(&self, persistence: &P) -> Result<SyncStatus, WarpError> {
        Ok(SyncStatus {
            frontier_changed: self.has_frontier_changed(persistence)?,
            writers: discover_writers(persistence, &self.graph)?,
        })
    }

    /// Run one full sync against `remote`: request/response round trip via
    /// `transport`, retried with exponential backoff and jitter per this
    /// controller's [`SyncPolicy`] on retryable failures, cancellable via
    /// `abort`.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::OperationAborted`] if `abort` fires before a
    /// successful round trip, the underlying [`SyncError`] once retries are
    /// exhausted, or immediately for a non-retryable [`SyncError`].
    #[instrument(skip(self, persistence, materializer, transport, abort), fields(graph = %self.graph, remote = %remote))]
    pub fn sync_with<P: Persistence, T: SyncTransport>(
        &mut self,
        persistence: &mut P,
        materializer: &mut Materializer,
        transport: &mut T,
        remote: &str,
        abort: &AbortSignal,
    ) -> Result<(), WarpError> {
        let timeout = Duration::from_millis(self.policy.timeout_ms);
        let mut rng = Rng::from_entropy();
        let mut delay_ms = self.policy.base_delay_ms;

        for attempt in 0..=self.policy.retries {
            if abort.is_aborted() {
                return Err(WarpError::OperationAborted {
                    operation: "syncWith".to_string(),
                    reason: "cancelled before a sync round trip completed".to_string(),
                });
            }

            let request = self.create_sync_request(persistence)?;
            let attempt_start = Instant::now();
            match transport.send_sync_request(remote, &request, timeout, abort) {
                Ok(response) => {
                    self.apply_sync_response(persistence, materializer, &response)?;
                    debug!(attempt, elapsed_ms = attempt_start.elapsed().as_millis() as u64, "sync succeeded");
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.policy.retries => {
                    delay_ms = next_delay_ms(&self.policy, attempt, delay_ms, &mut rng);
                    warn!(attempt, delay_ms, error = %err, "sync attempt failed; retrying");
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(err) => return Err(err.into()),
            }
        }

        unreachable!("loop always returns via Ok, a non-retryable Err, or exhausting attempts")
    }
}

/// Re-commit a patch received from a remote peer into this writer's local
/// chain, so later materialization from genesis (which rediscovers writers
/// purely from refs) sees it. Content addressing means a patch already
/// known locally lands at the same blob/tree/commit oids it had remotely;
/// this is a no-op in effect for anything already present.
fn persist_received_patch<P: Persistence>(
    persistence: &mut P,
    graph: &GraphName,
    writer: &WriterId,
    patch: &Patch,
    patch_sha: &PatchSha,
) -> Result<(), WarpError> {
    let ref_name = writer_ref(graph, writer);
    let current_parent = persistence.read_ref(&ref_name)?;

    let bytes = patch.encode().map_err(|e| crate::error::PersistError::Backend { reason: e.to_string() })?;
    let blob_oid = persistence.write_blob(&bytes)?;
    let tree_oid = persistence.write_tree(&[TreeEntry { path: PATCH_BLOB_PATH.to_string(), oid: blob_oid.clone() }])?;

    let trailers = vec![
        Trailer { key: "eg-schema".to_string(), value: patch.schema.to_string() },
        Trailer { key: "eg-graph".to_string(), value: graph.to_string() },
        Trailer { key: "eg-writer".to_string(), value: writer.to_string() },
        Trailer { key: "eg-lamport".to_string(), value: patch.lamport.to_string() },
        Trailer { key: "eg-patch-oid".to_string(), value: blob_oid },
        Trailer { key: "eg-synced-sha".to_string(), value: patch_sha.to_string() },
    ];
    let message = render_commit_message("synced patch", &trailers);

    let parents: Vec<String> = current_parent.clone().into_iter().collect();
    let commit_sha = persistence.commit_node_with_tree(&tree_oid, &parents, &message)?;

    match persistence.compare_and_swap_ref(&ref_name, &commit_sha, current_parent.as_deref()) {
        Ok(()) => Ok(()),
        Err(crate::error::PersistError::RefCasFailed { .. }) => {
            debug!(writer = %writer, "synced patch lost ref CAS to a local commit landing concurrently; state is still folded in-memory");
            Ok(())
        }
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{DeletePolicy, PatchBuilder};
    use crate::config::GraphConfig;
    use crate::materializer::MaterializeOptions;
    use crate::persistence::InMemoryPersistence;
    use crate::state::WarpState;
    use std::cell::RefCell;

    fn graph() -> GraphName {
        GraphName::new("g1").unwrap()
    }

    fn writer(name: &str) -> WriterId {
        WriterId::new(name).unwrap()
    }

    fn commit_node(persistence: &mut InMemoryPersistence, w: &WriterId, node: &str) {
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(persistence, graph(), w.clone(), &state, DeletePolicy::Reject).unwrap();
        builder.add_node(node);
        builder.commit(persistence, |_, _| {}).unwrap();
    }

    #[test]
    fn get_frontier_reports_every_writers_tip() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");
        commit_node(&mut persistence, &writer("bob"), "user:b");

        let controller = SyncController::new(graph(), SyncPolicy::default());
        let frontier = controller.get_frontier(&persistence).unwrap();
        assert_eq!(frontier.len(), 2);
        assert!(frontier.get(&writer("alice")).unwrap().is_some());
    }

    #[test]
    fn process_sync_request_returns_only_missing_suffix() {
        let mut persistence = InMemoryPersistence::new();
        let w = writer("alice");
        commit_node(&mut persistence, &w, "user:a");
        let known_tip = persistence.read_ref(&writer_ref(&graph(), &w)).unwrap();
        commit_node(&mut persistence, &w, "user:b");

        let controller = SyncController::new(graph(), SyncPolicy::default());
        let request = SyncRequest::new(BTreeMap::from([(w.clone(), known_tip)]));
        let response = controller.process_sync_request(&persistence, &request).unwrap();

        assert_eq!(response.patches.len(), 1);
        assert_eq!(response.patches[0].writer, w);
        assert!(matches!(&response.patches[0].patch.ops[0], crate::patch::Op::NodeAdd { id, .. } if id == "user:b"));
    }

    #[test]
    fn process_sync_request_omits_writers_already_at_tip() {
        let mut persistence = InMemoryPersistence::new();
        let w = writer("alice");
        commit_node(&mut persistence, &w, "user:a");
        let tip = persistence.read_ref(&writer_ref(&graph(), &w)).unwrap();

        let controller = SyncController::new(graph(), SyncPolicy::default());
        let request = SyncRequest::new(BTreeMap::from([(w, tip)]));
        let response = controller.process_sync_request(&persistence, &request).unwrap();
        assert!(response.patches.is_empty());
    }

    #[test]
    fn apply_sync_response_requires_prior_materialize() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let mut controller = SyncController::new(graph(), SyncPolicy::default());
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        let response = SyncResponse::default();
        let err = controller.apply_sync_response(&mut persistence, &mut materializer, &response).unwrap_err();
        assert_eq!(err.error_code(), "E_NO_STATE");
    }

    #[test]
    fn full_round_trip_converges_two_replicas() {
        let mut local = InMemoryPersistence::new();
        let mut remote = InMemoryPersistence::new();
        commit_node(&mut remote, &writer("alice"), "user:a");
        commit_node(&mut remote, &writer("alice"), "user:b");

        let mut local_materializer = Materializer::new(graph(), GraphConfig::default());
        local_materializer.materialize(&mut local, MaterializeOptions::default()).unwrap();

        let requester = SyncController::new(graph(), SyncPolicy::default());
        let responder = SyncController::new(graph(), SyncPolicy::default());

        let request = requester.create_sync_request(&local).unwrap();
        let response = responder.process_sync_request(&remote, &request).unwrap();

        let mut applier = SyncController::new(graph(), SyncPolicy::default());
        applier.apply_sync_response(&mut local, &mut local_materializer, &response).unwrap();

        let cached = local_materializer.cached().unwrap();
        assert!(cached.state.node_alive.contains(&"user:a".to_string()));
        assert!(cached.state.node_alive.contains(&"user:b".to_string()));

        // Re-materializing from genesis must still see the synced patches,
        // proving they were persisted into the local writer chain.
        let mut fresh = Materializer::new(graph(), GraphConfig::default());
        let refreshed = fresh.materialize(&mut local, MaterializeOptions::default()).unwrap();
        assert!(refreshed.state.node_alive.contains(&"user:b".to_string()));
    }

    struct StubTransport {
        failures_remaining: RefCell<u32>,
        response: SyncResponse,
    }

    impl SyncTransport for StubTransport {
        fn send_sync_request(
            &mut self,
            _remote: &str,
            _request: &SyncRequest,
            _timeout: Duration,
            _abort: &AbortSignal,
        ) -> Result<SyncResponse, SyncError> {
            let mut remaining = self.failures_remaining.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Network { reason: "stub failure".to_string() });
            }
            Ok(self.response.clone())
        }
    }

    #[test]
    fn sync_with_retries_past_transient_failures() {
        let mut persistence = InMemoryPersistence::new();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();

        let mut controller = SyncController::new(
            graph(),
            SyncPolicy { base_delay_ms: 1, max_delay_ms: 2, ..SyncPolicy::default() },
        );
        let mut transport = StubTransport { failures_remaining: RefCell::new(2), response: SyncResponse::default() };
        let abort = AbortSignal::new();

        controller.sync_with(&mut persistence, &mut materializer, &mut transport, "remote://peer", &abort).unwrap();
    }

    #[test]
    fn sync_with_does_not_retry_protocol_errors() {
        struct AlwaysProtocolError;
        impl SyncTransport for AlwaysProtocolError {
            fn send_sync_request(
                &mut self,
                _remote: &str,
                _request: &SyncRequest,
                _timeout: Duration,
                _abort: &AbortSignal,
            ) -> Result<SyncResponse, SyncError> {
                Err(SyncError::Protocol { reason: "bad body".to_string() })
            }
        }

        let mut persistence = InMemoryPersistence::new();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();

        let mut controller = SyncController::new(graph(), SyncPolicy::default());
        let mut transport = AlwaysProtocolError;
        let abort = AbortSignal::new();

        let err = controller
            .sync_with(&mut persistence, &mut materializer, &mut transport, "remote://peer", &abort)
            .unwrap_err();
        assert_eq!(err.error_code(), "E_SYNC_PROTOCOL");
    }

    #[test]
    fn sync_with_honors_pre_aborted_signal() {
        struct NeverCalled;
        impl SyncTransport for NeverCalled {
            fn send_sync_request(
                &mut self,
                _remote: &str,
                _request: &SyncRequest,
                _timeout: Duration,
                _abort: &AbortSignal,
            ) -> Result<SyncResponse, SyncError> {
                panic!("transport should not be invoked once aborted");
            }
        }

        let mut persistence = InMemoryPersistence::new();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();

        let mut controller = SyncController::new(graph(), SyncPolicy::default());
        let mut transport = NeverCalled;
        let abort = AbortSignal::new();
        abort.abort();

        let err = controller
            .sync_with(&mut persistence, &mut materializer, &mut transport, "remote://peer", &abort)
            .unwrap_err();
        assert!(matches!(err, WarpError::OperationAborted { .. }));
    }
}
