//! Materializer: discovers writer chains (or resumes from a checkpoint),
//! folds patches into state, caches the result with its adjacency views,
//! and drives checkpoint creation, subscriber notification, and tombstone
//! garbage collection as side effects of each materialize call.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::{debug, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::clock::VersionVector;
use crate::config::GraphConfig;
use crate::error::{MaterializeError, PersistError, WarpError};
use crate::model::{GraphName, PatchSha, WriterId};
use crate::patch::Patch;
use crate::persistence::{Persistence, TreeEntry};
use crate::provenance::ProvenanceIndex;
use crate::reducer;
use crate::state::WarpState;

const PATCH_BLOB_PATH: &str = "patch.cbor";
const CHECKPOINT_BLOB_PATH: &str = "checkpoint.cbor";

fn checkpoint_ref(graph: &GraphName) -> String {
    format!("refs/warp/{graph}/checkpoint")
}

pub(crate) fn writer_ref(graph: &GraphName, writer: &WriterId) -> String {
    format!("refs/warp/{graph}/writers/{writer}")
}

fn writers_ref_prefix(graph: &GraphName) -> String {
    format!("refs/warp/{graph}/writers/")
}

/// `nodeId -> [(neighborId, label)]`, sorted for deterministic queries.
pub type Adjacency = BTreeMap<String, Vec<(String, String)>>;

/// What a materialize call changed relative to the last notified state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// Node ids that became live.
    pub nodes_added: Vec<String>,
    /// Node ids that are no longer live.
    pub nodes_removed: Vec<String>,
    /// `(from, to, label)` edges that became live.
    pub edges_added: Vec<(String, String, String)>,
    /// `(from, to, label)` edges that are no longer live.
    pub edges_removed: Vec<(String, String, String)>,
    /// Composite property keys whose winning value changed.
    pub properties_changed: Vec<String>,
}

impl StateDiff {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes_added.is_empty()
            && self.nodes_removed.is_empty()
            && self.edges_added.is_empty()
            && self.edges_removed.is_empty()
            && self.properties_changed.is_empty()
    }
}

fn diff_states(old: Option<&WarpState>, new: &WarpState) -> StateDiff {
    let old_nodes: BTreeSet<&String> = old.map(|s| s.node_alive.elements().collect()).unwrap_or_default();
    let new_nodes: BTreeSet<&String> = new.node_alive.elements().collect();
    let old_edges: BTreeSet<&String> = old.map(|s| s.edge_alive.elements().collect()).unwrap_or_default();
    let new_edges: BTreeSet<&String> = new.edge_alive.elements().collect();

    let split = |key: &str| crate::keycodec::split_edge_key(key).map(|(f, t, l)| (f.to_string(), t.to_string(), l.to_string()));

    let mut properties_changed = Vec::new();
    for (key, reg) in &new.prop {
        let changed = match old.and_then(|s| s.prop.get(key)) {
            Some(old_reg) => old_reg.event_id != reg.event_id,
            None => true,
        };
        if changed {
            properties_changed.push(key.clone());
        }
    }

    StateDiff {
        nodes_added: new_nodes.difference(&old_nodes).map(|s| (*s).clone()).collect(),
        nodes_removed: old_nodes.difference(&new_nodes).map(|s| (*s).clone()).collect(),
        edges_added: new_edges.difference(&old_edges).filter_map(|k| split(k)).collect(),
        edges_removed: old_edges.difference(&new_edges).filter_map(|k| split(k)).collect(),
        properties_changed,
    }
}

fn tombstone_ratio(state: &WarpState) -> f64 {
    let live = (state.node_alive.len() + state.edge_alive.len()) as f64;
    let tombstoned = (state.node_alive.tombstone_count() + state.edge_alive.tombstone_count()) as f64;
    if live + tombstoned == 0.0 {
        0.0
    } else {
        tombstoned / (live + tombstoned)
    }
}

/// What to do with a chain commit while walking it backward.
pub(crate) enum WalkControl {
    /// Fold this patch and continue toward the parent.
    Include,
    /// Skip this patch (it's outside the requested window) but keep
    /// walking toward the parent.
    SkipContinue,
    /// Stop walking; this commit and everything behind it is excluded.
    Stop,
}

/// Walk a writer chain from `tip` toward genesis, decoding each commit's
/// `patch.cbor` and asking `control` what to do with it.
pub(crate) fn walk_chain<P: Persistence>(
    persistence: &P,
    tip: &str,
    mut control: impl FnMut(&Patch, &str) -> WalkControl,
) -> Result<Vec<(Patch, PatchSha)>, WarpError> {
    let mut out = Vec::new();
    let mut current = Some(tip.to_string());
    while let Some(sha) = current {
        let info = persistence.get_node_info(&sha)?;
        let tree = persistence.read_tree_oids(&info.tree)?;
        let blob_oid = tree
            .get(PATCH_BLOB_PATH)
            .ok_or_else(|| PersistError::NotFound { oid: sha.clone() })?;
        let bytes = persistence.read_blob(blob_oid)?;
        let patch: Patch = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| PersistError::Backend { reason: e.to_string() })?;

        match control(&patch, &sha) {
            WalkControl::Stop => break,
            WalkControl::SkipContinue => current = info.parents.first().cloned(),
            WalkControl::Include => {
                let patch_sha = PatchSha::new(sha.clone())?;
                current = info.parents.first().cloned();
                out.push((patch, patch_sha));
            }
        }
    }
    Ok(out)
}

pub(crate) fn discover_writers<P: Persistence>(persistence: &P, graph: &GraphName) -> Result<Vec<WriterId>, WarpError> {
    let prefix = writers_ref_prefix(graph);
    let mut writers = Vec::new();
    for ref_name in persistence.list_refs(&prefix)? {
        let id = ref_name.strip_prefix(&prefix).unwrap_or(&ref_name);
        writers.push(WriterId::new(id)?);
    }
    writers.sort();
    Ok(writers)
}

/// Whether the materializer's last-known view of the writer set is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// No materialize call has happened yet.
    None,
    /// The cached state reflects every writer's current tip.
    Fresh,
    /// At least one writer's tip has moved since the last materialize.
    Stale,
}

/// A point-in-time snapshot of materializer health, without triggering a
/// materialize call.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// Freshness of the cached state relative to the writer refs.
    pub cached_state: CacheStatus,
    /// Patches folded since the last checkpoint.
    pub patches_since_checkpoint: u64,
    /// Tombstone-to-total ratio in the cached state.
    pub tombstone_ratio: f64,
    /// Every writer currently known to this graph.
    pub writers: Vec<WriterId>,
    /// The cached causal frontier, or empty if never materialized.
    pub frontier: VersionVector,
}

/// Options controlling a single [`Materializer::materialize`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOptions {
    /// Replay only patches with `lamport <= ceiling`; bypasses checkpoints
    /// and GC, and is cached separately from the live head.
    pub lamport_ceiling: Option<u64>,
}

/// The materialized state plus everything derived from it for O(1) reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedState {
    /// The folded CRDT state.
    pub state: WarpState,
    /// Content hash of `state`, for convergence assertions.
    pub hash: String,
    /// `node -> [(neighbor, label)]` for outgoing edges.
    pub outgoing: Adjacency,
    /// `node -> [(neighbor, label)]` for incoming edges.
    pub incoming: Adjacency,
    /// Entity id -> patch shas that read or wrote it.
    pub provenance: ProvenanceIndex,
    tip_shas: BTreeMap<WriterId, Option<String>>,
    /// Patches folded since the last checkpoint (or since genesis, if none
    /// exists yet).
    pub patches_since_checkpoint: u64,
    /// Patches folded since the last tombstone GC (or checkpoint, which
    /// resets compaction pressure too).
    pub patches_since_compaction: u64,
}

fn build_cached_state(
    state: WarpState,
    provenance: ProvenanceIndex,
    tip_shas: BTreeMap<WriterId, Option<String>>,
    patches_since_checkpoint: u64,
) -> Result<CachedState, WarpError> {
    let hash = state.content_hash().map_err(|e| PersistError::Backend { reason: e.to_string() })?;
    let outgoing = state.outgoing_adjacency();
    let incoming = state.incoming_adjacency();
    Ok(CachedState {
        state,
        hash,
        outgoing,
        incoming,
        provenance,
        tip_shas,
        patches_since_checkpoint,
        patches_since_compaction: 0,
    })
}

/// Identifies a registered subscriber, for later [`Materializer::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// One registered subscriber plus its own deferred-replay flag.
///
/// `pending_replay` starts `true` so a subscriber added after state already
/// exists still gets a catch-up notification on its own first invocation,
/// even if the next materialize call computes an empty diff against what it
/// already had cached. It is consumed (set back to `false`) the moment this
/// subscriber is actually notified, independent of every other subscriber.
struct Subscriber {
    id: u64,
    callback: Box<dyn FnMut(&StateDiff)>,
    pending_replay: bool,
}

/// Discovers writer chains, folds patches, and caches the result for one
/// graph. Holds no persistence handle of its own; every method that needs
/// I/O takes one as a parameter.
pub struct Materializer {
    graph: GraphName,
    config: GraphConfig,
    cached: Option<CachedState>,
    ceiling_cache: BTreeMap<u64, CachedState>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    creating_checkpoint: bool,
    compaction_baseline_walked: u64,
}

impl Materializer {
    /// A fresh materializer for `graph`, with nothing cached yet.
    #[must_use]
    pub fn new(graph: GraphName, config: GraphConfig) -> Self {
        Self {
            graph,
            config,
            cached: None,
            ceiling_cache: BTreeMap::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            creating_checkpoint: false,
            compaction_baseline_walked: 0,
        }
    }

    /// The most recently materialized state, if `materialize` has been
    /// called at least once (with no Lamport ceiling).
    #[must_use]
    pub fn cached(&self) -> Option<&CachedState> {
        self.cached.as_ref()
    }

    /// Register a callback invoked with each [`StateDiff`] produced by a
    /// subsequent `materialize` call. Guaranteed to fire on its own first
    /// invocation even if that diff is empty, so a late subscriber still
    /// sees a catch-up notification.
    pub fn subscribe(&mut self, callback: impl FnMut(&StateDiff) + 'static) -> SubscriptionId {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.push(Subscriber { id, callback: Box::new(callback), pending_replay: true });
        SubscriptionId(id)
    }

    /// Remove a previously registered subscriber.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|s| s.id != id.0);
    }

    /// Force the next materialize call to notify every currently registered
    /// subscriber even if the computed diff is empty.
    pub fn request_replay(&mut self) {
        for subscriber in &mut self.subscribers {
            subscriber.pending_replay = true;
        }
    }

    /// Produce a consistent state per the documented decision order: a
    /// Lamport ceiling bypasses checkpoints and GC entirely; otherwise
    /// resume from the latest usable checkpoint, or discover every writer's
    /// chain from genesis if none exists.
    #[instrument(skip(self, persistence), fields(graph = %self.graph))]
    pub fn materialize<P: Persistence>(
        &mut self,
        persistence: &mut P,
        options: MaterializeOptions,
    ) -> Result<&CachedState, WarpError> {
        if let Some(ceiling) = options.lamport_ceiling {
            if !self.ceiling_cache.contains_key(&ceiling) {
                let cached = self.materialize_with_ceiling(persistence, ceiling)?;
                self.ceiling_cache.insert(ceiling, cached);
            }
            return Ok(self.ceiling_cache.get(&ceiling).expect("just inserted"));
        }

        let new_cached = self.materialize_full(persistence)?;
        self.apply_side_effects(persistence, new_cached)?;
        Ok(self.cached.as_ref().expect("apply_side_effects always sets cached"))
    }

    /// Whether any writer's tip has moved since the cached state was built,
    /// without materializing.
    pub fn has_frontier_changed<P: Persistence>(&self, persistence: &P) -> Result<bool, WarpError> {
        Ok(matches!(self.status(persistence)?.cached_state, CacheStatus::Stale | CacheStatus::None))
    }

    /// Fold patches obtained from a remote peer directly into the cached
    /// state, without re-discovering writer refs. Requires a prior
    /// `materialize()` call; runs the same side effects (subscriber
    /// notification, checkpoint creation, GC) as a normal materialize.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::SyncError::NoState`] if nothing has been
    /// materialized yet.
    pub fn fold_external_patches<P: Persistence>(
        &mut self,
        persistence: &mut P,
        patches: Vec<(Patch, PatchSha)>,
    ) -> Result<(), WarpError> {
        let cached = self.cached.clone().ok_or(crate::error::SyncError::NoState)?;
        let mut state = cached.state;
        let mut provenance = cached.provenance;
        for (patch, sha) in &patches {
            provenance.record(patch, sha);
        }
        let walked = patches.len() as u64;
        reducer::fold(&mut state, patches, false);
        let new_cached = build_cached_state(
            state,
            provenance,
            cached.tip_shas,
            cached.patches_since_checkpoint + walked,
        )?;
        self.apply_side_effects(persistence, new_cached)
    }

    /// A point-in-time health snapshot; never triggers a materialize call.
    pub fn status<P: Persistence>(&self, persistence: &P) -> Result<Status, WarpError> {
        let writers = discover_writers(persistence, &self.graph)?;

        let cached_state = match &self.cached {
            None => CacheStatus::None,
            Some(cached) => {
                let mut stale = cached.tip_shas.len() != writers.len();
                if !stale {
                    for writer in &writers {
                        let current = persistence.read_ref(&writer_ref(&self.graph, writer))?;
                        if cached.tip_shas.get(writer).cloned().flatten() != current {
                            stale = true;
                            break;
                        }
                    }
                }
                if stale { CacheStatus::Stale } else { CacheStatus::Fresh }
            }
        };

        let (patches_since_checkpoint, ratio, frontier) = match &self.cached {
            Some(cached) => (
                cached.patches_since_checkpoint,
                tombstone_ratio(&cached.state),
                cached.state.observed_frontier.clone(),
            ),
            None => (0, 0.0, VersionVector::new()),
        };

        Ok(Status {
            cached_state,
            patches_since_checkpoint,
            tombstone_ratio: ratio,
            writers,
            frontier,
        })
    }

    fn materialize_with_ceiling<P: Persistence>(&self, persistence: &P, ceiling: u64) -> Result<CachedState, WarpError> {
        let writers = discover_writers(persistence, &self.graph)?;
        let mut all_patches = Vec::new();
        let mut tip_shas = BTreeMap::new();
        for writer in &writers {
            let tip = persistence.read_ref(&writer_ref(&self.graph, writer))?;
            tip_shas.insert(writer.clone(), tip.clone());
            if let Some(tip) = tip {
                let patches = walk_chain(persistence, &tip, |patch, _| {
                    if patch.lamport <= ceiling {
                        WalkControl::Include
                    } else {
                        WalkControl::SkipContinue
                    }
                })?;
                all_patches.extend(patches);
            }
        }

        let mut state = WarpState::new();
        let mut provenance = ProvenanceIndex::new();
        for (patch, sha) in &all_patches {
            provenance.record(patch, sha);
        }
        let count = all_patches.len() as u64;
        reducer::fold(&mut state, all_patches, false);
        debug!(ceiling, patches_folded = count, "materialized with lamport ceiling");
        build_cached_state(state, provenance, tip_shas, count)
    }

    fn materialize_full<P: Persistence>(&self, persistence: &P) -> Result<CachedState, WarpError> {
        let writers = discover_writers(persistence, &self.graph)?;
        let mut tip_shas = BTreeMap::new();
        for writer in &writers {
            tip_shas.insert(writer.clone(), persistence.read_ref(&writer_ref(&self.graph, writer))?);
        }

        if let Some(checkpoint) = self.load_checkpoint(persistence)? {
            let mut state = checkpoint.state;
            let mut provenance = checkpoint.provenance;
            let mut all_patches = Vec::new();
            for writer in &writers {
                let Some(tip) = tip_shas.get(writer).cloned().flatten() else { continue };
                let boundary = checkpoint.writer_tips.get(writer).cloned().flatten();
                if Some(tip.clone()) == boundary {
                    continue;
                }
                let patches = walk_chain(persistence, &tip, |_, sha| {
                    if Some(sha.to_string()) == boundary { WalkControl::Stop } else { WalkControl::Include }
                })?;
                all_patches.extend(patches);
            }
            for (patch, sha) in &all_patches {
                provenance.record(patch, sha);
            }
            let count = all_patches.len() as u64;
            reducer::fold(&mut state, all_patches, false);
            debug!(patches_folded = count, "resumed materialization from checkpoint");
            return build_cached_state(state, provenance, tip_shas, count);
        }

        let mut state = WarpState::new();
        let mut provenance = ProvenanceIndex::new();
        let mut all_patches = Vec::new();
        for writer in &writers {
            let Some(tip) = tip_shas.get(writer).cloned().flatten() else { continue };
            all_patches.extend(walk_chain(persistence, &tip, |_, _| WalkControl::Include)?);
        }
        for (patch, sha) in &all_patches {
            provenance.record(patch, sha);
        }
        let count = all_patches.len() as u64;
        reducer::fold(&mut state, all_patches, false);
        debug!(patches_folded = count, writers = writers.len(), "materialized from genesis");
        build_cached_state(state, provenance, tip_shas, count)
    }

    fn load_checkpoint<P: Persistence>(&self, persistence: &P) -> Result<Option<Checkpoint>, WarpError> {
        let Some(sha) = persistence.read_ref(&checkpoint_ref(&self.graph))? else {
            return Ok(None);
        };
        let info = persistence.get_node_info(&sha)?;
        let tree = persistence.read_tree_oids(&info.tree)?;
        let blob_oid = tree
            .get(CHECKPOINT_BLOB_PATH)
            .ok_or_else(|| PersistError::NotFound { oid: sha.clone() })?;
        let bytes = persistence.read_blob(blob_oid)?;
        match Checkpoint::decode(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(MaterializeError::UnsupportedSchema { found, supported }) => {
                warn!(found, supported, "checkpoint schema unsupported; replaying from genesis");
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    fn apply_side_effects<P: Persistence>(&mut self, persistence: &mut P, mut new_cached: CachedState) -> Result<(), WarpError> {
        let walked = new_cached.patches_since_checkpoint;
        new_cached.patches_since_compaction = walked.saturating_sub(self.compaction_baseline_walked);

        let diff = diff_states(self.cached.as_ref().map(|c| &c.state), &new_cached.state);
        self.cached = Some(new_cached);

        let diff_is_empty = diff.is_empty();
        for subscriber in &mut self.subscribers {
            if diff_is_empty && !subscriber.pending_replay {
                continue;
            }
            let callback = &mut subscriber.callback;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(&diff)));
            if outcome.is_err() {
                warn!(subscriber_id = subscriber.id, "subscriber panicked; skipping it for this diff");
            }
            subscriber.pending_replay = false;
        }

        let threshold = self.config.checkpoint.patches_since_checkpoint_threshold;
        let should_checkpoint = !self.creating_checkpoint
            && self.cached.as_ref().is_some_and(|c| c.patches_since_checkpoint >= threshold);
        if should_checkpoint {
            self.creating_checkpoint = true;
            let result = self.create_checkpoint(persistence);
            self.creating_checkpoint = false;
            result?;
            self.compaction_baseline_walked = walked;
        }

        let gc = self.config.gc;
        let should_gc = self.cached.as_ref().is_some_and(|c| {
            c.patches_since_compaction >= gc.patches_since_compaction_threshold
                && tombstone_ratio(&c.state) >= gc.tombstone_ratio_floor
        });
        if should_gc {
            self.run_gc();
            self.compaction_baseline_walked = walked;
        }

        Ok(())
    }

    #[instrument(skip(self, persistence))]
    fn create_checkpoint<P: Persistence>(&mut self, persistence: &mut P) -> Result<(), WarpError> {
        let cached = self.cached.as_ref().expect("checkpoint creation requires cached state");
        let checkpoint = Checkpoint::new(cached.state.clone(), cached.provenance.clone(), cached.tip_shas.clone());
        let bytes = checkpoint.encode().map_err(|e| PersistError::Backend { reason: e.to_string() })?;
        let blob_oid = persistence.write_blob(&bytes)?;
        let tree_oid = persistence.write_tree(&[TreeEntry { path: CHECKPOINT_BLOB_PATH.to_string(), oid: blob_oid.clone() }])?;

        let ref_name = checkpoint_ref(&self.graph);
        let parent = persistence.read_ref(&ref_name)?;
        let trailers = vec![
            crate::audit::Trailer { key: "eg-schema".to_string(), value: checkpoint.schema_version.to_string() },
            crate::audit::Trailer { key: "eg-graph".to_string(), value: self.graph.to_string() },
            crate::audit::Trailer { key: "eg-checkpoint-oid".to_string(), value: blob_oid },
        ];
        let message = crate::audit::render_commit_message("checkpoint", &trailers);
        let parents: Vec<String> = parent.clone().into_iter().collect();
        let commit_sha = persistence.commit_node_with_tree(&tree_oid, &parents, &message)?;

        match persistence.compare_and_swap_ref(&ref_name, &commit_sha, parent.as_deref()) {
            Ok(()) => {}
            Err(PersistError::RefCasFailed { .. }) => {
                debug!("checkpoint CAS lost to a concurrent writer; leaving the newer one in place");
                return Ok(());
            }
            Err(other) => return Err(other.into()),
        }

        if let Some(cached) = self.cached.as_mut() {
            cached.patches_since_checkpoint = 0;
        }
        debug!(commit_sha = %commit_sha, "created checkpoint");
        Ok(())
    }

    fn run_gc(&mut self) {
        let Some(cached) = self.cached.as_mut() else { return };
        let frontier = cached.state.observed_frontier.clone();
        cached.state.node_alive.gc_tombstones(&frontier);
        cached.state.edge_alive.gc_tombstones(&frontier);
        cached.patches_since_compaction = 0;
        debug!("ran tombstone garbage collection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{DeletePolicy, PatchBuilder};
    use crate::config::{CheckpointPolicy, GcPolicy};
    use crate::persistence::InMemoryPersistence;

    fn graph() -> GraphName {
        GraphName::new("g1").unwrap()
    }

    fn writer(name: &str) -> WriterId {
        WriterId::new(name).unwrap()
    }

    fn commit_node(persistence: &mut InMemoryPersistence, writer: &WriterId, node: &str) {
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(persistence, graph(), writer.clone(), &state, DeletePolicy::Reject).unwrap();
        builder.add_node(node);
        builder.commit(persistence, |_, _| {}).unwrap();
    }

    #[test]
    fn materializes_from_genesis_across_writers() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");
        commit_node(&mut persistence, &writer("bob"), "user:b");

        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        let cached = materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert!(cached.state.node_alive.contains(&"user:a".to_string()));
        assert!(cached.state.node_alive.contains(&"user:b".to_string()));
    }

    #[test]
    fn rematerializing_with_no_new_patches_keeps_state() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        let hash1 = materializer.cached().unwrap().hash.clone();
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(materializer.cached().unwrap().hash, hash1);
    }

    #[test]
    fn subscriber_sees_newly_added_node() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let seen: std::rc::Rc<std::cell::RefCell<Vec<StateDiff>>> = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.subscribe(move |diff| seen_clone.borrow_mut().push(diff.clone()));

        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].nodes_added, vec!["user:a".to_string()]);
    }

    #[test]
    fn a_panicking_subscriber_does_not_starve_the_others() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let seen: std::rc::Rc<std::cell::RefCell<Vec<StateDiff>>> = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.subscribe(|_diff| panic!("boom"));
        materializer.subscribe(move |diff| seen_clone.borrow_mut().push(diff.clone()));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            materializer.materialize(&mut persistence, MaterializeOptions::default())
        }));
        assert!(result.is_ok(), "materialize itself must not panic");
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn a_subscriber_added_after_state_exists_gets_its_own_catch_up_notification() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let early_count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let early_clone = early_count.clone();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.subscribe(move |_| *early_clone.borrow_mut() += 1);
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(*early_count.borrow(), 1, "early subscriber notified on the real diff");

        let late_count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let late_clone = late_count.clone();
        materializer.subscribe(move |_| *late_clone.borrow_mut() += 1);

        // Nothing new committed: the next materialize computes an empty
        // diff. The late subscriber must still fire on its own first
        // notification; the early one, already past its first notification,
        // must not fire again.
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(*late_count.borrow(), 1, "late subscriber gets its own catch-up notification");
        assert_eq!(*early_count.borrow(), 1, "early subscriber is not re-notified on an empty diff");
    }

    #[test]
    fn empty_diff_does_not_notify_unless_replay_requested() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let count = std::rc::Rc::new(std::cell::RefCell::new(0));
        let count_clone = count.clone();
        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.subscribe(move |_| *count_clone.borrow_mut() += 1);

        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(*count.borrow(), 1);

        materializer.request_replay();
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn lamport_ceiling_excludes_later_patches_and_bypasses_checkpointing() {
        let mut persistence = InMemoryPersistence::new();
        let w = writer("alice");
        let state = WarpState::new();
        let mut builder = PatchBuilder::new(&persistence, graph(), w.clone(), &state, DeletePolicy::Reject).unwrap();
        builder.add_node("user:a");
        let outcome1 = builder.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome1.patch.lamport, 1);

        let mut builder2 = PatchBuilder::new(&persistence, graph(), w, &state, DeletePolicy::Reject).unwrap();
        builder2.add_node("user:b");
        let outcome2 = builder2.commit(&mut persistence, |_, _| {}).unwrap();
        assert_eq!(outcome2.patch.lamport, 2);

        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        let options = MaterializeOptions { lamport_ceiling: Some(1) };
        let cached = materializer.materialize(&mut persistence, options).unwrap();
        assert!(cached.state.node_alive.contains(&"user:a".to_string()));
        assert!(!cached.state.node_alive.contains(&"user:b".to_string()));
        assert!(materializer.cached().is_none());
    }

    #[test]
    fn checkpoint_created_once_threshold_crossed_and_resume_still_converges() {
        let mut persistence = InMemoryPersistence::new();
        let w = writer("alice");
        for i in 0..3 {
            let state = WarpState::new();
            let mut builder = PatchBuilder::new(&persistence, graph(), w.clone(), &state, DeletePolicy::Reject).unwrap();
            builder.add_node(format!("user:{i}"));
            builder.commit(&mut persistence, |_, _| {}).unwrap();
        }

        let mut config = GraphConfig::default();
        config.checkpoint = CheckpointPolicy { patches_since_checkpoint_threshold: 2, schema_version: crate::checkpoint::CHECKPOINT_SCHEMA_VERSION };

        let mut materializer = Materializer::new(graph(), config);
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert!(persistence.read_ref(&checkpoint_ref(&graph())).unwrap().is_some());

        let hash_before = materializer.cached().unwrap().hash.clone();

        let mut resumed = Materializer::new(graph(), GraphConfig::default());
        let resumed_cached = resumed.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(resumed_cached.hash, hash_before);
    }

    #[test]
    fn status_reports_stale_after_a_new_commit() {
        let mut persistence = InMemoryPersistence::new();
        commit_node(&mut persistence, &writer("alice"), "user:a");

        let mut materializer = Materializer::new(graph(), GraphConfig::default());
        materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(materializer.status(&persistence).unwrap().cached_state, CacheStatus::Fresh);

        commit_node(&mut persistence, &writer("bob"), "user:b");
        assert_eq!(materializer.status(&persistence).unwrap().cached_state, CacheStatus::Stale);
        assert!(materializer.has_frontier_changed(&persistence).unwrap());
    }

    #[test]
    fn gc_runs_once_compaction_threshold_and_ratio_are_crossed() {
        let mut persistence = InMemoryPersistence::new();
        let w = writer("alice");
        let mut state = WarpState::new();
        {
            let mut builder = PatchBuilder::new(&persistence, graph(), w.clone(), &state, DeletePolicy::Reject).unwrap();
            builder.add_node("user:a");
            let outcome = builder.commit(&mut persistence, |_, _| {}).unwrap();
            reducer::fold(&mut state, vec![(outcome.patch, PatchSha::new("a".repeat(40)).unwrap())], false);
        }
        {
            let mut builder = PatchBuilder::new(&persistence, graph(), w, &state, DeletePolicy::Reject).unwrap();
            builder.remove_node("user:a").unwrap();
            builder.commit(&mut persistence, |_, _| {}).unwrap();
        }

        let mut config = GraphConfig::default();
        config.gc = GcPolicy { patches_since_compaction_threshold: 1, tombstone_ratio_floor: 0.1 };

        let mut materializer = Materializer::new(graph(), config);
        let cached = materializer.materialize(&mut persistence, MaterializeOptions::default()).unwrap();
        assert_eq!(cached.state.node_alive.tombstone_count(), 0);
    }
}
