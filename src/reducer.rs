//! The join reducer: folds an ordered sequence of patches into a
//! [`WarpState`], optionally emitting a [`TickReceipt`] per patch.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::clock::EventId;
use crate::crdt::orset::AddOutcome;
use crate::model::PatchSha;
use crate::patch::{Op, Patch, PropTarget};
use crate::state::WarpState;

/// Outcome of applying a single op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpResult {
    /// The op changed state.
    Applied,
    /// The op was a no-op: the dot (or removal) had already been folded.
    Redundant,
    /// An LWW register kept a higher `EventId`; this write lost.
    Superseded,
    /// The add's dot was already present in the tombstone set.
    Tombstoned,
}

/// Per-op record inside a [`TickReceipt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutcome {
    /// Op name (`"NodeAdd"`, `"PropSet"`, ...).
    pub op: String,
    /// The entity or composite key the op targeted.
    pub target: String,
    /// What happened when this op was folded.
    pub result: OpResult,
    /// Free-text detail, set for `Superseded`/`Tombstoned`/`Redundant`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// One receipt per folded patch: `{ patchSha, writer, lamport, ops }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReceipt {
    /// SHA of the commit carrying the patch.
    pub patch_sha: PatchSha,
    /// The writer that authored the patch.
    pub writer: String,
    /// The patch's Lamport timestamp.
    pub lamport: u64,
    /// One outcome per op, in op-index order.
    pub ops: Vec<OpOutcome>,
}

/// Fold `patches` into `state` in place.
///
/// `patches` is re-sorted internally by `(lamport, writer, patch_sha)` —
/// the reducer does not trust caller-supplied order, so the same patch
/// multiset always produces bit-identical state regardless of arrival
/// order.
///
/// When `emit_receipts` is `true`, returns one [`TickReceipt`] per patch in
/// the order folded.
#[instrument(skip(state, patches), fields(patch_count = patches.len()))]
pub fn fold(
    state: &mut WarpState,
    mut patches: Vec<(Patch, PatchSha)>,
    emit_receipts: bool,
) -> Vec<TickReceipt> {
    patches.sort_by(|(a, a_sha), (b, b_sha)| {
        a.lamport
            .cmp(&b.lamport)
            .then_with(|| a.writer.cmp(&b.writer))
            .then_with(|| a_sha.cmp(b_sha))
    });

    let mut receipts = Vec::with_capacity(if emit_receipts { patches.len() } else { 0 });
    for (patch, patch_sha) in patches {
        let receipt = fold_one(state, &patch, &patch_sha);
        if emit_receipts {
            receipts.push(receipt);
        }
    }
    receipts
}

fn fold_one(state: &mut WarpState, patch: &Patch, patch_sha: &PatchSha) -> TickReceipt {
    let mut ops = Vec::with_capacity(patch.ops.len());

    for (i, op) in patch.ops.iter().enumerate() {
        let event_id = EventId::new(
            patch.lamport,
            patch.writer.clone(),
            patch_sha.clone(),
            i.try_into().expect("op index fits u32"),
        );
        let outcome = apply_op(state, patch, op, event_id);
        trace!(op = op.name(), result = ?outcome.result, "folded op");
        ops.push(outcome);
    }

    state.observed_frontier.merge(&patch.context);
    for op in &patch.ops {
        for dot in op_dots(op) {
            state.observed_frontier.observe(dot);
        }
    }

    debug!(
        writer = %patch.writer,
        lamport = patch.lamport,
        op_count = patch.ops.len(),
        "patch folded"
    );

    TickReceipt {
        patch_sha: patch_sha.clone(),
        writer: patch.writer.to_string(),
        lamport: patch.lamport,
        ops,
    }
}

fn op_dots(op: &Op) -> Vec<&crate::clock::Dot> {
    match op {
        Op::NodeAdd { dot, .. } | Op::EdgeAdd { dot, .. } => vec![dot],
        Op::NodeRemove { observed, .. } | Op::EdgeRemove { observed, .. } => {
            observed.iter().collect()
        }
        Op::PropSet { .. } => vec![],
    }
}

fn apply_op(state: &mut WarpState, patch: &Patch, op: &Op, event_id: EventId) -> OpOutcome {
    match op {
        Op::NodeAdd { id, dot } => {
            let target = id.clone();
            if state.observed_frontier.contains(dot) {
                return OpOutcome {
                    op: op.name().to_string(),
                    target,
                    result: OpResult::Redundant,
                    reason: Some("dot already folded".to_string()),
                };
            }
            let outcome = state.node_alive.add(id.clone(), dot.clone());
            finish_add(op, target, outcome)
        }
        Op::NodeRemove { id, observed } => {
            let target = id.clone();
            let removed = state.node_alive.remove(id, observed);
            finish_remove(op, target, removed)
        }
        Op::EdgeAdd {
            from,
            to,
            label,
            dot,
        } => {
            let key = crate::keycodec::edge_key(from, to, label);
            if state.observed_frontier.contains(dot) {
                return OpOutcome {
                    op: op.name().to_string(),
                    target: key,
                    result: OpResult::Redundant,
                    reason: Some("dot already folded".to_string()),
                };
            }
            let outcome = state.edge_alive.add(key.clone(), dot.clone());
            if outcome == AddOutcome::AppliedNewlyAlive {
                state.edge_birth_event.entry(key.clone()).or_insert(event_id);
            }
            finish_add(op, key, outcome)
        }
        Op::EdgeRemove {
            from,
            to,
            label,
            observed,
        } => {
            let key = crate::keycodec::edge_key(from, to, label);
            let removed = state.edge_alive.remove(&key, observed);
            finish_remove(op, key, removed)
        }
        Op::PropSet { target, key, value } => {
            let _ = patch;
            let composite = composite_prop_key(target, key);
            let incoming = crate::crdt::LwwRegister::new(event_id.clone(), value.clone());
            match state.prop.get_mut(&composite) {
                None => {
                    state.prop.insert(composite.clone(), incoming);
                    OpOutcome {
                        op: op.name().to_string(),
                        target: composite,
                        result: OpResult::Applied,
                        reason: None,
                    }
                }
                Some(existing) => {
                    if existing.event_id == event_id {
                        OpOutcome {
                            op: op.name().to_string(),
                            target: composite,
                            result: OpResult::Redundant,
                            reason: Some("identical event id already applied".to_string()),
                        }
                    } else if existing.merge_reporting(&incoming) {
                        OpOutcome {
                            op: op.name().to_string(),
                            target: composite,
                            result: OpResult::Applied,
                            reason: None,
                        }
                    } else {
                        OpOutcome {
                            op: op.name().to_string(),
                            target: composite,
                            result: OpResult::Superseded,
                            reason: Some("register already held a greater EventId".to_string()),
                        }
                    }
                }
            }
        }
    }
}

fn finish_add(op: &Op, target: String, outcome: AddOutcome) -> OpOutcome {
    match outcome {
        AddOutcome::AppliedNewlyAlive | AddOutcome::AppliedAlreadyAlive => OpOutcome {
            op: op.name().to_string(),
            target,
            result: OpResult::Applied,
            reason: None,
        },
        AddOutcome::Tombstoned => OpOutcome {
            op: op.name().to_string(),
            target,
            result: OpResult::Tombstoned,
            reason: Some("dot already in tombstone set".to_string()),
        },
    }
}

fn finish_remove(op: &Op, target: String, removed: Vec<crate::clock::Dot>) -> OpOutcome {
    if removed.is_empty() {
        OpOutcome {
            op: op.name().to_string(),
            target,
            result: OpResult::Redundant,
            reason: Some("no currently-live observed dots".to_string()),
        }
    } else {
        OpOutcome {
            op: op.name().to_string(),
            target,
            result: OpResult::Applied,
            reason: None,
        }
    }
}

fn composite_prop_key(target: &PropTarget, key: &str) -> String {
    match target {
        PropTarget::Node { id } => crate::keycodec::node_prop_key(id, key),
        PropTarget::Edge { from, to, label } => crate::keycodec::edge_prop_key(from, to, label, key),
    }
}
