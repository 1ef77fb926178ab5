//! The audit verifier: walks a writer's audit chain tip-to-genesis,
//! checking schema, OID shape, trailer/body agreement, chain linkage,
//! monotonicity, and writer/graph consistency.

use std::collections::BTreeMap;

use crate::audit::{parse_trailers, receipt::Receipt};
use crate::model::{GraphName, WriterId};
use crate::persistence::Persistence;

/// Outcome of verifying one writer's audit chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Walked tip to genesis (or to a `since` boundary) with no errors.
    Valid,
    /// Walked from the tip and stopped cleanly at a `since` boundary.
    Partial,
    /// A structural error: schema, OID shape, linkage, or monotonicity.
    BrokenChain,
    /// A trailer disagreed with the CBOR body it mirrors.
    DataMismatch,
    /// An operational failure: unreadable object, undecodable CBOR, or a
    /// `since` boundary never reached.
    Error,
}

impl ChainStatus {
    /// Whether this status represents a structurally sound chain. `Valid`
    /// and `Partial` both count; a separate [`crate::trust::TrustPolicy`]
    /// decides whether a sound chain should be trusted.
    #[must_use]
    pub const fn is_integrity_sound(self) -> bool {
        matches!(self, Self::Valid | Self::Partial)
    }
}

/// One finding surfaced while walking a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Stable code, e.g. `"TICK_MONOTONICITY"` or `"TRAILER_MISMATCH"`.
    pub code: String,
    /// The commit the finding concerns, if any.
    pub commit_sha: Option<String>,
    /// Human-readable detail.
    pub detail: String,
}

impl Finding {
    fn new(code: &str, commit_sha: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            commit_sha: commit_sha.map(str::to_string),
            detail: detail.into(),
        }
    }
}

/// Integrity report for a single writer's audit chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// The writer this chain belongs to.
    pub writer: String,
    /// Aggregate status.
    pub status: ChainStatus,
    /// Non-fatal findings (e.g. `TICK_GAP`, `TIP_MOVED_DURING_VERIFY`).
    pub warnings: Vec<Finding>,
    /// Fatal findings that determined `status`.
    pub errors: Vec<Finding>,
}

/// Aggregated result of verifying every writer's chain for a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyAllReport {
    /// One-line human-readable summary.
    pub summary: String,
    /// Per-writer reports.
    pub chains: Vec<ChainReport>,
    /// Whether every chain in the graph is integrity-sound.
    pub integrity_verdict: bool,
}

fn is_oid(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_zero_hash(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

struct Walker<'a, P> {
    persistence: &'a P,
    graph: &'a GraphName,
    writer: &'a WriterId,
    since: Option<&'a str>,
    warnings: Vec<Finding>,
    errors: Vec<Finding>,
}

enum StepOutcome {
    Continue(Option<String>),
    StoppedAtSince,
    Genesis,
}

impl<'a, P: Persistence> Walker<'a, P> {
    fn fetch_receipt(&mut self, sha: &str) -> Option<(Receipt, Vec<String>)> {
        let info = match self.persistence.get_node_info(sha) {
            Ok(info) => info,
            Err(e) => {
                self.errors.push(Finding::new("PERSIST_READ_FAILED", Some(sha), e.to_string()));
                return None;
            }
        };
        let entries = match self.persistence.read_tree_oids(&info.tree) {
            Ok(entries) => entries,
            Err(e) => {
                self.errors.push(Finding::new("PERSIST_READ_FAILED", Some(sha), e.to_string()));
                return None;
            }
        };
        let Some(blob_oid) = entries.get("receipt.cbor") else {
            self.errors.push(Finding::new(
                "RECEIPT_SCHEMA_INVALID",
                Some(sha),
                "commit tree has no receipt.cbor entry",
            ));
            return None;
        };
        let bytes = match self.persistence.read_blob(blob_oid) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.errors.push(Finding::new("PERSIST_READ_FAILED", Some(sha), e.to_string()));
                return None;
            }
        };
        let receipt: Receipt = match ciborium::from_reader(bytes.as_slice()) {
            Ok(r) => r,
            Err(e) => {
                self.errors.push(Finding::new("RECEIPT_SCHEMA_INVALID", Some(sha), e.to_string()));
                return None;
            }
        };

        if receipt.version != crate::audit::receipt::RECEIPT_SCHEMA_VERSION {
            self.errors.push(Finding::new(
                "RECEIPT_SCHEMA_INVALID",
                Some(sha),
                format!("unexpected schema version {}", receipt.version),
            ));
            return None;
        }
        if receipt.tick_start != receipt.tick_end {
            self.errors.push(Finding::new(
                "RECEIPT_SCHEMA_INVALID",
                Some(sha),
                "tickStart must equal tickEnd in schema version 1",
            ));
            return None;
        }

        Some((receipt, info.parents))
    }

    fn check_oid_shape(&mut self, sha: &str, receipt: &Receipt) -> bool {
        if !is_oid(&receipt.data_commit) {
            self.errors.push(Finding::new("OID_MALFORMED", Some(sha), "dataCommit is not a valid OID"));
            return false;
        }
        let zero = is_zero_hash(&receipt.prev_audit_commit) && receipt.prev_audit_commit.len() == receipt.data_commit.len();
        if !zero && !is_oid(&receipt.prev_audit_commit) {
            self.errors.push(Finding::new("OID_MALFORMED", Some(sha), "prevAuditCommit is not a valid OID"));
            return false;
        }
        if !zero && receipt.prev_audit_commit.len() != receipt.data_commit.len() {
            self.errors.push(Finding::new(
                "OID_MALFORMED",
                Some(sha),
                "prevAuditCommit length does not match dataCommit length",
            ));
            return false;
        }
        true
    }

    fn check_trailers(&mut self, sha: &str, message: &str, receipt: &Receipt) -> bool {
        let trailers: BTreeMap<String, String> = parse_trailers(message)
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect();
        let expect = [
            ("eg-schema", receipt.version.to_string()),
            ("eg-graph", receipt.graph_name.clone()),
            ("eg-writer", receipt.writer_id.clone()),
            ("eg-data-commit", receipt.data_commit.clone()),
            ("eg-ops-digest", receipt.ops_digest.clone()),
        ];
        let mut ok = true;
        for (key, expected) in expect {
            match trailers.get(key) {
                Some(actual) if actual == &expected => {}
                Some(actual) => {
                    self.errors.push(Finding::new(
                        "TRAILER_MISMATCH",
                        Some(sha),
                        format!("trailer {key} is '{actual}', body has '{expected}'"),
                    ));
                    ok = false;
                }
                None => {
                    self.errors.push(Finding::new("TRAILER_MISMATCH", Some(sha), format!("missing trailer {key}")));
                    ok = false;
                }
            }
        }
        ok
    }

    fn check_linkage(&mut self, sha: &str, receipt: &Receipt, parents: &[String]) -> bool {
        let is_genesis = is_zero_hash(&receipt.prev_audit_commit);
        match (is_genesis, parents.first()) {
            (true, None) => true,
            (true, Some(_)) => {
                self.errors.push(Finding::new("GENESIS_HAS_PARENTS", Some(sha), "genesis receipt has a Git parent"));
                false
            }
            (false, None) => {
                self.errors.push(Finding::new(
                    "CONTINUATION_NO_PARENT",
                    Some(sha),
                    "non-genesis receipt's commit has no Git parent",
                ));
                false
            }
            (false, Some(parent)) => {
                if parent != &receipt.prev_audit_commit {
                    self.errors.push(Finding::new(
                        "GIT_PARENT_MISMATCH",
                        Some(sha),
                        "prevAuditCommit does not match the commit's Git parent",
                    ));
                    false
                } else {
                    true
                }
            }
        }
    }

    fn check_identity(&mut self, sha: &str, receipt: &Receipt) -> bool {
        let mut ok = true;
        if receipt.writer_id != self.writer.as_str() {
            self.errors.push(Finding::new(
                "WRITER_MISMATCH",
                Some(sha),
                format!("receipt writer '{}' does not match chain writer", receipt.writer_id),
            ));
            ok = false;
        }
        if receipt.graph_name != self.graph.as_str() {
            self.errors.push(Finding::new(
                "GRAPH_MISMATCH",
                Some(sha),
                format!("receipt graph '{}' does not match chain graph", receipt.graph_name),
            ));
            ok = false;
        }
        ok
    }

    /// Process one commit; returns what to do next.
    fn step(&mut self, sha: &str, last_tick_start: &mut Option<u64>) -> StepOutcome {
        let Some((receipt, parents)) = self.fetch_receipt(sha) else {
            return StepOutcome::Genesis;
        };
        let message = match self.persistence.show_node(sha) {
            Ok(m) => m,
            Err(e) => {
                self.errors.push(Finding::new("PERSIST_READ_FAILED", Some(sha), e.to_string()));
                return StepOutcome::Genesis;
            }
        };

        self.check_oid_shape(sha, &receipt);
        self.check_trailers(sha, &message, &receipt);
        self.check_linkage(sha, &receipt, &parents);
        self.check_identity(sha, &receipt);

        if let Some(prev_start) = *last_tick_start {
            if receipt.tick_end >= prev_start {
                self.errors.push(Finding::new(
                    "TICK_MONOTONICITY",
                    Some(sha),
                    format!("tickEnd {} is not strictly less than previously-seen tickStart {prev_start}", receipt.tick_end),
                ));
            } else if prev_start - receipt.tick_end > 1 {
                self.warnings.push(Finding::new(
                    "TICK_GAP",
                    Some(sha),
                    format!("non-contiguous tick gap between {} and {prev_start}", receipt.tick_end),
                ));
            }
        }
        *last_tick_start = Some(receipt.tick_start);

        if Some(sha) == self.since {
            return StepOutcome::StoppedAtSince;
        }

        match parents.first() {
            Some(parent) => StepOutcome::Continue(Some(parent.clone())),
            None => StepOutcome::Genesis,
        }
    }
}

/// Walk `writer`'s audit chain for `graph`, tip-to-genesis (or to `since`,
/// inclusive, if given).
#[must_use]
pub fn verify_chain<P: Persistence>(
    persistence: &P,
    graph: &GraphName,
    writer: &WriterId,
    since: Option<&str>,
) -> ChainReport {
    let ref_name = format!("refs/warp/{graph}/audit/{writer}");

    let tip_before = match persistence.read_ref(&ref_name) {
        Ok(tip) => tip,
        Err(e) => {
            return ChainReport {
                writer: writer.to_string(),
                status: ChainStatus::Error,
                warnings: vec![],
                errors: vec![Finding::new("PERSIST_READ_FAILED", None, e.to_string())],
            };
        }
    };

    let Some(tip) = tip_before.clone() else {
        return ChainReport { writer: writer.to_string(), status: ChainStatus::Valid, warnings: vec![], errors: vec![] };
    };

    let mut walker = Walker { persistence, graph, writer, since, warnings: vec![], errors: vec![] };
    let mut cursor = Some(tip.clone());
    let mut last_tick_start: Option<u64> = None;
    let mut reached_since = since.is_none();

    while let Some(sha) = cursor.take() {
        if !walker.errors.is_empty() {
            break;
        }
        match walker.step(&sha, &mut last_tick_start) {
            StepOutcome::Continue(next) => cursor = next,
            StepOutcome::StoppedAtSince => {
                reached_since = true;
                break;
            }
            StepOutcome::Genesis => break,
        }
    }

    if since.is_some() && !reached_since && walker.errors.is_empty() {
        walker.errors.push(Finding::new("SINCE_NOT_FOUND", None, "since boundary not reached before genesis"));
    }

    let status = if !walker.errors.is_empty() {
        if walker.errors.iter().any(|f| f.code == "PERSIST_READ_FAILED" || f.code == "SINCE_NOT_FOUND") {
            ChainStatus::Error
        } else if walker.errors.iter().any(|f| f.code == "TRAILER_MISMATCH") {
            ChainStatus::DataMismatch
        } else {
            ChainStatus::BrokenChain
        }
    } else if since.is_some() {
        ChainStatus::Partial
    } else {
        ChainStatus::Valid
    };

    match persistence.read_ref(&ref_name) {
        Ok(tip_after) if tip_after != tip_before => {
            walker.warnings.push(Finding::new("TIP_MOVED_DURING_VERIFY", None, "audit ref moved while walking the chain"));
        }
        _ => {}
    }

    ChainReport { writer: writer.to_string(), status, warnings: walker.warnings, errors: walker.errors }
}

/// Verify every writer's audit chain for `graph`.
#[must_use]
pub fn verify_all<P: Persistence>(persistence: &P, graph: &GraphName) -> VerifyAllReport {
    let prefix = format!("refs/warp/{graph}/audit/");
    let mut writers: Vec<String> = persistence
        .list_refs(&prefix)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.strip_prefix(&prefix).map(str::to_string))
        .collect();
    writers.sort();

    let chains: Vec<ChainReport> = writers
        .iter()
        .filter_map(|w| WriterId::new(w.clone()).ok())
        .map(|writer| verify_chain(persistence, graph, &writer, None))
        .collect();

    let integrity_verdict = chains.iter().all(|c| c.status.is_integrity_sound());
    let sound = chains.iter().filter(|c| c.status.is_integrity_sound()).count();
    let summary = format!("{sound}/{} chains sound", chains.len());

    VerifyAllReport { summary, chains, integrity_verdict }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditReceiptService;
    use crate::persistence::InMemoryPersistence;
    use crate::reducer::{OpOutcome, OpResult, TickReceipt};

    fn tick(writer: &str, lamport: u64) -> TickReceipt {
        TickReceipt {
            patch_sha: crate::model::PatchSha::new("aaaaaaaa").unwrap(),
            writer: writer.to_string(),
            lamport,
            ops: vec![OpOutcome {
                op: "NodeAdd".to_string(),
                target: "user:alice".to_string(),
                result: OpResult::Applied,
                reason: None,
            }],
        }
    }

    #[test]
    fn empty_chain_is_valid() {
        let persistence = InMemoryPersistence::new();
        let graph = GraphName::new("g1").unwrap();
        let writer = WriterId::new("alice").unwrap();
        let report = verify_chain(&persistence, &graph, &writer, None);
        assert_eq!(report.status, ChainStatus::Valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn well_formed_chain_verifies_valid() {
        let persistence = InMemoryPersistence::new();
        let graph = GraphName::new("g1").unwrap();
        let writer = WriterId::new("alice").unwrap();
        let mut service = AuditReceiptService::new(persistence, graph.clone(), writer.clone());

        service.record(&tick("alice", 1), "a".repeat(64).as_str(), 1000);
        service.record(&tick("alice", 2), "b".repeat(64).as_str(), 1001);
        service.record(&tick("alice", 3), "c".repeat(64).as_str(), 1002);
        assert_eq!(service.stats().committed, 3);

        let report = verify_chain(&service.into_persistence(), &graph, &writer, None);
        assert_eq!(report.status, ChainStatus::Valid);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[test]
    fn tampered_trailer_is_data_mismatch() {
        use crate::audit::receipt::ops_digest;
        use crate::persistence::{BlobStore, CommitStore, RefStore, TreeEntry, TreeStore};

        let mut persistence = InMemoryPersistence::new();
        let graph = GraphName::new("g1").unwrap();
        let writer = WriterId::new("alice").unwrap();
        let ref_name = format!("refs/warp/{graph}/audit/{writer}");

        let tick_receipt = tick("alice", 1);
        let body = Receipt {
            data_commit: "a".repeat(64),
            graph_name: graph.to_string(),
            ops_digest: ops_digest(&tick_receipt).unwrap(),
            prev_audit_commit: crate::audit::ZERO_HASH_64.to_string(),
            tick_end: 1,
            tick_start: 1,
            timestamp: 1000,
            version: 1,
            writer_id: writer.to_string(),
        };
        let bytes = body.encode().unwrap();
        let blob_oid = persistence.write_blob(&bytes).unwrap();
        let tree_oid = persistence
            .write_tree(&[TreeEntry { path: "receipt.cbor".to_string(), oid: blob_oid }])
            .unwrap();
        let bad_message = "audit receipt\n\neg-schema: 1\neg-graph: g1\neg-writer: alice\neg-data-commit: deadbeef\neg-ops-digest: deadbeef";
        let sha = persistence.commit_node_with_tree(&tree_oid, &[], bad_message).unwrap();
        persistence.compare_and_swap_ref(&ref_name, &sha, None).unwrap();

        let report = verify_chain(&persistence, &graph, &writer, None);
        assert_eq!(report.status, ChainStatus::DataMismatch);
        assert!(report.errors.iter().any(|f| f.code == "TRAILER_MISMATCH"));
    }

    #[test]
    fn verify_all_aggregates_multiple_writers() {
        let persistence = InMemoryPersistence::new();
        let graph = GraphName::new("g1").unwrap();
        let alice = WriterId::new("alice").unwrap();
        let mut service = AuditReceiptService::new(persistence, graph.clone(), alice);
        service.record(&tick("alice", 1), "a".repeat(64).as_str(), 1000);
        let persistence = service.into_persistence();

        let bob = WriterId::new("bob").unwrap();
        let mut service = AuditReceiptService::new(persistence, graph.clone(), bob);
        service.record(&tick("bob", 1), "b".repeat(64).as_str(), 1000);
        let persistence = service.into_persistence();

        let report = verify_all(&persistence, &graph);
        assert_eq!(report.chains.len(), 2);
        assert!(report.integrity_verdict);
    }
}
