//! Canonical ops hashing and the audit receipt service.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{instrument, warn};

use crate::audit::{render_commit_message, Trailer};
use crate::error::AuditError;
use crate::model::{GraphName, WriterId};
use crate::persistence::{Persistence, TreeEntry};
use crate::reducer::TickReceipt;
use crate::util::to_hex;

/// Domain separator prefixed to the canonical ops JSON before hashing, so
/// an ops digest can never collide with a plain SHA-256 over the same
/// bytes computed for an unrelated purpose.
const OPS_DIGEST_DOMAIN_SEPARATOR: &[u8] = b"git-warp/ops/v1\0";

/// 64 ASCII zeros: the `prevAuditCommit` sentinel for a genesis receipt
/// against a 64-character (SHA-256) OID backend. A 40-character (SHA-1)
/// backend would slice the first 40 characters of this constant instead.
pub const ZERO_HASH_64: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Receipt schema version. Fixed at 1; `tickStart == tickEnd` only holds in
/// this version.
pub const RECEIPT_SCHEMA_VERSION: u32 = 1;

/// Serialize `receipt.ops` as key-sorted JSON, suitable for hashing. Since
/// `serde_json::Value`'s object map is key-sorted by construction (this
/// crate does not enable the `preserve_order` feature), round-tripping
/// through `Value` is sufficient to canonicalize nested object keys;
/// arrays are passed through in their original order.
///
/// # Errors
///
/// Returns an error only if the op list fails to serialize, which does not
/// happen for well-formed `TickReceipt`s.
pub fn canonical_ops_json(receipt: &TickReceipt) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(&receipt.ops)?;
    serde_json::to_string(&value)
}

/// `SHA-256(domain_separator ++ canonical_ops_json(ops))`, hex-encoded.
///
/// # Errors
///
/// Propagates a canonicalization failure from [`canonical_ops_json`].
pub fn ops_digest(receipt: &TickReceipt) -> Result<String, serde_json::Error> {
    let canonical = canonical_ops_json(receipt)?;
    let mut hasher = Sha256::new();
    hasher.update(OPS_DIGEST_DOMAIN_SEPARATOR);
    hasher.update(canonical.as_bytes());
    Ok(to_hex(&hasher.finalize()))
}

/// Fixed nine-field audit receipt record. Field declaration order matches
/// the required sorted-key CBOR encoding exactly:
/// `dataCommit, graphName, opsDigest, prevAuditCommit, tickEnd, tickStart,
/// timestamp, version, writerId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    /// SHA of the data commit this receipt attests to.
    pub data_commit: String,
    /// The graph name.
    pub graph_name: String,
    /// `SHA-256(domain_separator ++ canonical_ops_json(ops))`.
    pub ops_digest: String,
    /// Previous audit commit SHA, or [`ZERO_HASH_64`] (trimmed to the same
    /// length as `data_commit`) for a genesis receipt.
    pub prev_audit_commit: String,
    /// Last patch Lamport tick covered by this receipt.
    pub tick_end: u64,
    /// First patch Lamport tick covered by this receipt.
    pub tick_start: u64,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    /// Always [`RECEIPT_SCHEMA_VERSION`].
    pub version: u32,
    /// The writer this receipt chain belongs to.
    pub writer_id: String,
}

impl Receipt {
    /// Canonical CBOR encoding with the fixed nine-field key order.
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

/// Running counters for an [`AuditReceiptService`], exposed by
/// [`AuditReceiptService::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStats {
    /// Receipts successfully committed.
    pub committed: u64,
    /// Receipts that failed to commit (any reason).
    pub failed: u64,
    /// Receipts skipped outright (degraded state, cross-writer).
    pub skipped: u64,
}

/// Outcome of [`AuditReceiptService::record`]. The audit path never
/// propagates errors to the data-commit caller; this is the entire
/// reporting surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The receipt was committed; carries the new audit commit SHA.
    Committed(String),
    /// The receipt was not committed, but no error was raised to the
    /// caller (see [`AuditStats`] for counts).
    Skipped {
        /// Why this receipt was skipped.
        reason: String,
    },
}

/// Builds and appends audit receipts to a writer's audit chain. Best
/// effort: every failure is caught, counted, and logged rather than
/// propagated to the data-commit caller.
#[derive(Debug)]
pub struct AuditReceiptService<P> {
    persistence: P,
    graph: GraphName,
    writer: WriterId,
    consecutive_cas_conflicts: u32,
    degraded: bool,
    stats: AuditStats,
}

impl<P: Persistence> AuditReceiptService<P> {
    /// Build a service for `writer`'s audit chain within `graph`.
    pub const fn new(persistence: P, graph: GraphName, writer: WriterId) -> Self {
        Self {
            persistence,
            graph,
            writer,
            consecutive_cas_conflicts: 0,
            degraded: false,
            stats: AuditStats { committed: 0, failed: 0, skipped: 0 },
        }
    }

    /// Current running counters.
    #[must_use]
    pub const fn stats(&self) -> AuditStats {
        self.stats
    }

    /// Unwrap the backing persistence adapter, discarding this service's
    /// bookkeeping. Used by callers (and the verifier's tests) that need to
    /// hand the same store to another component after writing through it.
    pub fn into_persistence(self) -> P {
        self.persistence
    }

    /// Whether this service has entered the degraded state (two
    /// consecutive CAS conflicts) and is skipping commits.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Re-evaluate health: clears the degraded flag and conflict counter.
    /// The open question of when degraded state resets is resolved here by
    /// requiring an explicit reopen rather than an automatic timeout.
    pub fn reopen(&mut self) {
        self.degraded = false;
        self.consecutive_cas_conflicts = 0;
    }

    fn ref_name(&self) -> String {
        format!("refs/warp/{}/audit/{}", self.graph, self.writer)
    }

    /// Record a tick receipt, appending a commit to this writer's audit
    /// chain. Never returns an error to the caller; failures are counted
    /// and logged.
    #[instrument(skip(self, receipt), fields(writer = %self.writer))]
    pub fn record(
        &mut self,
        receipt: &TickReceipt,
        data_commit: &str,
        timestamp_ms: u64,
    ) -> RecordOutcome {
        if receipt.writer != self.writer.as_str() {
            self.stats.failed += 1;
            let err = AuditError::CrossWriterReceipt {
                receipt_writer: receipt.writer.clone(),
                service_writer: self.writer.to_string(),
            };
            warn!(code = err.error_code(), "rejecting cross-writer receipt");
            return RecordOutcome::Skipped { reason: err.error_code().to_string() };
        }

        if self.degraded {
            self.stats.skipped += 1;
            warn!(code = "AUDIT_DEGRADED", "skipping commit: service is degraded");
            return RecordOutcome::Skipped { reason: "AUDIT_DEGRADED".to_string() };
        }

        match self.try_commit(receipt, data_commit, timestamp_ms) {
            Ok(sha) => {
                self.consecutive_cas_conflicts = 0;
                self.stats.committed += 1;
                RecordOutcome::Committed(sha)
            }
            Err(CommitAttemptError::Cas) => {
                self.consecutive_cas_conflicts += 1;
                self.stats.failed += 1;
                if self.consecutive_cas_conflicts >= 2 {
                    self.degraded = true;
                    warn!(writer = %self.writer, "audit service entering degraded state");
                }
                RecordOutcome::Skipped { reason: "audit ref CAS conflict".to_string() }
            }
            Err(CommitAttemptError::Other(reason)) => {
                self.stats.failed += 1;
                warn!(reason = %reason, "audit commit failed");
                RecordOutcome::Skipped { reason }
            }
        }
    }

    fn try_commit(
        &mut self,
        receipt: &TickReceipt,
        data_commit: &str,
        timestamp_ms: u64,
    ) -> Result<String, CommitAttemptError> {
        let digest = ops_digest(receipt).map_err(|e| CommitAttemptError::Other(e.to_string()))?;

        let ref_name = self.ref_name();
        let parent = self
            .persistence
            .read_ref(&ref_name)
            .map_err(|e| CommitAttemptError::Other(e.to_string()))?;

        let oid_len = data_commit.len();
        let prev_audit_commit = parent.clone().unwrap_or_else(|| ZERO_HASH_64[..oid_len].to_string());

        let record = Receipt {
            data_commit: data_commit.to_string(),
            graph_name: self.graph.to_string(),
            ops_digest: digest.clone(),
            prev_audit_commit,
            tick_end: receipt.lamport,
            tick_start: receipt.lamport,
            timestamp: timestamp_ms,
            version: RECEIPT_SCHEMA_VERSION,
            writer_id: self.writer.to_string(),
        };

        let bytes = record.encode().map_err(|e| CommitAttemptError::Other(e.to_string()))?;
        let blob_oid = self
            .persistence
            .write_blob(&bytes)
            .map_err(|e| CommitAttemptError::Other(e.to_string()))?;
        let tree_oid = self
            .persistence
            .write_tree(&[TreeEntry { path: "receipt.cbor".to_string(), oid: blob_oid }])
            .map_err(|e| CommitAttemptError::Other(e.to_string()))?;

        let trailers = vec![
            Trailer { key: "eg-schema".to_string(), value: "1".to_string() },
            Trailer { key: "eg-graph".to_string(), value: self.graph.to_string() },
            Trailer { key: "eg-writer".to_string(), value: self.writer.to_string() },
            Trailer { key: "eg-data-commit".to_string(), value: data_commit.to_string() },
            Trailer { key: "eg-ops-digest".to_string(), value: digest },
        ];
        let message = render_commit_message("audit receipt", &trailers);

        let parents: Vec<String> = parent.clone().into_iter().collect();
        let commit_sha = self
            .persistence
            .commit_node_with_tree(&tree_oid, &parents, &message)
            .map_err(|e| CommitAttemptError::Other(e.to_string()))?;

        self.persistence
            .compare_and_swap_ref(&ref_name, &commit_sha, parent.as_deref())
            .map_err(|_| CommitAttemptError::Cas)?;

        Ok(commit_sha)
    }
}

enum CommitAttemptError {
    Cas,
    Other(String),
}
