//! Error types for warp-graph.
//!
//! Every error explains what went wrong, why, and how to fix it where the
//! failure is user-actionable. Errors are organized by the category that
//! raises them and carry a stable machine-readable code for programmatic
//! handling (`error_code()`), mirroring the error propagation policy:
//! patch-commit errors bubble to the caller so it can retry, while audit
//! errors are counted rather than raised.

use serde::Serialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// The top-level error type for warp-graph.
///
/// Each variant delegates to a category-specific error enum that carries
/// contextual details. Use [`WarpError::error_code`] for a stable,
/// machine-readable code and [`WarpError::suggestion`] for an actionable
/// remediation hint.
#[derive(Debug, thiserror::Error)]
pub enum WarpError {
    /// Patch construction, validation, or commit failures.
    #[error(transparent)]
    Patch(#[from] PatchError),

    /// Materialization and checkpoint failures.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),

    /// Sync protocol failures.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Audit receipt and verification failures.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Persistence-port failures surfaced from the backing store.
    #[error(transparent)]
    Persist(#[from] PersistError),

    /// Malformed input (writer IDs, graph names, patch shas).
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgumentError),

    /// A cooperative operation was cancelled via its abort signal.
    #[error(
        "Error: operation '{operation}' aborted\nCause: {reason}\nFix: retry the operation; cancellation does not roll back work already applied."
    )]
    OperationAborted {
        /// Name of the aborted operation (e.g. `"syncWith"`).
        operation: String,
        /// Why the operation was aborted.
        reason: String,
    },
}

impl WarpError {
    /// Machine-readable error code (e.g. `"WRITER_CAS_CONFLICT"`).
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Patch(e) => e.error_code(),
            Self::Materialize(e) => e.error_code(),
            Self::Sync(e) => e.error_code(),
            Self::Audit(e) => e.error_code(),
            Self::Persist(e) => e.error_code(),
            Self::InvalidArgument(e) => e.error_code(),
            Self::OperationAborted { .. } => "OPERATION_ABORTED",
        }
    }

    /// Human-readable suggestion for how to recover.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::Patch(e) => e.suggestion(),
            Self::Materialize(e) => e.suggestion(),
            Self::Sync(e) => e.suggestion(),
            Self::Audit(e) => e.suggestion(),
            Self::Persist(e) => e.suggestion(),
            Self::InvalidArgument(e) => e.suggestion(),
            Self::OperationAborted { .. } => {
                "If cancellation was unintended, retry the operation.".into()
            }
        }
    }

    /// Structured error payload for programmatic callers.
    #[must_use]
    pub fn to_json_error(&self) -> JsonError {
        JsonError {
            error_code: self.error_code().to_string(),
            message: self.to_string(),
            suggestion: self.suggestion(),
        }
    }
}

/// JSON-serializable error payload.
#[derive(Debug, Clone, Serialize)]
pub struct JsonError {
    /// Machine-readable error code (e.g. `"WRITER_CAS_CONFLICT"`).
    pub error_code: String,
    /// Human-readable error message.
    pub message: String,
    /// Actionable suggestion for fixing the error.
    pub suggestion: String,
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.error_code, self.message)
    }
}

// ---------------------------------------------------------------------------
// PatchError
// ---------------------------------------------------------------------------

/// Errors from patch construction and commit.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// A patch with no ops was submitted to `commit()`.
    #[error(
        "Error: refusing to commit an empty patch\nCause: the builder accumulated zero ops\nFix: add at least one op before calling commit()."
    )]
    EmptyPatch,

    /// The writer's tip ref moved between builder construction and commit.
    #[error(
        "Error: writer tip changed since this builder was created\nCause: expected parent {expected_sha:?}, found {actual_sha:?} on the ref\nFix: rematerialize the graph and recreate the builder against the new tip, then retry."
    )]
    CasConflict {
        /// The tip SHA the builder expected (`None` for a fresh writer).
        expected_sha: Option<String>,
        /// The tip SHA actually found on the ref.
        actual_sha: Option<String>,
    },

    /// Deleting a node with incident edges under the `reject` policy.
    #[error(
        "Error: node '{node}' has {incident_edges} incident edge(s)\nCause: this builder's delete policy is `reject`\nFix: use the `cascade` policy to remove incident edges first, or `warn` to proceed and leave them dangling."
    )]
    NodeHasIncidentEdges {
        /// The node that could not be deleted.
        node: String,
        /// Number of edges still touching the node.
        incident_edges: usize,
    },

    /// `setEdgeProperty` referenced an edge absent from both this patch and
    /// current state.
    #[error(
        "Error: edge {from} -> {to} ({label}) does not exist\nCause: setEdgeProperty requires the edge to exist in this patch or in current state\nFix: add the edge with addEdge before setting a property on it."
    )]
    EdgeNotFound {
        /// Source node of the missing edge.
        from: String,
        /// Target node of the missing edge.
        to: String,
        /// Edge label.
        label: String,
    },

    /// `commitPatch` was invoked while another commit on the same writer
    /// was already in flight.
    #[error(
        "Error: a commit is already in progress for this writer\nCause: commitPatch is not reentrant\nFix: await the in-flight commit before issuing another."
    )]
    CommitInProgress,
}

impl PatchError {
    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyPatch => "EMPTY_PATCH",
            Self::CasConflict { .. } => "WRITER_CAS_CONFLICT",
            Self::NodeHasIncidentEdges { .. } => "INVALID_ARGUMENT",
            Self::EdgeNotFound { .. } => "NOT_FOUND",
            Self::CommitInProgress => "COMMIT_IN_PROGRESS",
        }
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::EmptyPatch => "Add at least one op before committing.".into(),
            Self::CasConflict { .. } => "Rematerialize and retry against the current tip.".into(),
            Self::NodeHasIncidentEdges { .. } => {
                "Use the `cascade` delete policy or remove incident edges first.".into()
            }
            Self::EdgeNotFound { .. } => "Add the edge before setting a property on it.".into(),
            Self::CommitInProgress => "Wait for the in-flight commit to finish.".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// MaterializeError
// ---------------------------------------------------------------------------

/// Errors from materialization and checkpointing.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// A checkpoint blob declared a schema newer than this build supports.
    #[error(
        "Error: checkpoint schema {found} is unsupported\nCause: this build understands checkpoint schemas up to {supported}\nFix: upgrade warp-graph, or materialize with a Lamport ceiling that bypasses the checkpoint."
    )]
    UnsupportedSchema {
        /// Schema version found in the checkpoint.
        found: u32,
        /// Highest schema version this build supports.
        supported: u32,
    },

    /// The persistence layer returned malformed checkpoint bytes.
    #[error(
        "Error: failed to decode checkpoint\nCause: {reason}\nFix: discard the checkpoint and replay from genesis."
    )]
    CorruptCheckpoint {
        /// Decode failure detail.
        reason: String,
    },
}

impl MaterializeError {
    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedSchema { .. } | Self::CorruptCheckpoint { .. } => {
                "E_SCHEMA_UNSUPPORTED"
            }
        }
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::UnsupportedSchema { .. } => {
                "Upgrade warp-graph or materialize with a Lamport ceiling.".into()
            }
            Self::CorruptCheckpoint { .. } => {
                "Discard the checkpoint and replay from genesis.".into()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

/// Errors from the sync controller.
///
/// `Network`, `Timeout`, and `RemoteServer` are retryable by the backoff
/// wrapper in `sync::retry`; `Protocol` and `RemoteUrl` are not.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// `applySyncResponse` was called with no cached state materialized yet.
    #[error(
        "Error: no cached state to apply a sync response to\nCause: materialize() has not been called on this graph instance\nFix: call materialize() before syncing."
    )]
    NoState,

    /// The cached state is stale relative to the frontier being synced.
    #[error(
        "Error: cached state is stale\nCause: the local frontier has moved since the last materialize()\nFix: rematerialize before syncing."
    )]
    StaleState,

    /// The remote URL is malformed or disallowed.
    #[error(
        "Error: invalid remote URL '{url}'\nCause: {reason}\nFix: check the remote address and retry."
    )]
    RemoteUrl {
        /// The offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A network-level failure while talking to the remote (retryable).
    #[error(
        "Error: network failure syncing with remote\nCause: {reason}\nFix: this is retried automatically; if it persists, check connectivity."
    )]
    Network {
        /// Underlying network error detail.
        reason: String,
    },

    /// The remote did not respond within the per-attempt timeout (retryable).
    #[error(
        "Error: sync attempt timed out after {timeout_ms}ms\nCause: the remote did not respond in time\nFix: this is retried automatically with backoff; consider raising timeoutMs."
    )]
    Timeout {
        /// Configured per-attempt timeout.
        timeout_ms: u64,
    },

    /// The remote returned a 5xx (retryable).
    #[error(
        "Error: remote returned server error {status}\nCause: {reason}\nFix: this is retried automatically; if it persists, check the remote's health."
    )]
    RemoteServer {
        /// HTTP-style status code.
        status: u16,
        /// Remote-provided detail, if any.
        reason: String,
    },

    /// The remote returned a 4xx, or a response that failed to parse
    /// (not retryable).
    #[error(
        "Error: sync protocol violation\nCause: {reason}\nFix: check that both peers run compatible warp-graph versions."
    )]
    Protocol {
        /// Protocol failure detail.
        reason: String,
    },
}

impl SyncError {
    /// Whether the retry wrapper in `sync::retry` should attempt this error
    /// again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::RemoteServer { .. }
        )
    }

    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NoState => "E_NO_STATE",
            Self::StaleState => "E_STALE_STATE",
            Self::RemoteUrl { .. } => "E_SYNC_REMOTE_URL",
            Self::Network { .. } => "E_SYNC_NETWORK",
            Self::Timeout { .. } => "E_SYNC_TIMEOUT",
            Self::RemoteServer { .. } => "E_SYNC_REMOTE",
            Self::Protocol { .. } => "E_SYNC_PROTOCOL",
        }
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::NoState | Self::StaleState => "Call materialize() before syncing.".into(),
            Self::RemoteUrl { .. } => "Check the remote address and retry.".into(),
            Self::Network { .. } | Self::Timeout { .. } | Self::RemoteServer { .. } => {
                "Retried automatically with backoff; check connectivity if it persists.".into()
            }
            Self::Protocol { .. } => "Check peer version compatibility.".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditError
// ---------------------------------------------------------------------------

/// Errors from the audit receipt service and verifier.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A tick receipt's writer does not match this audit service's writer.
    #[error(
        "Error: receipt writer '{receipt_writer}' does not match service writer '{service_writer}'\nCause: cross-writer audit commits are rejected to avoid polluting another writer's chain\nFix: route this receipt to the audit service for writer '{receipt_writer}'."
    )]
    CrossWriterReceipt {
        /// Writer recorded on the tick receipt.
        receipt_writer: String,
        /// Writer this audit service instance was constructed for.
        service_writer: String,
    },

    /// Two consecutive CAS conflicts put the service into degraded mode.
    #[error(
        "Error: audit service for writer '{writer}' is degraded\nCause: two consecutive CAS conflicts on the audit ref\nFix: this is best-effort and will not retry automatically; reopen the service to re-evaluate health."
    )]
    Degraded {
        /// The writer whose audit chain is degraded.
        writer: String,
    },

    /// A receipt's schema, OID shape, or field types failed validation.
    #[error(
        "Error: malformed audit receipt\nCause: {reason}\nFix: inspect commit {commit_sha} for corruption."
    )]
    SchemaInvalid {
        /// Schema violation detail.
        reason: String,
        /// The audit commit where the violation was found.
        commit_sha: String,
    },
}

impl AuditError {
    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::CrossWriterReceipt { .. } => "AUDIT_CROSS_WRITER",
            Self::Degraded { .. } => "AUDIT_DEGRADED",
            Self::SchemaInvalid { .. } => "RECEIPT_SCHEMA_INVALID",
        }
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::CrossWriterReceipt { receipt_writer, .. } => {
                format!("Route this receipt to writer '{receipt_writer}'s audit service.")
            }
            Self::Degraded { .. } => "Reopen the audit service to re-evaluate health.".into(),
            Self::SchemaInvalid { commit_sha, .. } => {
                format!("Inspect commit {commit_sha} for corruption.")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PersistError / InvalidArgumentError
// ---------------------------------------------------------------------------

/// Errors surfaced from a [`crate::persistence::Persistence`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// A read addressed an OID the backend does not have.
    #[error(
        "Error: object {oid} not found\nCause: the persistence backend has no object with this id\nFix: verify the OID was produced by this backend and was not garbage collected."
    )]
    NotFound {
        /// The missing object id.
        oid: String,
    },

    /// A ref compare-and-swap failed because the observed value differed.
    #[error(
        "Error: ref {name} CAS failed\nCause: expected {expected:?}, found {actual:?}\nFix: re-read the ref and retry with the current value."
    )]
    RefCasFailed {
        /// The ref name.
        name: String,
        /// The value the caller expected.
        expected: Option<String>,
        /// The value actually stored.
        actual: Option<String>,
    },

    /// A generic backend failure (I/O, serialization, etc).
    #[error("Error: persistence backend failure\nCause: {reason}\nFix: check the backend's health and retry.")]
    Backend {
        /// Backend-provided failure detail.
        reason: String,
    },
}

impl PersistError {
    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::RefCasFailed { .. } => "WRITER_CAS_CONFLICT",
            Self::Backend { .. } => "PERSIST_WRITE_FAILED",
        }
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        match self {
            Self::NotFound { .. } => "Verify the OID and that it wasn't garbage collected.".into(),
            Self::RefCasFailed { .. } => "Re-read the ref and retry with the current value.".into(),
            Self::Backend { .. } => "Check the backend's health and retry.".into(),
        }
    }
}

/// Errors for malformed identifiers (writer IDs, graph names, patch shas).
#[derive(Debug, thiserror::Error)]
pub enum InvalidArgumentError {
    /// A writer id contained characters illegal in a ref path segment.
    #[error(
        "Error: invalid writer id '{value}'\nCause: {reason}\nFix: writer ids must be non-empty and free of '/', whitespace, and control characters."
    )]
    WriterId {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A graph name contained characters illegal in a ref path segment.
    #[error(
        "Error: invalid graph name '{value}'\nCause: {reason}\nFix: graph names must be non-empty and free of '/', whitespace, and control characters."
    )]
    GraphName {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A `patchSha` did not match the lowercase-hex shape required by
    /// `EventId`'s total order.
    #[error(
        "Error: invalid patch sha '{value}'\nCause: {reason}\nFix: patch shas must be lowercase hex, 4 to 64 characters."
    )]
    PatchSha {
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl InvalidArgumentError {
    /// Machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        "INVALID_ARGUMENT"
    }

    /// Human-readable suggestion.
    #[must_use]
    pub fn suggestion(&self) -> String {
        "Fix the offending argument and retry.".into()
    }
}
