//! Graph configuration: checkpoint policy, GC policy, sync retry policy,
//! and authenticated-sync settings. TOML via `serde` + `toml`, matching the
//! teacher's `#[serde(default = "...")]` pattern for nested sections.
//!
//! This is config *data*, not CLI wiring — no surface for parsing process
//! arguments is added here.

use serde::{Deserialize, Serialize};

/// Top-level graph configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Checkpoint creation policy.
    pub checkpoint: CheckpointPolicy,
    /// Tombstone garbage collection policy.
    pub gc: GcPolicy,
    /// Sync retry/backoff policy.
    pub sync: SyncPolicy,
    /// Authenticated-sync (HMAC) settings.
    pub auth: AuthPolicy,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointPolicy::default(),
            gc: GcPolicy::default(),
            sync: SyncPolicy::default(),
            auth: AuthPolicy::default(),
        }
    }
}

/// When the materializer creates a new checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    /// Create a new checkpoint once this many patches have been folded
    /// since the last one.
    pub patches_since_checkpoint_threshold: u64,
    /// Checkpoint schema version to emit.
    pub schema_version: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            patches_since_checkpoint_threshold: 500,
            schema_version: crate::checkpoint::CHECKPOINT_SCHEMA_VERSION,
        }
    }
}

/// When the materializer runs tombstone garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    /// Run GC only after this many patches have been folded since the last
    /// compaction.
    pub patches_since_compaction_threshold: u64,
    /// Run GC only when the tombstone-to-live ratio exceeds this floor.
    pub tombstone_ratio_floor: f64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            patches_since_compaction_threshold: 1000,
            tombstone_ratio_floor: 0.25,
        }
    }
}

/// Jitter strategy for sync retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    /// No jitter: pure exponential backoff.
    None,
    /// Full jitter: uniform in `[0, computed_delay]`.
    Full,
    /// Decorrelated jitter: uniform in `[base, previous_delay * 3]`.
    Decorrelated,
}

/// Sync retry and backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Maximum retry attempts (not counting the first).
    pub retries: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter strategy applied to the computed delay.
    pub jitter: JitterKind,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum accepted sync request/response body size, in bytes.
    pub max_body_bytes: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: JitterKind::Decorrelated,
            timeout_ms: 30_000,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Authenticated-sync (HMAC-signed requests) settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPolicy {
    /// Whether outgoing requests are signed and incoming ones checked.
    pub enabled: bool,
    /// Identifier for the HMAC key in use, surfaced to the server side so
    /// it can select the matching key.
    pub key_id: String,
    /// Whether the server side rejects unsigned/invalid requests
    /// (`true`) or merely logs the mismatch (`false`).
    pub enforce: bool,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: String::new(),
            enforce: true,
        }
    }
}
