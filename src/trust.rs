//! Trust evaluation, layered on top of (and orthogonal to) audit-chain
//! integrity verification.
//!
//! The verifier decides whether a chain is structurally sound; a
//! [`TrustPolicy`] decides whether a structurally sound chain should
//! actually be trusted (e.g. because its writer is on an allowlist, or its
//! receipts are independently signed). This crate ships only the trivial
//! policy — reputation and allowlist logic belong to the embedding
//! application.

use crate::audit::ChainReport;

/// A pluggable trust verdict layered on top of an integrity verdict.
pub trait TrustPolicy {
    /// Whether `chain`'s writer should be trusted, given its integrity
    /// report.
    fn trust(&self, chain: &ChainReport) -> bool;
}

/// Trusts every writer whose chain passed integrity verification, and no
/// others. The default policy: a structurally valid chain is trusted, a
/// broken one is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysTrust;

impl TrustPolicy for AlwaysTrust {
    fn trust(&self, chain: &ChainReport) -> bool {
        chain.status.is_integrity_sound()
    }
}
