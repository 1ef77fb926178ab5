//! The tamper-evident audit subsystem: a parallel chain of signed receipts
//! binding each data commit to a digest of its ops, plus the verifier that
//! walks a chain checking schema, linkage, monotonicity, and trailer/body
//! agreement.

mod receipt;
mod verify;

pub use receipt::{AuditReceiptService, AuditStats, Receipt, RecordOutcome, ZERO_HASH_64};
pub use verify::{verify_all, verify_chain, ChainReport, ChainStatus, Finding, VerifyAllReport};

use serde::{Deserialize, Serialize};

/// One typed trailer line in a patch or audit commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    /// Trailer key (e.g. `"eg-schema"`), without the colon.
    pub key: String,
    /// Trailer value, never containing a newline.
    pub value: String,
}

/// Render a commit subject plus typed trailers in the fixed order callers
/// supply them, matching the `eg-*` trailer convention shared by patch and
/// audit commits.
#[must_use]
pub fn render_commit_message(subject: &str, trailers: &[Trailer]) -> String {
    let mut message = String::from(subject);
    message.push_str("\n\n");
    for (i, trailer) in trailers.iter().enumerate() {
        if i > 0 {
            message.push('\n');
        }
        message.push_str(&trailer.key);
        message.push_str(": ");
        message.push_str(&trailer.value);
    }
    message
}

/// Parse `key: value` trailer lines from a commit message's trailer block
/// (everything after the first blank line).
#[must_use]
pub fn parse_trailers(message: &str) -> Vec<Trailer> {
    let Some((_subject, rest)) = message.split_once("\n\n") else {
        return Vec::new();
    };
    rest.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(": ")?;
            Some(Trailer {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}
