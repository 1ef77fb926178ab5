use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InvalidArgumentError;

/// The SHA of the commit whose tree holds a `patch.cbor` blob.
///
/// Constrained to lowercase hex, 4 to 64 characters, per the shape
/// [`crate::clock::EventId`]'s total order requires of its `patch_sha`
/// field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchSha(String);

impl PatchSha {
    /// Validate and wrap a patch SHA.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidArgumentError::PatchSha`] if `value` is not
    /// lowercase hex of length 4 to 64.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        let value = value.into();
        if !(4..=64).contains(&value.len()) {
            return Err(InvalidArgumentError::PatchSha {
                value,
                reason: "must be 4 to 64 characters".to_string(),
            });
        }
        if !value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(InvalidArgumentError::PatchSha {
                value,
                reason: "must be lowercase hex".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatchSha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PatchSha {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
