use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InvalidArgumentError;

/// A validated writer identifier.
///
/// Appears as the last path segment of `refs/warp/<graph>/writers/<writer>`
/// and `refs/warp/<graph>/audit/<writer>`, and as the `writer` field of
/// [`crate::clock::EventId`]'s total order, so its byte representation is
/// load-bearing for tie-breaking, not just cosmetic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriterId(String);

impl WriterId {
    /// Validate and wrap a writer id.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidArgumentError::WriterId`] if `value` is empty or
    /// contains `/`, whitespace, or control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        let value = value.into();
        super::validate_ref_segment(&value).map_err(|reason| InvalidArgumentError::WriterId {
            value: value.clone(),
            reason: reason.to_string(),
        })?;
        Ok(Self(value))
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WriterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_id() {
        assert!(WriterId::new("alice").is_ok());
    }

    #[test]
    fn rejects_slash() {
        let err = WriterId::new("team/alice").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn orders_byte_wise() {
        let a = WriterId::new("alice").unwrap();
        let b = WriterId::new("bob").unwrap();
        assert!(a < b);
    }
}
