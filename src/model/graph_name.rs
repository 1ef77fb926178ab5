use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::InvalidArgumentError;

/// A validated graph name, the `<graph>` segment of `refs/warp/<graph>/...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphName(String);

impl GraphName {
    /// Validate and wrap a graph name.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidArgumentError::GraphName`] if `value` is empty or
    /// contains `/`, whitespace, or control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidArgumentError> {
        let value = value.into();
        super::validate_ref_segment(&value).map_err(|reason| InvalidArgumentError::GraphName {
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

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for GraphName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
