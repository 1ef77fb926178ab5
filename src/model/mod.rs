//! Validated identifier newtypes.
//!
//! [`WriterId`] and [`GraphName`] both end up as path segments in ref names
//! (`refs/warp/<graph>/writers/<writer>`), so both reject the same class of
//! input: empty strings, `/`, and ASCII whitespace/control characters.

mod graph_name;
mod patch_sha;
mod writer_id;

pub use graph_name::GraphName;
pub use patch_sha::PatchSha;
pub use writer_id::WriterId;

/// Validate a string as a ref path segment: non-empty, no `/`, no ASCII
/// whitespace or control characters.
fn validate_ref_segment(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("must not be empty");
    }
    if value.contains('/') {
        return Err("must not contain '/'");
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("must not contain whitespace or control characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert!(validate_ref_segment("").is_err());
    }

    #[test]
    fn rejects_slash() {
        assert!(validate_ref_segment("a/b").is_err());
    }

    #[test]
    fn rejects_whitespace_and_control() {
        assert!(validate_ref_segment("a b").is_err());
        assert!(validate_ref_segment("a\tb").is_err());
        assert!(validate_ref_segment("a\nb").is_err());
        assert!(validate_ref_segment("a\u{0}b").is_err());
    }

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_ref_segment("alice").is_ok());
        assert!(validate_ref_segment("writer-01_v2").is_ok());
    }
}
