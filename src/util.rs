//! Small shared helpers that don't warrant their own crate dependency.

/// Lowercase hex encoding, since the only thing in this crate's dependency
/// stack that produces bytes (`sha2`) doesn't also provide a hex formatter.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}
