//! Composite key construction for edges and properties.
//!
//! Three key shapes, all built from NUL-separated segments:
//!
//! - Edge key: `from\0to\0label`.
//! - Node-property key: `nodeId\0propKey`.
//! - Edge-property key: `\x01from\0to\0label\0propKey` — the leading
//!   `\x01` guarantees it can never collide with a node-property key,
//!   because no node id may begin with `\x01` (see [`is_valid_node_id`]).

const SEP: char = '\0';
const EDGE_PROP_PREFIX: char = '\u{1}';

/// Build an edge key from its endpoints and label.
#[must_use]
pub fn edge_key(from: &str, to: &str, label: &str) -> String {
    format!("{from}{SEP}{to}{SEP}{label}")
}

/// Split an edge key back into `(from, to, label)`. Returns `None` if the
/// key doesn't have exactly two NUL separators.
#[must_use]
pub fn split_edge_key(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, SEP);
    let from = parts.next()?;
    let to = parts.next()?;
    let label = parts.next()?;
    Some((from, to, label))
}

/// Build a node-property composite key.
#[must_use]
pub fn node_prop_key(node_id: &str, prop_key: &str) -> String {
    format!("{node_id}{SEP}{prop_key}")
}

/// Build an edge-property composite key.
#[must_use]
pub fn edge_prop_key(from: &str, to: &str, label: &str, prop_key: &str) -> String {
    format!("{EDGE_PROP_PREFIX}{from}{SEP}{to}{SEP}{label}{SEP}{prop_key}")
}

/// Whether a composite property key addresses an edge property (begins
/// with the `\x01` prefix) as opposed to a node property.
#[must_use]
pub fn is_edge_prop_key(key: &str) -> bool {
    key.starts_with(EDGE_PROP_PREFIX)
}

/// A node id may not begin with `\x01`, since that would let a node-prop key
/// collide with the edge-prop key namespace.
#[must_use]
pub fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.starts_with(EDGE_PROP_PREFIX)
}
