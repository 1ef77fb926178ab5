use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A constrained, JSON-compatible property value.
///
/// Property values are a closed set: scalars, arrays, and nested maps of
/// those — never an arbitrary dynamic object. `Map` uses `BTreeMap` so two
/// semantically-equal values always compare (and canonically encode) the
/// same way regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    /// JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer. Property values never carry floats, so equality stays
    /// exact under merge and canonical encoding.
    Int(i64),
    /// A UTF-8 string.
    String(String),
    /// An ordered list of values.
    Array(Vec<Self>),
    /// A nested map, keys sorted for deterministic iteration.
    Map(BTreeMap<String, Self>),
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for PropValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip_nested() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), PropValue::Int(1));
        map.insert(
            "b".to_string(),
            PropValue::Array(vec![PropValue::String("x".into()), PropValue::Null]),
        );
        let value = PropValue::Map(map);

        let json = serde_json::to_string(&value).unwrap();
        let back: PropValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }

    #[test]
    fn cbor_round_trip() {
        let value = PropValue::Array(vec![PropValue::Bool(true), PropValue::Int(-5)]);
        let mut bytes = Vec::new();
        ciborium::into_writer(&value, &mut bytes).unwrap();
        let back: PropValue = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(value, back);
    }
}
