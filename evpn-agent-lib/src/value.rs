//! Heterogeneous scalar values carried in a [`Link`](crate::types::Link)'s attribute maps.

use std::collections::BTreeMap;
use std::fmt;

/// A single attribute value: bool, integer, or string.
///
/// Preserving the distinction (rather than stringifying everything up front)
/// is what lets the attribute translators in the link manager decide between
/// `on`/`off`, bare flag, or `key value` forms.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Ordered-iteration attribute map. A `BTreeMap` is used over a `HashMap` so
/// that attribute sync order is deterministic across runs, which matters for
/// idempotence tests that assert on the exact command sequence.
pub type AttrMap = BTreeMap<String, AttrValue>;

/// Decode an [`AttrValue`] out of a [`serde_json::Value`] the way the kernel's
/// `ip -j` JSON would represent it, for comparing against a desired attribute.
pub fn from_json(v: &serde_json::Value) -> Option<AttrValue> {
    match v {
        serde_json::Value::Bool(b) => Some(AttrValue::Bool(*b)),
        serde_json::Value::Number(n) => n.as_i64().map(AttrValue::Int),
        serde_json::Value::String(s) => Some(AttrValue::Str(s.clone())),
        _ => None,
    }
}
