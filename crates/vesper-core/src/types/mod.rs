//! Typed values stored in the keyspace.
//!
//! A key maps to exactly one [`Value`] variant. Scalars (string, integer,
//! float) are distinct variants — `SET` adapts its argument to the
//! narrowest type that parses, so `INCR`/`DECR` work directly on integer
//! payloads and everything else is a binary-safe string.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

pub mod sorted_set;

pub use sorted_set::SortedSet;

/// A single typed payload stored at a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Binary-safe string.
    Str(Bytes),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Ordered list of binary-safe strings.
    List(VecDeque<Bytes>),
    /// Unordered set of unique string members.
    Set(HashSet<String>),
    /// Field → value map.
    Hash(HashMap<String, Bytes>),
    /// Score-ordered set of unique string members.
    SortedSet(Box<SortedSet>),
}

impl Value {
    /// The type name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::SortedSet(_) => "zset",
        }
    }

    /// Adapts a raw string payload to the narrowest value type that
    /// parses: integer, then float, then binary string.
    pub fn adapt(raw: Bytes) -> Value {
        if let Ok(s) = std::str::from_utf8(&raw) {
            if let Ok(n) = s.parse::<i64>() {
                return Value::Int(n);
            }
            if let Ok(f) = s.parse::<f64>() {
                if f.is_finite() {
                    return Value::Float(f);
                }
            }
        }
        Value::Str(raw)
    }

    /// Estimated heap footprint in bytes, used for memory accounting.
    ///
    /// These are rough per-element costs, not allocator-exact sizes;
    /// eviction only needs a consistent relative measure.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Str(b) => b.len(),
            Value::Int(_) | Value::Float(_) => 8,
            Value::List(items) => items.iter().map(|b| b.len() + 16).sum(),
            Value::Set(members) => members.iter().map(|m| m.len() + 48).sum(),
            Value::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len() + 56).sum(),
            Value::SortedSet(ss) => ss.memory_usage(),
        }
    }
}

/// Converts a possibly-negative rank range to concrete indices.
/// Negative indices count back from `len` (-1 = len-1). The returned
/// bounds are clamped to `[0, len-1]`; an empty range has start > stop.
pub(crate) fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    let s = if start < 0 { start + len } else { start }.max(0);
    let e = if stop < 0 { stop + len } else { stop }.min(len - 1);
    (s, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapt_integer() {
        assert_eq!(Value::adapt(Bytes::from("42")), Value::Int(42));
        assert_eq!(Value::adapt(Bytes::from("-7")), Value::Int(-7));
    }

    #[test]
    fn adapt_float() {
        assert_eq!(Value::adapt(Bytes::from("3.25")), Value::Float(3.25));
    }

    #[test]
    fn adapt_string() {
        assert_eq!(
            Value::adapt(Bytes::from("bar")),
            Value::Str(Bytes::from("bar"))
        );
        // infinities stay strings — scores parse them, SET does not
        assert_eq!(
            Value::adapt(Bytes::from("inf")),
            Value::Str(Bytes::from("inf"))
        );
    }

    #[test]
    fn adapt_binary_stays_string() {
        let raw = Bytes::from_static(&[0x00, 0xff, 0x10]);
        assert_eq!(Value::adapt(raw.clone()), Value::Str(raw));
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Str(Bytes::from("x")).type_name(), "string");
        assert_eq!(Value::Int(1).type_name(), "integer");
        assert_eq!(Value::SortedSet(Box::default()).type_name(), "zset");
    }

    #[test]
    fn normalize_range_negative_indices() {
        assert_eq!(normalize_range(0, -1, 3), (0, 2));
        assert_eq!(normalize_range(-2, -1, 3), (1, 2));
        assert_eq!(normalize_range(-10, 10, 3), (0, 2));
    }

    #[test]
    fn normalize_range_empty() {
        let (s, e) = normalize_range(2, 1, 3);
        assert!(s > e);
    }
}
