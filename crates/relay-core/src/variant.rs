//! Self-describing dynamic value exchanged between components through
//! the method table, in place of the source's name-keyed virtual call
//! with untyped arguments.

use std::collections::BTreeMap;
use std::fmt;

/// A tagged value: `null`, `int`, `float`, `bytes`, `string`, `list`, or
/// `map`. Small scalars live inline; `Bytes`/`String` reuse their own
/// small-buffer-optimised representations (`bytes::Bytes` is refcounted
/// and cheap to clone, `String`'s inline capacity covers short method
/// names and identifiers without a second heap allocation concept).
#[derive(Clone, Debug, PartialEq)]
pub enum Variant {
    Null,
    Int(i64),
    Float(f64),
    Bytes(bytes::Bytes),
    String(String),
    List(Vec<Variant>),
    Map(BTreeMap<String, Variant>),
}

impl Variant {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Variant::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&bytes::Bytes> {
        match self {
            Variant::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Variant]> {
        match self {
            Variant::List(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Variant>> {
        match self {
            Variant::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Null
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => write!(f, "null"),
            Variant::Int(v) => write!(f, "{v}"),
            Variant::Float(v) => write!(f, "{v}"),
            Variant::Bytes(v) => write!(f, "bytes[{}]", v.len()),
            Variant::String(v) => write!(f, "{v:?}"),
            Variant::List(v) => write!(f, "list[{}]", v.len()),
            Variant::Map(v) => write!(f, "map[{}]", v.len()),
        }
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_owned())
    }
}

impl From<bytes::Bytes> for Variant {
    fn from(v: bytes::Bytes) -> Self {
        Variant::Bytes(v)
    }
}

impl From<Vec<Variant>> for Variant {
    fn from(v: Vec<Variant>) -> Self {
        Variant::List(v)
    }
}

impl From<BTreeMap<String, Variant>> for Variant {
    fn from(v: BTreeMap<String, Variant>) -> Self {
        Variant::Map(v)
    }
}
