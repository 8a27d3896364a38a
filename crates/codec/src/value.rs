//! Dynamic values fed to and produced by the codec.

use std::collections::BTreeMap;

/// A decoded (or to-be-encoded) value tree.
///
/// `Seq` serves tuples, vectors and lists alike; `Record` serves structs and
/// union values. A union value is a record carrying its variant name under
/// the `"$"` key — struct variants flatten their fields into that same
/// record, every other variant keeps its payload under `"value"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Unsigned integer, also used for `Nat`.
    UInt(u64),
    /// Signed integer.
    Int(i64),
    /// UTF-8 text.
    Str(String),
    /// Ordered elements for `Tuple`, `Vector` and `List`.
    Seq(Vec<Value>),
    /// Ordered key/value entries for `Map`.
    Map(Vec<(Value, Value)>),
    /// Named fields for `Struct` and `Union` values.
    Record(BTreeMap<String, Value>),
}

/// Key under which a union value names its variant.
pub(crate) const UNION_TAG_KEY: &str = "$";

/// Key under which a non-struct union variant keeps its payload.
pub(crate) const UNION_VALUE_KEY: &str = "value";

impl Value {
    /// Build a `Record` from anything yielding `(name, value)` pairs.
    pub fn record<N, I>(fields: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Value)>,
    {
        Value::Record(fields.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }

    /// Build a union value for a non-struct variant.
    pub fn variant(tag: impl Into<String>, payload: Value) -> Self {
        Value::record([
            (UNION_TAG_KEY, Value::Str(tag.into())),
            (UNION_VALUE_KEY, payload),
        ])
    }

    /// Short shape name used in error reports.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Value::UInt(_) => "unsigned integer",
            Value::Int(_) => "signed integer",
            Value::Str(_) => "string",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "map",
            Value::Record(_) => "record",
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
