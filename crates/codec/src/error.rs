//! Codec failure surface.

use thiserror::Error;

/// Everything that can go wrong while packing or unpacking a value.
///
/// None of these are recoverable locally: the caller either handed the codec
/// a value that does not fit the schema, or bytes that were not produced by
/// the matching schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Integer widths must be 1..=64 bits.
    #[error("width {0} is outside the supported 1..=64 bit range")]
    InvalidWidth(u32),

    /// The value does not fit the declared field width.
    #[error("value {value} does not fit in {width} bits")]
    OutOfRange {
        /// Declared field width in bits.
        width: u32,
        /// Offending value, widened for display.
        value: i128,
    },

    /// The value's shape does not match the schema node.
    #[error("schema expected {expected}, value is {found}")]
    ShapeMismatch {
        /// What the schema called for.
        expected: &'static str,
        /// What the value actually was.
        found: &'static str,
    },

    /// A `Vector` value had the wrong number of elements.
    #[error("vector length mismatch: schema says {expected}, value has {found}")]
    VectorLength {
        /// Length declared by the schema.
        expected: usize,
        /// Length of the supplied sequence.
        found: usize,
    },

    /// A `Union` schema with no variants cannot encode anything.
    #[error("union has no variants")]
    EmptyUnion,

    /// The union tag named a variant the schema does not declare.
    #[error("unknown union variant `{0}`")]
    UnknownVariant(String),

    /// A decoded union ordinal does not name a variant.
    #[error("union tag {0} does not name a variant")]
    InvalidTag(u64),

    /// A struct value was missing a declared field.
    #[error("struct value is missing field `{0}`")]
    MissingField(String),

    /// The input ran out before the schema was satisfied.
    #[error("input ended before the schema was satisfied")]
    Truncated,

    /// Decoded string bytes were not valid UTF-8.
    #[error("decoded string is not valid UTF-8")]
    InvalidUtf8,
}
