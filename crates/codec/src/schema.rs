//! Schema descriptions.

use crate::error::CodecError;

/// A recursive description of a bit layout.
///
/// Schemas are plain data: build them once, share them by reference. The
/// declared order of `Struct` fields is the wire order; `Union` variants are
/// numbered by the *alphabetical* order of their names regardless of the
/// declared order, and that numbering is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packed {
    /// Unsigned integer of the given bit width (1..=64).
    UInt(u32),
    /// Two's-complement signed integer of the given bit width (1..=64).
    Int(u32),
    /// Unary natural number: `n` one-bits followed by a zero-bit.
    Nat,
    /// Named fields in declared order.
    Struct(Vec<(String, Packed)>),
    /// Fixed heterogeneous sequence.
    Tuple(Vec<Packed>),
    /// Fixed-length homogeneous sequence; the length never hits the wire.
    Vector {
        /// Exact number of elements.
        len: usize,
        /// Element layout.
        elem: Box<Packed>,
    },
    /// Cons list: a one-bit before every element, a zero-bit terminator.
    List(Box<Packed>),
    /// Cons list of key/value pairs.
    Map {
        /// Key layout.
        key: Box<Packed>,
        /// Value layout.
        value: Box<Packed>,
    },
    /// Tagged choice between named variants.
    Union(Vec<(String, Packed)>),
    /// UTF-8 text, encoded as a cons list of 8-bit units.
    Str,
}

impl Packed {
    /// Build a `Struct` from anything yielding `(name, schema)` pairs.
    pub fn structure<N, I>(fields: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Packed)>,
    {
        Packed::Struct(fields.into_iter().map(|(n, p)| (n.into(), p)).collect())
    }

    /// Build a `Union` from anything yielding `(name, schema)` pairs.
    pub fn union<N, I>(variants: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Packed)>,
    {
        Packed::Union(variants.into_iter().map(|(n, p)| (n.into(), p)).collect())
    }

    /// Build a `List` of `elem`.
    pub fn list(elem: Packed) -> Self {
        Packed::List(Box::new(elem))
    }

    /// Build a `Vector` of exactly `len` elements.
    pub fn vector(len: usize, elem: Packed) -> Self {
        Packed::Vector {
            len,
            elem: Box::new(elem),
        }
    }

    /// Build a `Map` from `key` to `value`.
    pub fn map(key: Packed, value: Packed) -> Self {
        Packed::Map {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    /// Raw bytes travel as a list of octets.
    pub fn bytes() -> Self {
        Packed::list(Packed::UInt(8))
    }
}

/// Validate an integer field width.
pub(crate) fn check_width(width: u32) -> Result<(), CodecError> {
    if width == 0 || width > 64 {
        return Err(CodecError::InvalidWidth(width));
    }
    Ok(())
}

/// Number of tag bits for a union of `count` variants: `ceil(log2(count))`,
/// zero when there is a single variant.
pub(crate) fn union_tag_width(count: usize) -> u32 {
    debug_assert!(count > 0);
    usize::BITS - (count - 1).leading_zeros()
}

/// Variant names in wire-ordinal order (alphabetical), paired with their
/// index into the declared variant list.
pub(crate) fn wire_order(variants: &[(String, Packed)]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..variants.len()).collect();
    order.sort_by(|&a, &b| variants[a].0.cmp(&variants[b].0));
    order
}

/// Wire ordinal of the variant named `tag`, plus its declared index.
pub(crate) fn variant_ordinal(
    variants: &[(String, Packed)],
    tag: &str,
) -> Result<(u64, usize), CodecError> {
    if variants.is_empty() {
        return Err(CodecError::EmptyUnion);
    }
    let order = wire_order(variants);
    for (ordinal, &declared) in order.iter().enumerate() {
        if variants[declared].0 == tag {
            return Ok((ordinal as u64, declared));
        }
    }
    Err(CodecError::UnknownVariant(tag.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_width() {
        assert_eq!(union_tag_width(1), 0);
        assert_eq!(union_tag_width(2), 1);
        assert_eq!(union_tag_width(3), 2);
        assert_eq!(union_tag_width(4), 2);
        assert_eq!(union_tag_width(5), 3);
        assert_eq!(union_tag_width(8), 3);
        assert_eq!(union_tag_width(9), 4);
    }

    #[test]
    fn test_ordinals_ignore_declared_order() {
        let variants = vec![
            ("zebra".to_string(), Packed::Nat),
            ("apple".to_string(), Packed::Nat),
            ("mango".to_string(), Packed::Nat),
        ];
        assert_eq!(variant_ordinal(&variants, "apple").unwrap().0, 0);
        assert_eq!(variant_ordinal(&variants, "mango").unwrap().0, 1);
        assert_eq!(variant_ordinal(&variants, "zebra").unwrap().0, 2);
        assert!(matches!(
            variant_ordinal(&variants, "pear"),
            Err(CodecError::UnknownVariant(_))
        ));
    }
}
