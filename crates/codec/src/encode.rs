//! Measuring and packing values.

use std::collections::BTreeMap;

use crate::bits::BitWriter;
use crate::error::CodecError;
use crate::schema::{check_width, union_tag_width, variant_ordinal, Packed};
use crate::value::{Value, UNION_TAG_KEY, UNION_VALUE_KEY};

/// Exact number of bits `value` occupies under `schema`.
///
/// This is the same validation pass [`encode`] runs first; callers can use it
/// to pre-check a value or to assert the size law in tests.
pub fn bit_length(schema: &Packed, value: &Value) -> Result<u64, CodecError> {
    measure(schema, value)
}

/// Pack `value` into a minimal bitstream under `schema`.
///
/// Two passes: the first computes the exact bit length and validates every
/// field, the second writes into a buffer of `ceil(bits / 8)` bytes. Unused
/// pad bits in the final byte are zero.
pub fn encode(schema: &Packed, value: &Value) -> Result<Vec<u8>, CodecError> {
    let bits = measure(schema, value)?;
    let mut writer = BitWriter::with_bit_capacity(bits);
    write_value(&mut writer, schema, value)?;
    debug_assert_eq!(writer.bits_written(), bits);
    Ok(writer.into_bytes())
}

fn measure(schema: &Packed, value: &Value) -> Result<u64, CodecError> {
    match schema {
        Packed::UInt(width) => {
            check_uint(*width, value)?;
            Ok(u64::from(*width))
        }
        Packed::Int(width) => {
            check_int(*width, value)?;
            Ok(u64::from(*width))
        }
        Packed::Nat => {
            let n = expect_uint(value)?;
            n.checked_add(1).ok_or(CodecError::OutOfRange {
                width: 64,
                value: i128::from(n),
            })
        }
        Packed::Struct(fields) => {
            let record = expect_record(value)?;
            let mut bits = 0u64;
            for (name, sub) in fields {
                let field = record
                    .get(name)
                    .ok_or_else(|| CodecError::MissingField(name.clone()))?;
                bits += measure(sub, field)?;
            }
            Ok(bits)
        }
        Packed::Tuple(items) => {
            let seq = expect_seq(value)?;
            if seq.len() != items.len() {
                return Err(CodecError::VectorLength {
                    expected: items.len(),
                    found: seq.len(),
                });
            }
            let mut bits = 0u64;
            for (sub, elem) in items.iter().zip(seq) {
                bits += measure(sub, elem)?;
            }
            Ok(bits)
        }
        Packed::Vector { len, elem } => {
            let seq = expect_seq(value)?;
            if seq.len() != *len {
                return Err(CodecError::VectorLength {
                    expected: *len,
                    found: seq.len(),
                });
            }
            let mut bits = 0u64;
            for item in seq {
                bits += measure(elem, item)?;
            }
            Ok(bits)
        }
        Packed::List(elem) => {
            let seq = expect_seq(value)?;
            let mut bits = 1u64;
            for item in seq {
                bits += 1 + measure(elem, item)?;
            }
            Ok(bits)
        }
        Packed::Map { key, value: val } => {
            let entries = expect_map(value)?;
            let mut bits = 1u64;
            for (k, v) in entries {
                bits += 1 + measure(key, k)? + measure(val, v)?;
            }
            Ok(bits)
        }
        Packed::Union(variants) => {
            let (_, declared, payload) = union_parts(variants, value)?;
            let tag_bits = u64::from(union_tag_width(variants.len()));
            Ok(tag_bits + measure(&variants[declared].1, payload)?)
        }
        Packed::Str => {
            let s = expect_str(value)?;
            Ok(s.len() as u64 * 9 + 1)
        }
    }
}

fn write_value(w: &mut BitWriter, schema: &Packed, value: &Value) -> Result<(), CodecError> {
    match schema {
        Packed::UInt(width) => {
            let v = check_uint(*width, value)?;
            w.write_bits(v, *width);
        }
        Packed::Int(width) => {
            let v = check_int(*width, value)?;
            // Truncating to the low bits is exactly two's complement.
            w.write_bits(v as u64, *width);
        }
        Packed::Nat => {
            let n = expect_uint(value)?;
            for _ in 0..n {
                w.write_bit(true);
            }
            w.write_bit(false);
        }
        Packed::Struct(fields) => {
            let record = expect_record(value)?;
            for (name, sub) in fields {
                let field = record
                    .get(name)
                    .ok_or_else(|| CodecError::MissingField(name.clone()))?;
                write_value(w, sub, field)?;
            }
        }
        Packed::Tuple(items) => {
            let seq = expect_seq(value)?;
            for (sub, elem) in items.iter().zip(seq) {
                write_value(w, sub, elem)?;
            }
        }
        Packed::Vector { elem, .. } => {
            let seq = expect_seq(value)?;
            for item in seq {
                write_value(w, elem, item)?;
            }
        }
        Packed::List(elem) => {
            let seq = expect_seq(value)?;
            for item in seq {
                w.write_bit(true);
                write_value(w, elem, item)?;
            }
            w.write_bit(false);
        }
        Packed::Map { key, value: val } => {
            let entries = expect_map(value)?;
            for (k, v) in entries {
                w.write_bit(true);
                write_value(w, key, k)?;
                write_value(w, val, v)?;
            }
            w.write_bit(false);
        }
        Packed::Union(variants) => {
            let (ordinal, declared, payload) = union_parts(variants, value)?;
            w.write_bits(ordinal, union_tag_width(variants.len()));
            write_value(w, &variants[declared].1, payload)?;
        }
        Packed::Str => {
            let s = expect_str(value)?;
            for byte in s.as_bytes() {
                w.write_bit(true);
                w.write_bits(u64::from(*byte), 8);
            }
            w.write_bit(false);
        }
    }
    Ok(())
}

/// Resolve a union value into its wire ordinal, declared variant index, and
/// the value the variant schema applies to. Struct variants read the whole
/// record (flat convention); every other variant reads the `"value"` field.
fn union_parts<'v>(
    variants: &[(String, Packed)],
    value: &'v Value,
) -> Result<(u64, usize, &'v Value), CodecError> {
    if variants.is_empty() {
        return Err(CodecError::EmptyUnion);
    }
    let record = expect_record(value)?;
    let tag = match record.get(UNION_TAG_KEY) {
        Some(Value::Str(tag)) => tag,
        Some(other) => {
            return Err(CodecError::ShapeMismatch {
                expected: "string union tag",
                found: other.kind(),
            })
        }
        None => return Err(CodecError::MissingField(UNION_TAG_KEY.to_string())),
    };
    let (ordinal, declared) = variant_ordinal(variants, tag)?;
    let payload = if matches!(variants[declared].1, Packed::Struct(_)) {
        value
    } else {
        record
            .get(UNION_VALUE_KEY)
            .ok_or_else(|| CodecError::MissingField(UNION_VALUE_KEY.to_string()))?
    };
    Ok((ordinal, declared, payload))
}

fn check_uint(width: u32, value: &Value) -> Result<u64, CodecError> {
    check_width(width)?;
    let v = expect_uint(value)?;
    if width < 64 && v >> width != 0 {
        return Err(CodecError::OutOfRange {
            width,
            value: i128::from(v),
        });
    }
    Ok(v)
}

fn check_int(width: u32, value: &Value) -> Result<i64, CodecError> {
    check_width(width)?;
    let v = match value {
        Value::Int(v) => *v,
        other => {
            return Err(CodecError::ShapeMismatch {
                expected: "signed integer",
                found: other.kind(),
            })
        }
    };
    let min = -(1i128 << (width - 1));
    let max = (1i128 << (width - 1)) - 1;
    if i128::from(v) < min || i128::from(v) > max {
        return Err(CodecError::OutOfRange {
            width,
            value: i128::from(v),
        });
    }
    Ok(v)
}

fn expect_uint(value: &Value) -> Result<u64, CodecError> {
    match value {
        Value::UInt(v) => Ok(*v),
        other => Err(CodecError::ShapeMismatch {
            expected: "unsigned integer",
            found: other.kind(),
        }),
    }
}

fn expect_str(value: &Value) -> Result<&str, CodecError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(CodecError::ShapeMismatch {
            expected: "string",
            found: other.kind(),
        }),
    }
}

fn expect_seq(value: &Value) -> Result<&[Value], CodecError> {
    match value {
        Value::Seq(items) => Ok(items),
        other => Err(CodecError::ShapeMismatch {
            expected: "sequence",
            found: other.kind(),
        }),
    }
}

fn expect_map(value: &Value) -> Result<&[(Value, Value)], CodecError> {
    match value {
        Value::Map(entries) => Ok(entries),
        other => Err(CodecError::ShapeMismatch {
            expected: "map",
            found: other.kind(),
        }),
    }
}

fn expect_record(value: &Value) -> Result<&BTreeMap<String, Value>, CodecError> {
    match value {
        Value::Record(fields) => Ok(fields),
        other => Err(CodecError::ShapeMismatch {
            expected: "record",
            found: other.kind(),
        }),
    }
}
