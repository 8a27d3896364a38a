//! Unpacking bitstreams back into values.

use std::collections::BTreeMap;

use crate::bits::BitReader;
use crate::error::CodecError;
use crate::schema::{check_width, union_tag_width, wire_order, Packed};
use crate::value::{Value, UNION_TAG_KEY, UNION_VALUE_KEY};

/// Unpack `bytes` under `schema`.
///
/// The decoder checks nothing beyond bounds: the caller must supply the same
/// schema the producer encoded with. Trailing pad bits are ignored.
pub fn decode(schema: &Packed, bytes: &[u8]) -> Result<Value, CodecError> {
    let mut reader = BitReader::new(bytes);
    read_value(&mut reader, schema)
}

fn read_value(r: &mut BitReader, schema: &Packed) -> Result<Value, CodecError> {
    match schema {
        Packed::UInt(width) => {
            check_width(*width)?;
            Ok(Value::UInt(r.read_bits(*width)?))
        }
        Packed::Int(width) => {
            check_width(*width)?;
            let raw = r.read_bits(*width)?;
            Ok(Value::Int(sign_extend(raw, *width)))
        }
        Packed::Nat => {
            let mut n = 0u64;
            while r.read_bit()? {
                n += 1;
            }
            Ok(Value::UInt(n))
        }
        Packed::Struct(fields) => {
            let mut record = BTreeMap::new();
            for (name, sub) in fields {
                record.insert(name.clone(), read_value(r, sub)?);
            }
            Ok(Value::Record(record))
        }
        Packed::Tuple(items) => {
            let mut seq = Vec::with_capacity(items.len());
            for sub in items {
                seq.push(read_value(r, sub)?);
            }
            Ok(Value::Seq(seq))
        }
        Packed::Vector { len, elem } => {
            let mut seq = Vec::with_capacity(*len);
            for _ in 0..*len {
                seq.push(read_value(r, elem)?);
            }
            Ok(Value::Seq(seq))
        }
        Packed::List(elem) => {
            let mut seq = Vec::new();
            while r.read_bit()? {
                seq.push(read_value(r, elem)?);
            }
            Ok(Value::Seq(seq))
        }
        Packed::Map { key, value } => {
            let mut entries = Vec::new();
            while r.read_bit()? {
                let k = read_value(r, key)?;
                let v = read_value(r, value)?;
                entries.push((k, v));
            }
            Ok(Value::Map(entries))
        }
        Packed::Union(variants) => {
            if variants.is_empty() {
                return Err(CodecError::EmptyUnion);
            }
            let ordinal = r.read_bits(union_tag_width(variants.len()))?;
            let order = wire_order(variants);
            let declared = *order
                .get(ordinal as usize)
                .ok_or(CodecError::InvalidTag(ordinal))?;
            let (name, sub) = &variants[declared];
            let payload = read_value(r, sub)?;
            if matches!(sub, Packed::Struct(_)) {
                // Struct variants stay flat: tag field beside the payload's.
                let Value::Record(mut record) = payload else {
                    unreachable!("struct schemas decode to records");
                };
                record.insert(UNION_TAG_KEY.to_string(), Value::Str(name.clone()));
                Ok(Value::Record(record))
            } else {
                Ok(Value::record([
                    (UNION_TAG_KEY, Value::Str(name.clone())),
                    (UNION_VALUE_KEY, payload),
                ]))
            }
        }
        Packed::Str => {
            let mut bytes = Vec::new();
            while r.read_bit()? {
                bytes.push(r.read_bits(8)? as u8);
            }
            String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|_| CodecError::InvalidUtf8)
        }
    }
}

fn sign_extend(raw: u64, width: u32) -> i64 {
    if width < 64 && raw >> (width - 1) & 1 != 0 {
        (raw | !0u64 << width) as i64
    } else {
        raw as i64
    }
}
