#![warn(missing_docs)]
//! Schema-driven bit-level codec.
//!
//! A [`Packed`] schema describes the exact bit layout of a value; [`encode`]
//! and [`decode`] translate between [`Value`] trees and minimal bitstreams.
//! Nothing on the wire is self-describing: both sides must agree on the
//! schema, and the bit layout *is* the compatibility contract.
//!
//! Bit order is LSB-first within a field and bytes are little-endian, with no
//! alignment or padding between fields.

mod bits;
mod decode;
mod encode;
mod error;
mod schema;
mod value;

pub use decode::decode;
pub use encode::{bit_length, encode};
pub use error::CodecError;
pub use schema::Packed;
pub use value::Value;
