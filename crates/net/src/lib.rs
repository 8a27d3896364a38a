#![warn(missing_docs)]
//! Wire protocol and transport shared by the broker and its clients.
//!
//! The broker speaks a small tagged message set ([`wire`]) encoded with the
//! schema codec and framed one message per length-prefixed frame over a
//! single bidirectional QUIC stream. [`client::BrokerClient`] owns one
//! logical connection: it reconnects under the hood, keeps the clock synced
//! against the broker, re-subscribes rooms, and queues posts while offline.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod link;
pub mod wire;

pub use client::{BrokerClient, ClientOptions};
pub use error::LinkError;
pub use link::{BrokerLink, LinkEvent, MemoryLink, PostRecord};
pub use wire::{BrokerMessage, ClientMessage};

/// Milliseconds since the Unix epoch; the wall clock both sides stamp
/// messages with.
pub fn unix_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
