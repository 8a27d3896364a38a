//! The tickline broker: authoritative timestamps, per-room append logs, and
//! gap-free fan-out to watchers.
//!
//! The broker runs no game logic. It assigns each incoming post a server
//! time and a monotonically increasing index, persists it to the room's
//! append log, and streams it to every watching connection strictly in index
//! order. Clients replay the identical post stream through identical pure
//! transition functions, so this ordering guarantee is what keeps every
//! client's world state the same.

pub mod config;
pub mod log;
pub mod server;

pub use config::BrokerConfig;
pub use log::{RoomStore, StoredPost};
pub use server::Broker;
