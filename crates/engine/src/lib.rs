#![warn(missing_docs)]
//! Deterministic input-replay engine.
//!
//! Clients never exchange state — only inputs ("posts"). The broker assigns
//! every post an index and a server time; each client replays the identical
//! post stream through identical pure transition functions, so every client
//! computes the identical world state at every tick.
//!
//! [`core::ReplayCore`] is the synchronous deterministic heart: it buckets
//! posts into a per-tick timeline, predicts local posts until their
//! authoritative echo arrives, caches snapshots in a bounded ring, and
//! tracks how much history is provably complete so pruning never eats
//! unconfirmed ticks. [`ReplayEngine`] wires a core to a
//! [`tickline_net::BrokerLink`] and adds clock-derived render-state
//! composition.

pub mod core;
pub mod engine;
mod error;

pub use crate::core::{CoreConfig, Diagnostics, Post, ReplayCore};
pub use crate::engine::{EngineOptions, ReplayEngine};
pub use crate::error::EngineError;
