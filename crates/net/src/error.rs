//! Client-facing transport errors.

use thiserror::Error;
use tickline_codec::CodecError;

/// Errors surfaced by [`crate::BrokerLink`] implementations.
///
/// Transport interruptions are *not* errors: the client absorbs them by
/// reconnecting, re-watching and queueing. What remains are caller mistakes
/// and use-before-sync.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The broker clock has not been sampled yet.
    #[error("server clock not synced yet")]
    NotSynced,

    /// A room was registered twice with different payload schemas.
    #[error("room `{0}` is already registered with a different schema")]
    SchemaMismatch(String),

    /// A post was submitted for a room that was never watched or loaded.
    #[error("room `{0}` has no registered schema")]
    UnregisteredRoom(String),

    /// The link was closed by the caller; no further operations are served.
    #[error("transport is closed")]
    Closed,

    /// Payload encoding failed before anything was sent.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Endpoint construction failed; nothing was ever sent.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// A wire message failed to encode. Schemas are static, so this means a
    /// bug rather than bad caller input.
    #[error("wire encoding failed: {0}")]
    Wire(String),
}
