//! Engine failure surface.

use thiserror::Error;
use tickline_net::LinkError;

/// Errors surfaced by [`crate::ReplayEngine`] operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was closed; it accepts no further operations.
    #[error("engine is closed")]
    Closed,

    /// The underlying link refused the operation (not synced, closed,
    /// schema conflict, encoding failure).
    #[error(transparent)]
    Link(#[from] LinkError),
}
