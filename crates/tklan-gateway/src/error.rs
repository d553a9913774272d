//! Gateway error type.

use thiserror::Error;
use tklan_link::LinkError;

/// Failures of the gateway runtime itself.
///
/// Per-command failures never surface here: they travel back to the client
/// as error replies so it can retry.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A socket could not be bound or polled.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial link refused to start.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A runtime component could not be spawned or died unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}
