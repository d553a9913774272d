//! Error types for the serial link and node layers.
//!
//! Frame-level failures ([`tklan_proto::ProtocolError`]) convert in via
//! `#[from]`; everything I/O- or protocol-state-shaped lives here. The retry
//! budget in `send_frame` only ever re-runs [transient](LinkError::is_transient)
//! kinds; all others propagate on first occurrence.

use thiserror::Error;
use tklan_proto::ProtocolError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors surfaced by the serial link and the node operations on top of it.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Frame construction or parsing failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Short or missing bytes on the port within the timeout. The echo never
    /// arrived, or arrived mangled.
    #[error("short or missing read on the serial port")]
    Read,

    /// The peer acknowledged receipt via the echo but its reply is absent or
    /// malformed.
    #[error("peer did not reply correctly after a valid echo")]
    Write,

    /// Tried to originate a request without holding the token.
    #[error("cannot send while not master")]
    NoMaster,

    /// The listening loop found nobody talking; the caller is effectively
    /// master now.
    #[error("no traffic on the bus; nobody is master")]
    NoSlave,

    /// A token offer did not transfer ownership.
    #[error("token offer to node {destination} did not transfer mastership")]
    Token {
        /// Node the token was offered to.
        destination: u8,
    },

    /// Identify failed while this host was master: the node is not on the
    /// bus.
    #[error("node {address} does not exist on the bus")]
    NodeNotExists {
        /// Address that did not answer.
        address: u8,
    },

    /// An operation addressed memory outside the node's reported geometry.
    #[error("{what} = {value} exceeds the node's limit of {max}")]
    Range {
        /// Which quantity violated the limit.
        what: &'static str,
        /// Requested value.
        value: usize,
        /// Limit reported by the node (or its default).
        max: usize,
    },

    /// The operation requires the node application to be stopped.
    #[error("node {address} application is active")]
    ActiveApp {
        /// Node whose application is running.
        address: u8,
    },

    /// The operation requires the node application to be running.
    #[error("node {address} application is inactive")]
    InactiveApp {
        /// Node whose application is stopped.
        address: u8,
    },

    /// The serial port could not be opened. The supervisor keeps retrying;
    /// a synchronous `start()` surfaces the first failure.
    #[error("cannot open serial port: {message}")]
    SerialConfig {
        /// Description from the port layer.
        message: String,
    },
}

impl LinkError {
    /// Whether a retry within the same transaction may succeed.
    ///
    /// Only line-noise kinds qualify; everything else is either a
    /// programmer error, a protocol-state condition, or handled by the
    /// supervisor.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Read | Self::Write | Self::Protocol(ProtocolError::BadChecksum { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_noise_is_transient() {
        assert!(LinkError::Read.is_transient());
        assert!(LinkError::Write.is_transient());
        assert!(LinkError::Protocol(ProtocolError::BadChecksum { len: 4 }).is_transient());
    }

    #[test]
    fn state_conditions_are_not() {
        assert!(!LinkError::NoMaster.is_transient());
        assert!(!LinkError::NoSlave.is_transient());
        assert!(!LinkError::Token { destination: 3 }.is_transient());
        assert!(!LinkError::NodeNotExists { address: 1 }.is_transient());
        assert!(
            !LinkError::SerialConfig { message: "permission denied".to_string() }.is_transient()
        );
    }
}
