//! Error types for the TKLan data layer.
//!
//! These cover frame construction and parsing only. Link-level failures
//! (timeouts, echo mismatches, token transfer) live in `tklan-link`; the two
//! layers convert at the boundary with `#[from]`.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while building or parsing TKLan frames and app lines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A header field does not fit its bit-packed slot. Programmer error on
    /// the outgoing path; surfaced, never retried.
    #[error("cannot encode {field} = {value}, maximum is {max}")]
    Encode {
        /// Which field overflowed.
        field: &'static str,
        /// Offending value.
        value: usize,
        /// Largest encodable value.
        max: usize,
    },

    /// A header or control byte could not be extracted from the input.
    #[error("cannot decode {field}: expected {expected} byte(s), got {got}")]
    Decode {
        /// Which field was being decoded.
        field: &'static str,
        /// Bytes the decoder needs.
        expected: usize,
        /// Bytes it was handed.
        got: usize,
    },

    /// The frame bytes do not sum to zero modulo 256, or there are fewer
    /// than the minimum three bytes.
    #[error("frame checksum mismatch over {len} byte(s)")]
    BadChecksum {
        /// Length of the rejected byte chain.
        len: usize,
    },

    /// An outgoing frame violates the per-function payload shape.
    #[error("invalid frame for function {function}: {reason}")]
    InvalidFrame {
        /// Function code of the rejected frame.
        function: u8,
        /// What the shape rule requires.
        reason: &'static str,
    },

    /// An application-memory line failed to parse or its checksum is wrong.
    #[error("bad application line: {reason}")]
    BadLine {
        /// What went wrong with the line.
        reason: &'static str,
    },

    /// A JSON request carried a payload that is not a hex string.
    #[error("payload is not a hex string")]
    BadHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_actionable() {
        let err = ProtocolError::Encode { field: "sender", value: 16, max: 15 };
        assert_eq!(err.to_string(), "cannot encode sender = 16, maximum is 15");

        let err = ProtocolError::BadChecksum { len: 5 };
        assert!(err.to_string().contains("5 byte"));
    }
}
