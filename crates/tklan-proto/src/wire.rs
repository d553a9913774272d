//! JSON wire model of the gateway sockets.
//!
//! The commands socket speaks one JSON object per line: a
//! [`CommandRequest`] in, a [`FrameReply`] or [`ErrorReply`] out. The
//! publisher socket fans out [`Event`]s. Payload bytes travel as hex
//! strings.

use serde::{Deserialize, Serialize};

use crate::{
    Frame, Function,
    errors::{ProtocolError, Result},
};

/// One client command: the fields of a frame to transact on the bus.
///
/// `validate` defaults to `true`; clients relaying frames whose shape they
/// control set it to `false` to skip the per-function payload rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Originating address, normally 0 (the host).
    pub sender: u8,
    /// Target node address.
    pub destination: u8,
    /// Function code, 0-7.
    pub function: u8,
    /// Payload as a hex string.
    pub data: String,
    /// Apply the per-function shape rules. Defaults to on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<bool>,
}

impl CommandRequest {
    /// Build the frame this request describes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` for out-of-range fields
    /// - `ProtocolError::BadHex` when `data` is not a hex string
    /// - `ProtocolError::InvalidFrame` when validation is on and the payload
    ///   shape is wrong
    pub fn to_frame(&self) -> Result<Frame> {
        let function = Function::from_u8(self.function).ok_or(ProtocolError::Encode {
            field: "function",
            value: self.function as usize,
            max: 7,
        })?;
        let data = hex::decode(&self.data).map_err(|_| ProtocolError::BadHex)?;
        if self.validate.unwrap_or(true) {
            Frame::request(self.sender, self.destination, function, data)
        } else {
            Frame::request_unchecked(self.sender, self.destination, function, data)
        }
    }
}

/// A transacted frame rendered for the JSON surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReply {
    /// Originating address.
    pub sender: u8,
    /// Target address.
    pub destination: u8,
    /// Function code.
    pub function: u8,
    /// Control-byte length field.
    pub length: u8,
    /// Payload as a hex string.
    pub data: String,
    /// Checksum byte as a hex string.
    pub checksum: String,
}

impl From<&Frame> for FrameReply {
    fn from(frame: &Frame) -> Self {
        Self {
            sender: frame.sender(),
            destination: frame.destination(),
            function: frame.function().to_u8(),
            length: frame.length(),
            data: hex::encode(frame.data()),
            checksum: hex::encode([frame.checksum()]),
        }
    }
}

/// Error reply: the request echoed back with a message attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// The request that failed.
    #[serde(flatten)]
    pub request: CommandRequest,
    /// Human-readable failure description.
    pub error: String,
}

/// One reply line on the commands socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    /// Transaction succeeded; this is the peer's frame.
    Frame(FrameReply),
    /// Transaction failed; the request comes back with `error` set.
    Error(ErrorReply),
}

/// One line on the publisher socket.
///
/// Variant order matters for untagged deserialization: a frame carries
/// `length` and `checksum`, a request does not, an exception carries only
/// `exception`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Event {
    /// A transacted frame (a reply, or a streamed exchange's reply).
    Frame(FrameReply),
    /// A request that was put on the bus.
    Request(CommandRequest),
    /// A non-recoverable gateway failure.
    Exception {
        /// Rendered error chain.
        exception: String,
    },
}
