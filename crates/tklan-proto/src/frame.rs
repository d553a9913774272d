//! Frame type: one on-wire TKLan message.
//!
//! A frame is `3 + length` bytes: header byte (`sender<<4 | destination`),
//! control byte (`function<<5 | length`), payload, checksum. Two construction
//! paths exist and they validate differently:
//!
//! - **From fields** ([`Frame::request`]): encodes the bytes, computes the
//!   checksum and enforces the per-function payload shape. This is the path
//!   for traffic we originate; a malformed request is a programmer error.
//! - **From the wire** ([`Frame::parse`]): only the checksum is verified.
//!   Slaves must survive malformed master traffic, so no shape rule is
//!   applied to incoming bytes. In the same spirit the control byte's length
//!   field is recorded as-is even when it disagrees with the actual payload
//!   length; several fielded devices echo the request's control byte in
//!   their replies.
//!
//! [`Frame::response_size`] tells the link how many reply bytes to read back
//! for each function before the peer has said anything.

use std::fmt;

use bytes::Bytes;

use crate::{
    APP_ACTIVATE, APP_DEACTIVATE, APP_LINE_SIZE, Function, codec,
    errors::{ProtocolError, Result},
};

/// One TKLan frame, request or reply.
///
/// Immutable once built. The wire image is cached at construction so that
/// sending and echo-verification never re-encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sender: u8,
    destination: u8,
    function: Function,
    /// Length field of the control byte. Equals `data.len()` for frames
    /// built from fields; taken verbatim from the wire for parsed frames.
    length: u8,
    data: Bytes,
    checksum: u8,
    wire: Bytes,
}

impl Frame {
    /// Build an outgoing frame and enforce the per-function payload shape.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::Encode` if an address, the function or the payload
    ///   length does not fit its bit field
    /// - `ProtocolError::InvalidFrame` if the payload shape is wrong for the
    ///   function
    pub fn request(
        sender: u8,
        destination: u8,
        function: Function,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let data = data.into();
        validate_shape(function, &data)?;
        Self::assemble(sender, destination, function, data)
    }

    /// Build an outgoing frame without the semantic shape check.
    ///
    /// The gateway relays frames whose shape is dictated by the client; this
    /// constructor still range-checks every bit field and computes the
    /// checksum, it only skips the shape table.
    ///
    /// # Errors
    ///
    /// `ProtocolError::Encode` on out-of-range fields.
    pub fn request_unchecked(
        sender: u8,
        destination: u8,
        function: Function,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        Self::assemble(sender, destination, function, data.into())
    }

    fn assemble(sender: u8, destination: u8, function: Function, data: Bytes) -> Result<Self> {
        let header = codec::encode_addr(sender, destination)?;
        let control = codec::encode_ctrl(function.to_u8(), data.len())?;

        let mut wire = Vec::with_capacity(codec::MIN_FRAME_LEN + data.len());
        wire.push(header);
        wire.push(control);
        wire.extend_from_slice(&data);
        let checksum = codec::checksum(&wire);
        wire.push(checksum);

        Ok(Self {
            sender,
            destination,
            function,
            length: data.len() as u8,
            data,
            checksum,
            wire: Bytes::from(wire),
        })
    }

    /// Parse a frame received from the bus.
    ///
    /// Requires at least three bytes and a zero modular sum; everything else
    /// is taken at face value. No shape validation on this path.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::BadChecksum` if the chain is short or does not sum
    ///   to zero
    /// - `ProtocolError::Decode` if a header field cannot be extracted
    pub fn parse(bytes: impl Into<Bytes>) -> Result<Self> {
        let wire = bytes.into();
        if !codec::validate_checksum(&wire) {
            return Err(ProtocolError::BadChecksum { len: wire.len() });
        }

        let (sender, destination) = codec::decode_addr(&wire[0..1])?;
        let (function, length) = codec::decode_ctrl(&wire[1..2])?;
        // validate_checksum guaranteed len >= 3, so 0..=7 from three bits.
        let function = Function::from_u8(function).ok_or(ProtocolError::Decode {
            field: "function",
            expected: 1,
            got: 1,
        })?;

        let data = wire.slice(2..wire.len() - 1);
        let checksum = wire[wire.len() - 1];

        Ok(Self { sender, destination, function, length, data, checksum, wire })
    }

    /// Address of the originating node.
    #[must_use]
    pub fn sender(&self) -> u8 {
        self.sender
    }

    /// Address of the target node.
    #[must_use]
    pub fn destination(&self) -> u8 {
        self.destination
    }

    /// Function code.
    #[must_use]
    pub fn function(&self) -> Function {
        self.function
    }

    /// Length field of the control byte. May disagree with
    /// `self.data().len()` on parsed replies.
    #[must_use]
    pub fn length(&self) -> u8 {
        self.length
    }

    /// Payload bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Checksum byte.
    #[must_use]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Complete wire image, `3 + data.len()` bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    /// Wire image as shared bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        self.wire.clone()
    }

    /// How many bytes the peer's reply to this request occupies.
    ///
    /// The bus gives no reply-length preamble, so the master must know the
    /// exact count before reading:
    ///
    /// | function             | reply bytes                |
    /// |----------------------|----------------------------|
    /// | identify             | 13                         |
    /// | read RAM/EEPROM      | `3 + count`                |
    /// | write RAM/EEPROM     | `3 + length`               |
    /// | read app             | `3 + 2 * count`            |
    /// | app activate/deactiv.| 4                          |
    /// | write app            | `3 + APP_LINE_SIZE + 2`    |
    /// | token                | 3                          |
    #[must_use]
    pub fn response_size(&self) -> usize {
        match self.function {
            Function::Identify => 13,
            Function::ReadRam | Function::ReadEeprom => {
                3 + self.data.get(1).copied().unwrap_or(0) as usize
            }
            Function::WriteRam | Function::WriteEeprom => 3 + self.data.len(),
            Function::ReadApp => 3 + 2 * self.data.get(2).copied().unwrap_or(0) as usize,
            Function::WriteApp => {
                if self.data.as_ref() == APP_ACTIVATE || self.data.as_ref() == APP_DEACTIVATE {
                    4
                } else {
                    3 + APP_LINE_SIZE + 2
                }
            }
            Function::Token => 3,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.wire {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Per-function payload shape for outgoing frames.
///
/// Incoming frames are never checked against this table: a slave must be
/// able to receive malformed master traffic without failing.
fn validate_shape(function: Function, data: &[u8]) -> Result<()> {
    let reject = |reason| {
        Err(ProtocolError::InvalidFrame { function: function.to_u8(), reason })
    };
    match function {
        Function::Identify if !data.is_empty() => reject("identify carries no payload"),
        Function::ReadRam | Function::ReadEeprom if data.len() != 2 => {
            reject("memory reads carry exactly (start, count)")
        }
        Function::WriteRam | Function::WriteEeprom if data.len() < 2 => {
            reject("memory writes carry the start byte plus at least one data byte")
        }
        Function::ReadApp if data.len() != 3 => {
            reject("app reads carry exactly (start_lo, start_hi, count)")
        }
        Function::WriteApp if data.len() < 2 => {
            reject("app writes carry a word address plus data")
        }
        Function::Token if !data.is_empty() => reject("token frames carry no payload"),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_builds_read_ram() {
        let frame = Frame::request(0, 1, Function::ReadRam, vec![0x00, 0x05]).unwrap();
        assert_eq!(frame.as_bytes(), &[0x01, 0x22, 0x00, 0x05, 0xD8]);
        assert_eq!(frame.length(), 2);
        assert_eq!(frame.response_size(), 8);
    }

    #[test]
    fn request_builds_token() {
        let frame = Frame::request(0, 14, Function::Token, Bytes::new()).unwrap();
        assert_eq!(frame.as_bytes(), &[0x0E, 0xE0, 0x12]);
        assert_eq!(frame.response_size(), 3);
    }

    #[test]
    fn request_rejects_out_of_range_destination() {
        let err = Frame::request(0, 16, Function::Identify, Bytes::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Encode { field: "destination", .. }));
    }

    #[test]
    fn shape_rules_per_function() {
        // identify must be empty
        assert!(Frame::request(0, 1, Function::Identify, vec![0xFF]).is_err());
        assert!(Frame::request(0, 1, Function::Identify, Bytes::new()).is_ok());
        // reads are exactly two bytes
        assert!(Frame::request(0, 1, Function::ReadRam, Bytes::new()).is_err());
        assert!(Frame::request(0, 1, Function::ReadEeprom, vec![1]).is_err());
        assert!(Frame::request(0, 1, Function::ReadEeprom, vec![0, 4]).is_ok());
        // writes carry start plus payload
        assert!(Frame::request(0, 1, Function::WriteRam, vec![3]).is_err());
        assert!(Frame::request(0, 1, Function::WriteRam, vec![3, 9]).is_ok());
        assert!(Frame::request(0, 1, Function::WriteEeprom, vec![0]).is_err());
        // app read is exactly three bytes
        assert!(Frame::request(0, 1, Function::ReadApp, vec![0, 0]).is_err());
        assert!(Frame::request(0, 1, Function::ReadApp, vec![0, 0x40, 4]).is_ok());
        // app write needs address plus data
        assert!(Frame::request(0, 1, Function::WriteApp, vec![0]).is_err());
        assert!(Frame::request(0, 1, Function::WriteApp, APP_ACTIVATE).is_ok());
        // token must be empty
        assert!(Frame::request(0, 1, Function::Token, vec![0]).is_err());
    }

    #[test]
    fn unchecked_skips_shape_but_not_ranges() {
        // length 1 on a read would fail validation, the relay path allows it
        let frame = Frame::request_unchecked(0, 1, Function::ReadRam, vec![9]).unwrap();
        assert_eq!(frame.data().as_ref(), &[9]);
        assert!(Frame::request_unchecked(16, 1, Function::ReadRam, vec![9]).is_err());
    }

    #[test]
    fn parse_accepts_reply_with_stale_control_length() {
        // Reply to a 5-byte RAM read: control byte echoes the request's
        // length field while five data bytes follow.
        let bytes = vec![0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0xBF];
        let frame = Frame::parse(bytes).unwrap();
        assert_eq!(frame.sender(), 1);
        assert_eq!(frame.destination(), 0);
        assert_eq!(frame.function(), Function::ReadRam);
        assert_eq!(frame.length(), 2);
        assert_eq!(frame.data().as_ref(), &[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(frame.checksum(), 0xBF);
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let err = Frame::parse(vec![0x10, 0x22, 0x01, 0x02, 0x03, 0x04, 0x05, 0x00]).unwrap_err();
        assert_eq!(err, ProtocolError::BadChecksum { len: 8 });
    }

    #[test]
    fn parse_rejects_short_chains() {
        assert!(Frame::parse(Bytes::new()).is_err());
        assert!(Frame::parse(vec![0x01, 0xFF]).is_err());
    }

    #[test]
    fn parse_does_not_apply_shape_rules() {
        // A token frame carrying payload is invalid to build but must parse.
        let mut wire = vec![0x01, 0xE1, 0xAA];
        wire.push(codec::checksum(&wire));
        let frame = Frame::parse(wire).unwrap();
        assert_eq!(frame.function(), Function::Token);
        assert_eq!(frame.data().as_ref(), &[0xAA]);
    }

    #[test]
    fn oracle_identify() {
        let frame = Frame::request(0, 2, Function::Identify, Bytes::new()).unwrap();
        assert_eq!(frame.response_size(), 13);
    }

    #[test]
    fn oracle_reads_scale_with_count() {
        let frame = Frame::request(0, 1, Function::ReadEeprom, vec![10, 7]).unwrap();
        assert_eq!(frame.response_size(), 10);
        let frame = Frame::request(0, 1, Function::ReadApp, vec![0x00, 0x40, 4]).unwrap();
        assert_eq!(frame.response_size(), 11);
    }

    #[test]
    fn oracle_writes_scale_with_payload() {
        let frame = Frame::request(0, 1, Function::WriteRam, vec![0, 1, 2, 3]).unwrap();
        assert_eq!(frame.response_size(), 7);
    }

    #[test]
    fn oracle_app_control_payloads() {
        let frame = Frame::request(0, 1, Function::WriteApp, APP_ACTIVATE).unwrap();
        assert_eq!(frame.response_size(), 4);
        let frame = Frame::request(0, 1, Function::WriteApp, APP_DEACTIVATE).unwrap();
        assert_eq!(frame.response_size(), 4);
        let frame =
            Frame::request(0, 1, Function::WriteApp, vec![0x00, 0x40, 1, 2, 3, 4]).unwrap();
        assert_eq!(frame.response_size(), 3 + APP_LINE_SIZE + 2);
    }

    #[test]
    fn display_is_lower_hex() {
        let frame = Frame::request(0, 1, Function::ReadRam, vec![0x00, 0x05]).unwrap();
        assert_eq!(frame.to_string(), "01220005d8");
    }
}
