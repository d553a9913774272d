//! Bit packing for the two TKLan header bytes and the frame checksum.
//!
//! A frame is `3 + length` bytes on the wire:
//!
//! ```text
//! [ sender<<4 | destination ][ function<<5 | length ][ data... ][ checksum ]
//! ```
//!
//! The checksum makes every valid frame sum to zero modulo 256. All
//! arithmetic is over unsigned bytes; signed interpretations happen to agree
//! only because the sum is taken mod 256.

use crate::{
    MAX_ADDRESS, MAX_DATA_LEN,
    errors::{ProtocolError, Result},
};

/// Smallest possible frame: header, control, checksum.
pub const MIN_FRAME_LEN: usize = 3;

/// Pack sender and destination addresses into the header byte.
///
/// # Errors
///
/// `ProtocolError::Encode` if either address exceeds 15.
pub fn encode_addr(sender: u8, destination: u8) -> Result<u8> {
    if sender > MAX_ADDRESS {
        return Err(ProtocolError::Encode {
            field: "sender",
            value: sender as usize,
            max: MAX_ADDRESS as usize,
        });
    }
    if destination > MAX_ADDRESS {
        return Err(ProtocolError::Encode {
            field: "destination",
            value: destination as usize,
            max: MAX_ADDRESS as usize,
        });
    }
    Ok((sender << 4) | destination)
}

/// Pack function code and payload length into the control byte.
///
/// # Errors
///
/// `ProtocolError::Encode` if `function > 7` or `length > 31`.
pub fn encode_ctrl(function: u8, length: usize) -> Result<u8> {
    if function > 7 {
        return Err(ProtocolError::Encode { field: "function", value: function as usize, max: 7 });
    }
    if length > MAX_DATA_LEN {
        return Err(ProtocolError::Encode { field: "length", value: length, max: MAX_DATA_LEN });
    }
    Ok((function << 5) | (length as u8))
}

/// Unpack the header byte into `(sender, destination)`.
///
/// # Errors
///
/// `ProtocolError::Decode` unless handed exactly one byte.
pub fn decode_addr(bytes: &[u8]) -> Result<(u8, u8)> {
    let [byte] = bytes else {
        return Err(ProtocolError::Decode { field: "address", expected: 1, got: bytes.len() });
    };
    Ok((byte >> 4, byte & 0x0F))
}

/// Unpack the control byte into `(function, length)`.
///
/// # Errors
///
/// `ProtocolError::Decode` unless handed exactly one byte.
pub fn decode_ctrl(bytes: &[u8]) -> Result<(u8, u8)> {
    let [byte] = bytes else {
        return Err(ProtocolError::Decode { field: "control", expected: 1, got: bytes.len() });
    };
    Ok((byte >> 5, byte & 0x1F))
}

/// Checksum byte: `(0 - sum(bytes)) mod 256`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)).wrapping_neg()
}

/// A complete frame sums to zero modulo 256 and carries at least the three
/// mandatory bytes.
#[must_use]
pub fn validate_checksum(frame_bytes: &[u8]) -> bool {
    frame_bytes.len() >= MIN_FRAME_LEN
        && frame_bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn addr_packs_nibbles() {
        assert_eq!(encode_addr(0, 1).unwrap(), 0x01);
        assert_eq!(encode_addr(14, 0).unwrap(), 0xE0);
        assert_eq!(encode_addr(15, 15).unwrap(), 0xFF);
    }

    #[test]
    fn addr_rejects_out_of_range() {
        assert!(matches!(
            encode_addr(16, 0),
            Err(ProtocolError::Encode { field: "sender", .. })
        ));
        assert!(matches!(
            encode_addr(0, 16),
            Err(ProtocolError::Encode { field: "destination", .. })
        ));
    }

    #[test]
    fn ctrl_packs_fields() {
        assert_eq!(encode_ctrl(1, 2).unwrap(), 0x22);
        assert_eq!(encode_ctrl(7, 0).unwrap(), 0xE0);
        assert_eq!(encode_ctrl(7, 31).unwrap(), 0xFF);
    }

    #[test]
    fn ctrl_rejects_out_of_range() {
        assert!(matches!(
            encode_ctrl(8, 0),
            Err(ProtocolError::Encode { field: "function", .. })
        ));
        assert!(matches!(
            encode_ctrl(0, 32),
            Err(ProtocolError::Encode { field: "length", .. })
        ));
    }

    #[test]
    fn decode_inverts_encode() {
        assert_eq!(decode_addr(&[0x01]).unwrap(), (0, 1));
        assert_eq!(decode_addr(&[0xE0]).unwrap(), (14, 0));
        assert_eq!(decode_ctrl(&[0x22]).unwrap(), (1, 2));
        assert_eq!(decode_ctrl(&[0xE0]).unwrap(), (7, 0));
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert!(decode_addr(&[]).is_err());
        assert!(decode_addr(&[1, 2]).is_err());
        assert!(decode_ctrl(&[]).is_err());
    }

    #[test]
    fn checksum_closes_the_sum() {
        // Read-RAM request from the protocol trace: 01 22 00 05 -> D8.
        assert_eq!(checksum(&[0x01, 0x22, 0x00, 0x05]), 0xD8);
        assert!(validate_checksum(&[0x01, 0x22, 0x00, 0x05, 0xD8]));
    }

    #[test]
    fn checksum_wraps_unsigned() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF]), 0x01);
        assert_eq!(checksum(&[0x80, 0x80]), 0x00);
    }

    #[test]
    fn validate_needs_three_bytes() {
        assert!(!validate_checksum(&[]));
        assert!(!validate_checksum(&[0x00, 0x00]));
        assert!(validate_checksum(&[0x3B, 0xE0, 0xE5]));
        assert!(!validate_checksum(&[0x3B, 0xE0, 0xE6]));
    }
}
