//! Fuzz target for Frame::parse.
//!
//! Arbitrary byte chains must never panic the parser. Chains that do parse
//! must uphold the wire invariants: at least three bytes and a zero modular
//! sum.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tklan_proto::{Frame, codec};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::parse(data.to_vec()) {
        assert!(frame.as_bytes().len() >= 3);
        assert!(codec::validate_checksum(frame.as_bytes()));
        assert_eq!(frame.as_bytes(), data);
    }
});
