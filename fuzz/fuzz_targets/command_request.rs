//! Fuzz target for the JSON command surface.
//!
//! Whatever a client puts in a command object, building the frame must
//! never panic, and a frame that builds must be a valid wire image.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tklan_proto::{codec, wire::CommandRequest};

#[derive(Debug, Arbitrary)]
struct RawCommand {
    sender: u8,
    destination: u8,
    function: u8,
    data: String,
    validate: Option<bool>,
}

fuzz_target!(|raw: RawCommand| {
    let request = CommandRequest {
        sender: raw.sender,
        destination: raw.destination,
        function: raw.function,
        data: raw.data,
        validate: raw.validate,
    };
    if let Ok(frame) = request.to_frame() {
        assert!(codec::validate_checksum(frame.as_bytes()));
        assert_eq!(frame.as_bytes().len(), 3 + frame.data().len());
    }
});
