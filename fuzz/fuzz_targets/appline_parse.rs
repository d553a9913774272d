//! Fuzz target for AppLine::parse.
//!
//! Arbitrary strings must never panic the parser, and any line that parses
//! must survive an emit/parse round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tklan_proto::AppLine;

fuzz_target!(|data: &str| {
    if let Ok(line) = AppLine::parse(data) {
        let emitted = line.emit();
        let reparsed = AppLine::parse(&emitted).expect("emitted lines always parse");
        assert_eq!(reparsed, line);
    }
});
