#![no_main]
//! The frame parser sees whatever the server sends; it must never panic.

use jobwatch_client::rpc::parse_incoming;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_incoming(text);
    }
});
