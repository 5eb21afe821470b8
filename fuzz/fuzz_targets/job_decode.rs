#![no_main]
//! Arbitrary job snapshots must decode or fail cleanly, and anything that
//! decodes must survive a re-encode with the same state.

use jobwatch_core::Job;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(job) = serde_json::from_slice::<Job>(data) else {
        return;
    };
    let encoded = serde_json::to_value(&job).expect("a decoded job always encodes");
    let again: Job = serde_json::from_value(encoded).expect("an encoded job always decodes");
    assert_eq!(again.state(), job.state());
    assert_eq!(again.id, job.id);
});
