//! Fuzz target for checksum parsing.
//!
//! Parsing must never panic, and anything accepted must round-trip through
//! its lowercase form.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_registry::Checksum;

fuzz_target!(|data: &str| {
    if let Ok(checksum) = Checksum::from_hex(data) {
        assert_eq!(checksum.as_str(), data.to_ascii_lowercase());
        assert_eq!(Checksum::from_hex(checksum.as_str()), Ok(checksum.clone()));
        assert!(checksum.fingerprint().len() <= 12);
    }
});
