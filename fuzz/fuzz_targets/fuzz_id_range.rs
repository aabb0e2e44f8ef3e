//! Fuzz target for ID range parsing and batching.
//!
//! Tests that `low..high` parsing never panics and that batches of any
//! width tile the range without gaps or overlap.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_registry::IdRange;

fuzz_target!(|data: (&str, u16)| {
    let (text, width) = data;

    let Ok(range) = text.parse::<IdRange>() else {
        return;
    };
    assert!(range.low() <= range.high());

    // Keep huge ranges cheap
    let width = u64::from(width).max(range.width() / 1000);
    let mut next = range.low();
    for batch in range.batches(width).take(2000) {
        assert_eq!(batch.low(), next);
        assert!(batch.high() <= range.high());
        next = batch.high();
    }
});
