//! Fuzz target for decoding persisted state columns.
//!
//! Arbitrary integers must decode to a known state or `None`, and every
//! decoded state must survive any event without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replica_registry::{SyncEvent, SyncState, VerificationEvent, VerificationState};

fuzz_target!(|data: (i64, i64)| {
    let (sync, verification) = data;

    if let Some(state) = SyncState::from_i64(sync) {
        assert_eq!(state.as_i64(), sync);
        for event in SyncEvent::ALL {
            let _ = state.on(event);
        }
    }

    if let Some(state) = VerificationState::from_i64(verification) {
        assert_eq!(state.as_i64(), verification);
        for event in VerificationEvent::ALL {
            let _ = state.on(event);
        }
    }
});
