//! Fuzz target for comm frame decoding.
//!
//! Arbitrary bytes from the peer must decode to Ok or Err, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use kernel_comm::comm::{decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = decode_frame(data) {
        // Anything accepted must encode again.
        let _ = encode_frame(&frame);
    }
});
