#![no_main]

use libfuzzer_sys::fuzz_target;
use rtpcap::utils::Rfc4571Deframer;

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    let mut deframer = Rfc4571Deframer::new();
    let mut nr_bytes = 0usize;
    let mut nr_returned = 0usize;
    for chunk in &chunks {
        nr_bytes += chunk.len();
        deframer.push(chunk);
        while let Some(frame) = deframer.next_frame() {
            nr_returned += frame.len() + 2;
        }
    }
    assert_eq!(nr_returned + deframer.pending(), nr_bytes);
});
