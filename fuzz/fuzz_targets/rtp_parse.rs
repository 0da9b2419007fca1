#![no_main]

use libfuzzer_sys::fuzz_target;
use rtpcap::rtp::RtpPacket;

fuzz_target!(|data: &[u8]| {
    if let Ok(p) = RtpPacket::parse(data) {
        assert_eq!(p.raw(), data);
        assert!(p.header_len() + p.payload().len() <= data.len());
        let _ = format!("{:?}", p);
        let _ = p.header_as_text();
    }
});
