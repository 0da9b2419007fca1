pub mod receiver;
pub mod rtp;
pub mod utils;

pub fn name() -> &'static str {
    "rtpcap"
}
pub fn version() -> (u32, u32, u32) {
    (0, 3, 0)
}

pub use receiver::{
    CaptureFile, Error, Receiver, ReceiverOptions, ReceiverStats, RecvTimestamp, StatsSnapshot,
    TransportProtocol,
};
pub use rtp::RtpPacket;
