use std::sync::{Arc, Mutex};

use slog::{debug, error, info};

use super::queue::{PacketQueueReceiver, PopError};
use super::sink::CaptureSink;
use super::socket::RECV_TIMEOUT;
use super::stats::ReceiverStats;
use super::worker::{CancelToken, ThreadWorker};
use super::{Error, RecvTimestamp};
use crate::rtp::RtpPacket;
use crate::utils::lock_ignore_poison;

/// Handler called for every received packet in callback mode.
pub type PacketHandler = Box<dyn FnMut(RtpPacket, RecvTimestamp) + Send>;

/// What the packet writer does with each parsed packet.
pub enum WriterMode {
    /// pass packet and receive time to the handler. Sink and timestamp log stay untouched.
    Callback(PacketHandler),
    /// persist the packet (or its payload only) and log its receive time
    Sink {
        sink: Arc<Mutex<CaptureSink>>,
        strip_headers: bool,
        timestamps: Arc<Mutex<Vec<RecvTimestamp>>>,
        /// set to the write error if writing fails
        last_error: Arc<Mutex<Option<Error>>>,
    },
}

impl std::fmt::Debug for WriterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterMode::Callback(_) => write!(f, "Callback"),
            WriterMode::Sink { strip_headers, .. } => {
                write!(f, "Sink(strip_headers={})", strip_headers)
            }
        }
    }
}

/// Start the packet writer thread.
///
/// Pops entries in FIFO order until the run is cancelled or the listener side
/// of the queue is gone. Entries still queued on cancellation are discarded.
/// A failing sink write is stored in `last_error` and cancels the whole run.
pub fn start_packet_writer(
    log: slog::Logger,
    queue: PacketQueueReceiver,
    mut mode: WriterMode,
    cancel: CancelToken,
    stats: ReceiverStats,
) -> Result<ThreadWorker, Error> {
    let cancel_thread = cancel.clone();
    ThreadWorker::spawn("rtp_packet_writer", cancel, move || {
        let cancel = cancel_thread;
        debug!(log, "packet writer started in mode {:?}", mode);
        loop {
            if cancel.is_cancelled() {
                let discarded = queue.drain().len();
                if discarded > 0 {
                    info!(log, "discarding {} queued packets", discarded);
                    stats.add_discarded(discarded);
                }
                break;
            }
            let entry = match queue.pop_timeout(RECV_TIMEOUT) {
                Ok(entry) => entry,
                Err(PopError::Timeout) => continue,
                Err(PopError::Disconnected) => {
                    debug!(log, "packet queue disconnected");
                    break;
                }
            };
            let timestamp = entry.timestamp;
            let packet = match RtpPacket::from_vec(entry.data) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(log, "skipping invalid rtp packet: {}", e);
                    stats.add_invalid();
                    continue;
                }
            };
            match &mut mode {
                WriterMode::Callback(handler) => {
                    handler(packet, timestamp);
                    stats.add_delivered();
                }
                WriterMode::Sink {
                    sink,
                    strip_headers,
                    timestamps,
                    last_error,
                } => {
                    let data = if *strip_headers {
                        packet.payload()
                    } else {
                        packet.raw()
                    };
                    let res = lock_ignore_poison(sink).write_all(data);
                    match res {
                        Ok(()) => {
                            stats.add_written(data.len());
                            lock_ignore_poison(timestamps).push(timestamp);
                        }
                        Err(e) => {
                            error!(log, "{}. Stopping receiver.", e);
                            *lock_ignore_poison(last_error) = Some(e);
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
        debug!(log, "packet writer thread stopped.");
    })
    .map_err(Error::Spawn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::listener::tests::new_logger;
    use crate::receiver::queue::packet_queue;
    use crate::receiver::sink::{
        open_capture_sink,
        tests::{FailingWriter, SharedBuf},
    };
    use crate::receiver::worker::Worker;
    use crate::receiver::CaptureFile;
    use crate::rtp::packet_for_test;
    use ntest::timeout;
    use std::time::Duration;

    struct SinkSetup {
        buf: SharedBuf,
        sink: Arc<Mutex<CaptureSink>>,
        timestamps: Arc<Mutex<Vec<RecvTimestamp>>>,
        last_error: Arc<Mutex<Option<Error>>>,
    }

    impl SinkSetup {
        fn new() -> Self {
            let buf = SharedBuf::default();
            let mut cf = Some(CaptureFile::Writer(Box::new(buf.clone())));
            let sink = open_capture_sink(&mut cf).unwrap();
            SinkSetup {
                buf,
                sink: Arc::new(Mutex::new(sink)),
                timestamps: Default::default(),
                last_error: Default::default(),
            }
        }

        fn mode(&self, strip_headers: bool) -> WriterMode {
            WriterMode::Sink {
                sink: self.sink.clone(),
                strip_headers,
                timestamps: self.timestamps.clone(),
                last_error: self.last_error.clone(),
            }
        }

        fn close(&self) {
            self.sink.lock().unwrap().close().unwrap();
        }
    }

    fn wait_until(f: impl Fn() -> bool) {
        while !f() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[timeout(2000)]
    fn sink_raw_and_strip_headers() {
        for strip_headers in [false, true] {
            let setup = SinkSetup::new();
            let (tx, rx) = packet_queue();
            let stats = ReceiverStats::default();
            let mut writer = start_packet_writer(
                new_logger(),
                rx,
                setup.mode(strip_headers),
                CancelToken::new(),
                stats.clone(),
            )
            .unwrap();
            let p1 = packet_for_test(1, b"hello");
            let p2 = packet_for_test(2, b"world");
            let ts1 = chrono::Utc::now();
            let ts2 = ts1 + chrono::TimeDelta::milliseconds(20);
            assert!(tx.push(p1.clone(), ts1));
            assert!(tx.push(p2.clone(), ts2));
            wait_until(|| stats.snapshot().packets_written == 2);
            writer.kill();
            setup.close();

            let expected = if strip_headers {
                b"helloworld".to_vec()
            } else {
                [p1, p2].concat()
            };
            assert_eq!(setup.buf.contents(), expected);
            assert_eq!(*setup.timestamps.lock().unwrap(), vec![ts1, ts2]);
            assert_eq!(stats.snapshot().bytes_written, expected.len() as u64);
        }
    }

    #[test]
    #[timeout(2000)]
    fn callback_takes_precedence() {
        let setup = SinkSetup::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_t = received.clone();
        let (tx, rx) = packet_queue();
        let stats = ReceiverStats::default();
        let mut writer = start_packet_writer(
            new_logger(),
            rx,
            WriterMode::Callback(Box::new(move |packet, ts| {
                received_t
                    .lock()
                    .unwrap()
                    .push((packet.sequence_number, packet.payload().to_vec(), ts));
            })),
            CancelToken::new(),
            stats.clone(),
        )
        .unwrap();
        let ts = chrono::Utc::now();
        assert!(tx.push(packet_for_test(7, b"abc"), ts));
        assert!(tx.push(packet_for_test(8, b"def"), ts));
        wait_until(|| stats.snapshot().packets_delivered == 2);
        writer.kill();
        setup.close();
        assert_eq!(
            *received.lock().unwrap(),
            vec![(7, b"abc".to_vec(), ts), (8, b"def".to_vec(), ts)]
        );
        assert!(setup.buf.contents().is_empty());
        assert!(setup.timestamps.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().packets_written, 0);
    }

    #[test]
    #[timeout(2000)]
    fn invalid_packets_skipped() {
        let setup = SinkSetup::new();
        let (tx, rx) = packet_queue();
        let stats = ReceiverStats::default();
        let mut writer = start_packet_writer(
            new_logger(),
            rx,
            setup.mode(true),
            CancelToken::new(),
            stats.clone(),
        )
        .unwrap();
        let ts = chrono::Utc::now();
        assert!(tx.push(vec![0x80, 0x60], ts)); // too short
        assert!(tx.push(packet_for_test(3, b"ok"), ts));
        wait_until(|| stats.snapshot().packets_written == 1);
        writer.kill();
        setup.close();
        assert_eq!(stats.snapshot().packets_invalid, 1);
        assert_eq!(setup.buf.contents(), b"ok");
        assert_eq!(setup.timestamps.lock().unwrap().len(), 1);
    }

    #[test]
    #[timeout(2000)]
    fn write_failure_stops_and_reports() {
        let mut cf = Some(CaptureFile::Writer(Box::new(FailingWriter)));
        let sink = Arc::new(Mutex::new(open_capture_sink(&mut cf).unwrap()));
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let last_error = Arc::new(Mutex::new(None));
        let (tx, rx) = packet_queue();
        let cancel = CancelToken::new();
        let writer = start_packet_writer(
            new_logger(),
            rx,
            WriterMode::Sink {
                sink,
                strip_headers: false,
                timestamps: timestamps.clone(),
                last_error: last_error.clone(),
            },
            cancel.clone(),
            ReceiverStats::default(),
        )
        .unwrap();
        // larger than the BufWriter capacity so the write hits the writer
        assert!(tx.push(packet_for_test(1, &[0u8; 16 * 1024]), chrono::Utc::now()));
        wait_until(|| !writer.is_alive());
        assert!(cancel.is_cancelled());
        assert!(matches!(
            *last_error.lock().unwrap(),
            Some(Error::SinkWrite(_))
        ));
        assert!(timestamps.lock().unwrap().is_empty());
    }

    #[test]
    #[timeout(2000)]
    fn cancelled_discards_queued() {
        let setup = SinkSetup::new();
        let (tx, rx) = packet_queue();
        let ts = chrono::Utc::now();
        for seq in 0..5 {
            assert!(tx.push(packet_for_test(seq, b"x"), ts));
        }
        let cancel = CancelToken::new();
        cancel.cancel();
        let stats = ReceiverStats::default();
        let writer = start_packet_writer(
            new_logger(),
            rx,
            setup.mode(false),
            cancel,
            stats.clone(),
        )
        .unwrap();
        wait_until(|| !writer.is_alive());
        setup.close();
        assert!(setup.buf.contents().is_empty());
        assert_eq!(stats.snapshot().packets_discarded, 5);
        assert_eq!(stats.snapshot().packets_written, 0);
    }

    #[test]
    #[timeout(2000)]
    fn stops_when_listener_gone() {
        let setup = SinkSetup::new();
        let (tx, rx) = packet_queue();
        assert!(tx.push(packet_for_test(1, b"last"), chrono::Utc::now()));
        drop(tx);
        let writer = start_packet_writer(
            new_logger(),
            rx,
            setup.mode(true),
            CancelToken::new(),
            ReceiverStats::default(),
        )
        .unwrap();
        wait_until(|| !writer.is_alive());
        setup.close();
        assert_eq!(setup.buf.contents(), b"last");
    }
}
