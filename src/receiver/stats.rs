use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Debug, Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_written: AtomicU64,
    bytes_written: AtomicU64,
    packets_delivered: AtomicU64,
    packets_invalid: AtomicU64,
    packets_discarded: AtomicU64,
}

/// Counters shared by the workers of a receiver. Cheap to clone.
#[derive(Debug, Default, Clone)]
pub struct ReceiverStats(Arc<Counters>);

/// Point in time copy of [ReceiverStats].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// packets pushed to the queue by the listener
    pub packets_received: u64,
    pub bytes_received: u64,
    /// packets written to the capture sink
    pub packets_written: u64,
    pub bytes_written: u64,
    /// packets passed to the handler (callback mode)
    pub packets_delivered: u64,
    /// packets that couldn't be parsed as RTP and were skipped
    pub packets_invalid: u64,
    /// packets left in the queue on stop
    pub packets_discarded: u64,
}

impl ReceiverStats {
    pub(crate) fn add_received(&self, bytes: usize) {
        self.0.packets_received.fetch_add(1, Ordering::Relaxed);
        self.0
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, bytes: usize) {
        self.0.packets_written.fetch_add(1, Ordering::Relaxed);
        self.0
            .bytes_written
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_delivered(&self) {
        self.0.packets_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_invalid(&self) {
        self.0.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_discarded(&self, nr_packets: usize) {
        self.0
            .packets_discarded
            .fetch_add(nr_packets as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.0.packets_received.load(Ordering::Relaxed),
            bytes_received: self.0.bytes_received.load(Ordering::Relaxed),
            packets_written: self.0.packets_written.load(Ordering::Relaxed),
            bytes_written: self.0.bytes_written.load(Ordering::Relaxed),
            packets_delivered: self.0.packets_delivered.load(Ordering::Relaxed),
            packets_invalid: self.0.packets_invalid.load(Ordering::Relaxed),
            packets_discarded: self.0.packets_discarded.load(Ordering::Relaxed),
        }
    }
}
