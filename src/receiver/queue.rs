//! Packet queue between the listener and the packet writer.
//!
//! An unbounded mpsc channel: the listener never blocks on a slow writer, the
//! writer blocks (with a timeout to check for cancellation) on pop.
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use super::RecvTimestamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub data: Vec<u8>,
    pub timestamp: RecvTimestamp,
}

#[derive(Debug, Clone)]
pub struct PacketQueueSender {
    tx: mpsc::Sender<QueueEntry>,
}

#[derive(Debug)]
pub struct PacketQueueReceiver {
    rx: mpsc::Receiver<QueueEntry>,
}

/// create a new, empty packet queue
pub fn packet_queue() -> (PacketQueueSender, PacketQueueReceiver) {
    let (tx, rx) = mpsc::channel();
    (PacketQueueSender { tx }, PacketQueueReceiver { rx })
}

impl PacketQueueSender {
    /// Non blocking push. Returns false if the receiving side is gone.
    pub fn push(&self, data: Vec<u8>, timestamp: RecvTimestamp) -> bool {
        self.tx.send(QueueEntry { data, timestamp }).is_ok()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopError {
    /// nothing arrived within the timeout
    Timeout,
    /// all senders are dropped and the queue is empty
    Disconnected,
}

impl PacketQueueReceiver {
    pub fn pop_timeout(&self, timeout: Duration) -> Result<QueueEntry, PopError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => PopError::Timeout,
            RecvTimeoutError::Disconnected => PopError::Disconnected,
        })
    }

    /// blocking pop
    pub fn pop(&self) -> Result<QueueEntry, PopError> {
        self.rx.recv().map_err(|_| PopError::Disconnected)
    }

    /// entries currently queued, without waiting
    pub fn drain(&self) -> Vec<QueueEntry> {
        self.rx.try_iter().collect()
    }
}
