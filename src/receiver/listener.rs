use slog::{debug, error, info};

use super::queue::PacketQueueSender;
use super::socket::PacketSource;
use super::stats::ReceiverStats;
use super::worker::{CancelToken, ThreadWorker};
use super::Error;

/// Start the listener thread.
///
/// It receives from `source` and pushes every packet with its receive time onto
/// the queue until the run is cancelled. The socket is closed when the thread
/// exits.
pub fn start_listener(
    log: slog::Logger,
    mut source: Box<dyn PacketSource>,
    queue: PacketQueueSender,
    cancel: CancelToken,
    stats: ReceiverStats,
) -> Result<ThreadWorker, Error> {
    let cancel_thread = cancel.clone();
    ThreadWorker::spawn("rtp_listener", cancel, move || {
        let cancel = cancel_thread;
        while !cancel.is_cancelled() {
            match source.recv_packet() {
                Ok((data, timestamp)) => {
                    stats.add_received(data.len());
                    if !queue.push(data, timestamp) {
                        info!(log, "packet queue closed, stopping listener");
                        break;
                    }
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted => {
                        // nothing received, check cancellation
                        continue;
                    }
                    _ => {
                        error!(
                            log,
                            "error receiving packet: {} e.kind={}. Stopping receiver.",
                            e,
                            e.kind()
                        );
                        cancel.cancel();
                        break;
                    }
                },
            }
        }
        debug!(log, "listener thread stopped.");
        drop(source);
    })
    .map_err(Error::Spawn)
}
