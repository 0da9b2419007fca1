//! Live RTP receiver.
//!
//! A [Receiver] owns the receive socket, a listener thread that reads packets
//! from it and a packet writer thread that either persists the packets to a
//! capture sink or passes them to a handler. Both threads are connected by an
//! unbounded packet queue.
//!
//! Whether a receiver is running is never stored. It is derived from the
//! liveness of both workers, so a worker that died (e.g. due to a sink write
//! error) is reflected immediately.
mod error;
pub mod listener;
pub mod queue;
pub mod sink;
pub mod socket;
mod stats;
pub mod worker;
pub mod writer;

pub use error::Error;
pub use sink::CaptureFile;
pub use socket::{
    IpSocketProvisioner, PacketSource, SocketConfig, SocketProvisioner, TransportProtocol,
};
pub use stats::{ReceiverStats, StatsSnapshot};
pub use writer::PacketHandler;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use slog::{debug, error, info, warn};

use crate::rtp::RtpPacket;
use crate::utils::lock_ignore_poison;
use listener::start_listener;
use queue::packet_queue;
use sink::{open_capture_sink, CaptureSink};
use worker::{CancelToken, Worker};
use writer::{start_packet_writer, WriterMode};

/// Receive time of a packet.
pub type RecvTimestamp = chrono::DateTime<chrono::Utc>;

pub const DEFAULT_RTP_PORT: u16 = 6970;
/// max. size of a received packet, larger datagrams are truncated
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Configuration of a [Receiver]. All fields have defaults.
#[derive(Debug)]
pub struct ReceiverOptions {
    pub transport_protocol: TransportProtocol,
    /// address to bind to. A multicast address here joins that group.
    pub ip_address: Ipv4Addr,
    pub rtp_port: u16,
    pub capture_file: CaptureFile,
    /// persist the payload only instead of the full packets
    pub strip_headers: bool,
    /// multicast group to join. Takes precedence over a multicast `ip_address`.
    pub multicast_address: Option<Ipv4Addr>,
    /// interface (ipv4) used for the multicast join. Default interface if none.
    pub multicast_interface: Option<Ipv4Addr>,
    pub max_packet_size: usize,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        ReceiverOptions {
            transport_protocol: TransportProtocol::default(),
            ip_address: Ipv4Addr::UNSPECIFIED,
            rtp_port: DEFAULT_RTP_PORT,
            capture_file: CaptureFile::default(),
            strip_headers: false,
            multicast_address: None,
            multicast_interface: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

pub struct Receiver {
    log: slog::Logger,
    transport_protocol: TransportProtocol,
    ip_address: Ipv4Addr,
    rtp_port: u16,
    strip_headers: bool,
    multicast_address: Option<Ipv4Addr>,
    multicast_interface: Option<Ipv4Addr>,
    max_packet_size: usize,
    provisioner: Box<dyn SocketProvisioner>,

    listener: Option<Box<dyn Worker>>,
    packet_writer: Option<Box<dyn Worker>>,
    /// None once a caller provided writer was handed to a sink
    capture_file: Option<CaptureFile>,
    sink: Option<Arc<Mutex<CaptureSink>>>,
    timestamps: Arc<Mutex<Vec<RecvTimestamp>>>,
    stats: ReceiverStats,
    last_error: Arc<Mutex<Option<Error>>>,
    local_addr: Option<SocketAddr>,
}

impl Receiver {
    pub fn new(log: slog::Logger, options: ReceiverOptions) -> Receiver {
        Receiver::with_provisioner(log, options, Box::new(IpSocketProvisioner))
    }

    /// Create a receiver that opens its sockets via `provisioner`.
    pub fn with_provisioner(
        log: slog::Logger,
        options: ReceiverOptions,
        provisioner: Box<dyn SocketProvisioner>,
    ) -> Receiver {
        Receiver {
            log,
            transport_protocol: options.transport_protocol,
            ip_address: options.ip_address,
            rtp_port: options.rtp_port,
            strip_headers: options.strip_headers,
            multicast_address: options.multicast_address,
            multicast_interface: options.multicast_interface,
            max_packet_size: options.max_packet_size,
            provisioner,
            listener: None,
            packet_writer: None,
            capture_file: Some(options.capture_file),
            sink: None,
            timestamps: Default::default(),
            stats: ReceiverStats::default(),
            last_error: Default::default(),
            local_addr: None,
        }
    }

    /// Start receiving and persist the packets to the capture sink.
    ///
    /// Returns `Ok(false)` if the receiver was running already.
    pub fn start(&mut self) -> Result<bool, Error> {
        self.start_impl(None)
    }

    /// Start receiving and pass each packet with its receive time to `handler`.
    ///
    /// The capture sink and the timestamp log are not used in this mode. A
    /// [CaptureFile::Writer] is neither opened nor closed, so it stays available
    /// for a later [Receiver::start].
    pub fn start_with_handler<F>(&mut self, handler: F) -> Result<bool, Error>
    where
        F: FnMut(RtpPacket, RecvTimestamp) + Send + 'static,
    {
        self.start_impl(Some(Box::new(handler)))
    }

    /// Starts the packet writer first, then the socket and the listener.
    ///
    /// At most one packet writer exists per receiver: while running nothing is
    /// launched, otherwise the workers left over from an ended run are joined
    /// before the new writer starts.
    fn start_impl(&mut self, handler: Option<PacketHandler>) -> Result<bool, Error> {
        if self.running() {
            debug!(self.log, "receiver already running");
            return Ok(false);
        }
        // a previous run might have ended on its own
        self.teardown();

        let cancel = CancelToken::new();
        let (queue_tx, queue_rx) = packet_queue();
        self.stats = ReceiverStats::default();
        lock_ignore_poison(&self.timestamps).clear();
        *lock_ignore_poison(&self.last_error) = None;

        let mode = match handler {
            Some(handler) => WriterMode::Callback(handler),
            None => {
                let sink = Arc::new(Mutex::new(open_capture_sink(&mut self.capture_file)?));
                self.sink = Some(sink.clone());
                WriterMode::Sink {
                    sink,
                    strip_headers: self.strip_headers,
                    timestamps: self.timestamps.clone(),
                    last_error: self.last_error.clone(),
                }
            }
        };
        let writer = match start_packet_writer(
            self.log.clone(),
            queue_rx,
            mode,
            cancel.clone(),
            self.stats.clone(),
        ) {
            Ok(writer) => writer,
            Err(e) => {
                self.abort_start();
                return Err(e);
            }
        };
        self.packet_writer = Some(Box::new(writer));

        let config = self.socket_config();
        let source = match self.provisioner.init_socket(&self.log, &config) {
            Ok(source) => source,
            Err(e) => {
                error!(self.log, "starting receiver failed: {}", e);
                self.abort_start();
                return Err(e);
            }
        };
        self.local_addr = source.local_addr();
        match start_listener(
            self.log.clone(),
            source,
            queue_tx,
            cancel,
            self.stats.clone(),
        ) {
            Ok(listener) => self.listener = Some(Box::new(listener)),
            Err(e) => {
                self.abort_start();
                return Err(e);
            }
        }
        info!(
            self.log,
            "receiver started on {:?} via {}, multicast group {:?}",
            self.local_addr,
            self.transport_protocol,
            config.multicast_group
        );
        Ok(true)
    }

    /// Undo a start that failed before the listener ran.
    ///
    /// Nothing was received yet, so a caller provided writer is put back instead
    /// of being closed.
    fn abort_start(&mut self) {
        if let Some(mut writer) = self.packet_writer.take() {
            if writer.is_alive() {
                writer.kill();
            }
        }
        if let Some(sink) = self.sink.take() {
            let writer = lock_ignore_poison(&sink).into_inner();
            if self.capture_file.is_none() {
                self.capture_file = writer.map(CaptureFile::Writer);
            }
        }
    }

    /// Stop receiving and close the capture sink.
    ///
    /// Returns false if the receiver wasn't running. Leftovers of a run that
    /// ended on its own are cleaned up in that case as well.
    pub fn stop(&mut self) -> bool {
        if !self.running() {
            self.teardown();
            return false;
        }
        info!(self.log, "stopping receiver");
        self.teardown();
        true
    }

    fn teardown(&mut self) {
        self.stop_listener();
        self.stop_packet_writer();
    }

    fn stop_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            if listener.is_alive() {
                listener.kill();
            }
        }
    }

    fn stop_packet_writer(&mut self) {
        if self.writing_packets() {
            if let Some(writer) = self.packet_writer.as_mut() {
                // might have exited in between
                if writer.is_alive() {
                    writer.kill();
                }
            }
        }
        self.packet_writer = None;
        self.close_sink();
    }

    fn close_sink(&mut self) {
        if let Some(sink) = self.sink.take() {
            if let Err(e) = lock_ignore_poison(&sink).close() {
                warn!(self.log, "closing capture sink failed: {}", e);
                let mut last_error = lock_ignore_poison(&self.last_error);
                if last_error.is_none() {
                    *last_error = Some(e);
                }
            }
        }
    }

    pub fn running(&self) -> bool {
        self.listening() && self.writing_packets()
    }

    pub fn listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|w| w.is_alive())
    }

    pub fn writing_packets(&self) -> bool {
        self.packet_writer.as_ref().is_some_and(|w| w.is_alive())
    }

    /// Whether the configured ip address is a multicast one (224.0.0.0 - 239.255.255.255).
    pub fn multicast(&self) -> bool {
        self.ip_address.is_multicast()
    }

    /// The group joined on start: `multicast_address` if set, else the ip
    /// address if it is a multicast one.
    pub fn multicast_group(&self) -> Option<Ipv4Addr> {
        self.multicast_address
            .or_else(|| self.multicast().then_some(self.ip_address))
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    /// Takes effect on the next start.
    pub fn set_rtp_port(&mut self, port: u16) {
        self.rtp_port = port;
    }

    /// Always `rtp_port + 1`.
    pub fn rtcp_port(&self) -> u32 {
        u32::from(self.rtp_port) + 1
    }

    pub fn transport_protocol(&self) -> TransportProtocol {
        self.transport_protocol
    }

    pub fn ip_address(&self) -> Ipv4Addr {
        self.ip_address
    }

    pub fn strip_headers(&self) -> bool {
        self.strip_headers
    }

    /// Receive times of the packets written to the sink in the current/last run.
    pub fn packet_timestamps(&self) -> Vec<RecvTimestamp> {
        lock_ignore_poison(&self.timestamps).clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Error that ended the last run (e.g. a failed sink write), if any.
    pub fn take_last_error(&mut self) -> Option<Error> {
        lock_ignore_poison(&self.last_error).take()
    }

    /// Address the socket of the current/last run was bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            protocol: self.transport_protocol,
            addr: SocketAddrV4::new(self.ip_address, self.rtp_port),
            multicast_group: self.multicast_group(),
            multicast_interface: self.multicast_interface,
            max_packet_size: self.max_packet_size,
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.teardown();
    }
}
