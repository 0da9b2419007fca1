use slog::{debug, info, warn};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};
use std::{
    io::Read,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
    str::FromStr,
    time::Duration,
};

use super::{Error, RecvTimestamp};
use crate::utils::{set_max_buffer_size, Rfc4571Deframer, RFC4571_MAX_FRAME_LEN};

/// How long a receive blocks before the listener checks for cancellation again.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// back-off while waiting for a tcp connection to be accepted
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// requested socket receive buffer size (the OS might limit it)
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

impl FromStr for TransportProtocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProtocol::Udp),
            "tcp" => Ok(TransportProtocol::Tcp),
            _ => Err(Error::UnsupportedTransport(s.to_string())),
        }
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Everything needed to open the receive socket of a run.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub protocol: TransportProtocol,
    /// (ip_address, rtp_port) to bind to
    pub addr: SocketAddrV4,
    /// group to join, see [super::Receiver::multicast_group()]
    pub multicast_group: Option<Ipv4Addr>,
    /// interface used for the join. None: default interface
    pub multicast_interface: Option<Ipv4Addr>,
    /// max. size of a single received packet (datagram or tcp frame)
    pub max_packet_size: usize,
}

impl SocketConfig {
    fn join_interface(&self) -> InterfaceIndexOrAddress {
        join_interface(self.multicast_interface)
    }
}

fn join_interface(addr: Option<Ipv4Addr>) -> InterfaceIndexOrAddress {
    match addr {
        Some(addr) => InterfaceIndexOrAddress::Address(addr),
        None => InterfaceIndexOrAddress::Index(0),
    }
}

/// A bound socket delivering one packet per call.
pub trait PacketSource: Send {
    /// Receive the next packet together with its receive time.
    ///
    /// Errors of kind `WouldBlock` or `TimedOut` mean that nothing was received.
    /// All other errors are fatal for the listener.
    fn recv_packet(&mut self) -> std::io::Result<(Vec<u8>, RecvTimestamp)>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Opens and configures the socket for a run.
pub trait SocketProvisioner: Send + Sync {
    fn init_socket(
        &self,
        log: &slog::Logger,
        config: &SocketConfig,
    ) -> Result<Box<dyn PacketSource>, Error>;
}

/// [SocketProvisioner] for real UDP/TCP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpSocketProvisioner;

impl SocketProvisioner for IpSocketProvisioner {
    fn init_socket(
        &self,
        log: &slog::Logger,
        config: &SocketConfig,
    ) -> Result<Box<dyn PacketSource>, Error> {
        match config.protocol {
            TransportProtocol::Udp => Ok(Box::new(UdpSource::new(log.clone(), config)?)),
            TransportProtocol::Tcp => Ok(Box::new(TcpSource::new(log.clone(), config)?)),
        }
    }
}

pub struct UdpSource {
    log: slog::Logger,
    socket: Socket,
    /// joined group and the interface address used for the join
    multicast: Option<(Ipv4Addr, Option<Ipv4Addr>)>,
    kernel_timestamps: bool,
    buf: Vec<u8>,
}

impl UdpSource {
    pub fn new(log: slog::Logger, config: &SocketConfig) -> Result<UdpSource, Error> {
        let addr = SocketAddr::V4(config.addr);
        let map_err = |e: std::io::Error| Error::provision(addr)(e);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        socket.set_reuse_address(true).map_err(map_err)?;
        let kernel_timestamps = match enable_rx_timestamps(&socket) {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!(log, "could not enable receive timestamps, using wall clock: {}", e);
                false
            }
        };
        if let Err(e) = set_max_buffer_size(&socket, false, RECV_BUFFER_SIZE) {
            warn!(log, "could not set recv buffer size: {}", e);
        }

        socket.bind(&SockAddr::from(bind_addr(config))).map_err(map_err)?;

        let multicast = if let Some(group) = config.multicast_group {
            let interface = config.join_interface();
            socket
                .join_multicast_v4_n(&group, &interface)
                .map_err(map_err)?;
            info!(
                log,
                "joined multicast group {} on interface {:?}", group, interface
            );
            Some((group, config.multicast_interface))
        } else {
            None
        };

        socket.set_read_timeout(Some(RECV_TIMEOUT)).map_err(map_err)?;
        socket.set_nonblocking(false).map_err(map_err)?;

        info!(
            log,
            "created UDP receiver socket: {:?} with receiver buffer size: {} and read timeout: {:?}, kernel timestamps: {}",
            socket.local_addr().ok().and_then(|a| a.as_socket()),
            socket.recv_buffer_size().unwrap_or(0),
            socket.read_timeout().ok().flatten(),
            kernel_timestamps
        );

        Ok(UdpSource {
            log,
            socket,
            multicast,
            kernel_timestamps,
            buf: vec![0u8; config.max_packet_size],
        })
    }
}

impl UdpSource {
    #[cfg(target_os = "linux")]
    fn recv_into_buf(&mut self) -> std::io::Result<(usize, RecvTimestamp)> {
        if self.kernel_timestamps {
            let (size, timestamp) = linux::recv_with_timestamp(&self.socket, &mut self.buf)?;
            return Ok((size, timestamp.unwrap_or_else(chrono::Utc::now)));
        }
        let size = (&self.socket).read(&mut self.buf)?;
        Ok((size, chrono::Utc::now()))
    }

    #[cfg(not(target_os = "linux"))]
    fn recv_into_buf(&mut self) -> std::io::Result<(usize, RecvTimestamp)> {
        let size = (&self.socket).read(&mut self.buf)?;
        Ok((size, chrono::Utc::now()))
    }
}

impl PacketSource for UdpSource {
    fn recv_packet(&mut self) -> std::io::Result<(Vec<u8>, RecvTimestamp)> {
        let (size, timestamp) = self.recv_into_buf()?;
        Ok((self.buf[..size].to_vec(), timestamp))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok().and_then(|a| a.as_socket())
    }
}

impl Drop for UdpSource {
    fn drop(&mut self) {
        if let Some((group, interface)) = self.multicast {
            if let Err(e) = self
                .socket
                .leave_multicast_v4_n(&group, &join_interface(interface))
            {
                warn!(self.log, "leaving multicast group {} failed: {}", group, e);
            }
        }
        info!(self.log, "dropping UDP receiver socket {:?}", self.local_addr());
    }
}

/// Accepts one connection at a time and splits the stream into RFC 4571 frames.
pub struct TcpSource {
    log: slog::Logger,
    listener: TcpListener,
    stream: Option<(TcpStream, SocketAddr)>,
    deframer: Rfc4571Deframer,
    read_buf: Vec<u8>,
    max_packet_size: usize,
    last_read: RecvTimestamp,
}

impl TcpSource {
    pub fn new(log: slog::Logger, config: &SocketConfig) -> Result<TcpSource, Error> {
        let addr = SocketAddr::V4(config.addr);
        let map_err = |e: std::io::Error| Error::provision(addr)(e);
        if let Some(group) = config.multicast_group {
            return Err(map_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("multicast group {} requires UDP transport", group),
            )));
        }

        let socket =
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(map_err)?;
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.bind(&SockAddr::from(addr)).map_err(map_err)?;
        socket.listen(1).map_err(map_err)?;
        // accept is polled so that the listener can be cancelled
        socket.set_nonblocking(true).map_err(map_err)?;
        let listener: TcpListener = socket.into();

        info!(
            log,
            "created TCP listening socket: {:?}",
            listener.local_addr().ok()
        );

        Ok(TcpSource {
            log,
            listener,
            stream: None,
            deframer: Rfc4571Deframer::new(),
            read_buf: vec![0u8; 2 * (RFC4571_MAX_FRAME_LEN + 2)],
            max_packet_size: config.max_packet_size.max(1),
            last_read: chrono::Utc::now(),
        })
    }

    fn accept(&mut self) -> std::io::Result<()> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                info!(self.log, "accepted TCP connection from {}", peer);
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(RECV_TIMEOUT))?;
                self.deframer.reset();
                self.stream = Some((stream, peer));
                Ok(())
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    Err(e)
                }
                kind if is_aborted_connection(kind) => {
                    // the pending connection is gone, the listening socket is fine
                    info!(self.log, "TCP connection aborted before accept: {}", e);
                    Err(std::io::ErrorKind::WouldBlock.into())
                }
                _ => Err(e),
            },
        }
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some((_stream, peer)) = self.stream.take() {
            info!(
                self.log,
                "TCP connection from {} closed ({}), {} bytes of an incomplete frame dropped",
                peer,
                reason,
                self.deframer.pending()
            );
        }
        self.deframer.reset();
    }
}

impl PacketSource for TcpSource {
    fn recv_packet(&mut self) -> std::io::Result<(Vec<u8>, RecvTimestamp)> {
        loop {
            if let Some(mut frame) = self.deframer.next_frame() {
                if frame.len() > self.max_packet_size {
                    debug!(
                        self.log,
                        "truncating frame of {} bytes to {}",
                        frame.len(),
                        self.max_packet_size
                    );
                    frame.truncate(self.max_packet_size);
                }
                return Ok((frame, self.last_read));
            }
            let Some((stream, _peer)) = self.stream.as_mut() else {
                self.accept()?;
                continue;
            };
            match stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.disconnect("closed by peer");
                    return Err(std::io::ErrorKind::WouldBlock.into());
                }
                Ok(size) => {
                    self.last_read = chrono::Utc::now();
                    self.deframer.push(&self.read_buf[..size]);
                }
                Err(e) => match e.kind() {
                    std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted => return Err(e),
                    _ => {
                        self.disconnect(&e.to_string());
                        return Err(std::io::ErrorKind::WouldBlock.into());
                    }
                },
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

impl Drop for TcpSource {
    fn drop(&mut self) {
        self.disconnect("receiver stopped");
        info!(self.log, "dropping TCP listening socket {:?}", self.local_addr());
    }
}

fn is_aborted_connection(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// Windows doesn't allow binding to a multicast address, bind to any there.
fn bind_addr(config: &SocketConfig) -> SocketAddr {
    if cfg!(windows) && config.addr.ip().is_multicast() {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.addr.port()))
    } else {
        SocketAddr::V4(config.addr)
    }
}

#[cfg(target_os = "linux")]
fn enable_rx_timestamps(socket: &Socket) -> std::io::Result<bool> {
    linux::enable_rx_timestamps(socket).map(|_| true)
}

#[cfg(not(target_os = "linux"))]
fn enable_rx_timestamps(_socket: &Socket) -> std::io::Result<bool> {
    Ok(false)
}

#[cfg(target_os = "linux")]
mod linux {
    use super::RecvTimestamp;
    use socket2::Socket;
    use std::os::unix::io::AsRawFd;

    /// SO_TIMESTAMPNS: the kernel adds the receive time as control message
    pub(super) fn enable_rx_timestamps(socket: &Socket) -> std::io::Result<()> {
        let on: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_TIMESTAMPNS,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// recvmsg returning the SCM_TIMESTAMPNS receive time if the kernel provided one
    pub(super) fn recv_with_timestamp(
        socket: &Socket,
        buf: &mut [u8],
    ) -> std::io::Result<(usize, Option<RecvTimestamp>)> {
        // u64 to get the alignment cmsghdr needs
        let mut cmsg_buf = [0u64; 8];

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&cmsg_buf) as _;

        let size = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
        if size < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut timestamp = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let cmsg_ref = unsafe { &*cmsg };
            if cmsg_ref.cmsg_level == libc::SOL_SOCKET
                && cmsg_ref.cmsg_type == libc::SCM_TIMESTAMPNS
            {
                let ts = unsafe {
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::timespec)
                };
                timestamp = chrono::DateTime::from_timestamp(ts.tv_sec as i64, ts.tv_nsec as u32);
                break;
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }
        Ok((size as usize, timestamp))
    }
}
