use std::{fmt, net::SocketAddr};

#[derive(Debug)]
pub enum Error {
    /// transport protocol is neither udp nor tcp
    UnsupportedTransport(String),
    /// creating, configuring, binding or joining the socket failed
    SocketProvision {
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// writing to the capture sink failed. The packet writer stops on this.
    SinkWrite(std::io::Error),
    /// the capture sink was closed already and cannot be (re-)opened
    SinkClosed,
    /// opening the capture file failed
    SinkOpen(std::io::Error),
    /// a worker thread couldn't be spawned
    Spawn(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::SocketProvision { source, .. } => Some(source),
            Error::SinkWrite(e) | Error::SinkOpen(e) | Error::Spawn(e) => Some(e),
            Error::UnsupportedTransport(_) | Error::SinkClosed => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnsupportedTransport(name) => {
                write!(f, "unsupported transport protocol '{}' (use udp or tcp)", name)
            }
            Error::SocketProvision { addr, source } => {
                write!(f, "failed to provision socket for {}: {}", addr, source)
            }
            Error::SinkWrite(e) => write!(f, "failed to write to capture sink: {}", e),
            Error::SinkClosed => write!(f, "capture sink is closed"),
            Error::SinkOpen(e) => write!(f, "failed to open capture sink: {}", e),
            Error::Spawn(e) => write!(f, "failed to spawn worker thread: {}", e),
        }
    }
}

impl Error {
    /// helper to map an io error from a socket call to [Error::SocketProvision]
    pub(crate) fn provision(addr: SocketAddr) -> impl FnOnce(std::io::Error) -> Error {
        move |source| Error::SocketProvision { addr, source }
    }
}
