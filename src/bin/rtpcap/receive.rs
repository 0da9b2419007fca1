use std::{
    io::Write,
    net::Ipv4Addr,
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use clap::{Arg, ArgMatches, Command};
use rtpcap::{
    utils::lock_ignore_poison, CaptureFile, Receiver, ReceiverOptions, TransportProtocol,
};
use slog::{error, info};

pub fn add_subcommand(app: Command) -> Command {
    app.subcommand(
        Command::new("receive")
            .about("Receive a RTP stream via UDP/TCP and save it as file")
            .arg(
                Arg::new("ip")
                    .short('i')
                    .long("ip")
                    .num_args(1)
                    .default_value("0.0.0.0")
                    .help("ipv4 address to bind to. A multicast address joins that group.")
                    .value_parser(clap::value_parser!(Ipv4Addr)),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .num_args(1)
                    .help("RTP port to use (RTCP is expected on port+1)")
                    .default_value("6970")
                    .value_parser(clap::value_parser!(u16)),
            )
            .arg(
                Arg::new("transport")
                    .short('t')
                    .long("transport")
                    .num_args(1)
                    .default_value("udp")
                    .help("transport protocol: udp or tcp (RFC 4571 framing)")
                    .value_parser(|s: &str| {
                        TransportProtocol::from_str(s).map_err(|e| e.to_string())
                    }),
            )
            .arg(
                Arg::new("output_file")
                    .short('o')
                    .long("output")
                    .num_args(1)
                    .help("save packets in this file (overwrite existing file!). Default: temporary file")
                    .value_parser(clap::value_parser!(PathBuf)),
            )
            .arg(
                Arg::new("strip_headers")
                    .short('s')
                    .long("strip-headers")
                    .action(clap::ArgAction::SetTrue)
                    .help("save the RTP payload only"),
            )
            .arg(
                Arg::new("multicast_address")
                    .short('m')
                    .long("multicast-address")
                    .num_args(1)
                    .help("multicast group to join")
                    .value_parser(clap::value_parser!(Ipv4Addr)),
            )
            .arg(
                Arg::new("interface_address")
                    .long("interface")
                    .num_args(1)
                    .help("interface address (ipv4) to use for the multicast join")
                    .value_parser(clap::value_parser!(Ipv4Addr)),
            )
            .arg(
                Arg::new("headers")
                    .short('x')
                    .action(clap::ArgAction::SetTrue)
                    .conflicts_with_all(["output_file", "strip_headers"])
                    .help("Print RTP packet headers instead of saving the packets"),
            )
            .arg(
                Arg::new("duration")
                    .long("duration")
                    .num_args(1)
                    .help("stop after that many seconds")
                    .value_parser(clap::value_parser!(u64)),
            ),
    )
}

/// Receive until ctrl+c, the duration elapsed or the receiver stopped on an error.
///
/// Returns the number of packets received.
pub fn receive<W: std::io::Write + Send + 'static>(
    log: &slog::Logger,
    sub_m: &ArgMatches,
    writer_screen: W,
    stop_receive_param: Option<Arc<AtomicBool>>,
) -> Result<u64, Box<dyn std::error::Error>> {
    // all have default values, cannot fail
    let ip_address = *sub_m.get_one::<Ipv4Addr>("ip").unwrap();
    let rtp_port = *sub_m.get_one::<u16>("port").unwrap();
    let transport_protocol = *sub_m.get_one::<TransportProtocol>("transport").unwrap();
    let print_headers = sub_m.get_flag("headers");
    let duration = sub_m
        .get_one::<u64>("duration")
        .map(|secs| Duration::from_secs(*secs));

    let capture_file = match sub_m.get_one::<PathBuf>("output_file") {
        Some(path) => CaptureFile::Path(path.to_owned()),
        None => CaptureFile::TempFile,
    };
    let options = ReceiverOptions {
        transport_protocol,
        ip_address,
        rtp_port,
        capture_file,
        strip_headers: sub_m.get_flag("strip_headers"),
        multicast_address: sub_m.get_one::<Ipv4Addr>("multicast_address").copied(),
        multicast_interface: sub_m.get_one::<Ipv4Addr>("interface_address").copied(),
        ..Default::default()
    };
    info!(log, "receive with {:?}", options);

    let writer_screen = Arc::new(Mutex::new(writer_screen));
    let mut receiver = Receiver::new(log.clone(), options);

    let stop_receive = stop_receive_param
        .clone()
        .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    if stop_receive_param.is_none() {
        let log_c = log.clone();
        let stop_receive = stop_receive.clone();
        ctrlc::set_handler(move || {
            info!(log_c, "Ctrl+C received, stopping receiver...");
            stop_receive.store(true, Ordering::SeqCst);
        })?;
    }

    if print_headers {
        let screen = writer_screen.clone();
        receiver.start_with_handler(move |packet, timestamp| {
            let mut screen = lock_ignore_poison(&screen);
            let _ = write!(screen, "{} ", timestamp.format("%Y/%m/%d %H:%M:%S%.6f"))
                .and_then(|_| packet.header_as_text_to_write(&mut *screen))
                .and_then(|_| screen.write_all(b"\n"));
        })?;
    } else {
        receiver.start()?;
    }
    info!(
        log,
        "receiving on {:?} (rtcp port {}), multicast group {:?}",
        receiver.local_addr(),
        receiver.rtcp_port(),
        receiver.multicast_group()
    );

    let start_time = Instant::now();
    while !stop_receive.load(Ordering::SeqCst) && receiver.running() {
        if let Some(duration) = duration {
            if start_time.elapsed() >= duration {
                info!(log, "duration of {:?} elapsed", duration);
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    receiver.stop();

    let stats = receiver.stats();
    {
        let mut screen = lock_ignore_poison(&writer_screen);
        writeln!(
            screen,
            "received {} packets ({} bytes), written {} packets ({} bytes), delivered {}, invalid {}",
            stats.packets_received,
            stats.bytes_received,
            stats.packets_written,
            stats.bytes_written,
            stats.packets_delivered,
            stats.packets_invalid
        )?;
        screen.flush()?;
    }
    if let Some(e) = receiver.take_last_error() {
        error!(log, "receiver stopped with error: {}", e);
        return Err(Box::new(e));
    }
    Ok(stats.packets_received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portpicker::pick_unused_port;
    use slog::{o, Drain, Logger};
    use tempfile::NamedTempFile;

    fn new_logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    /// 12 byte RTP header (pt 96) followed by the payload
    fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0x80, 96];
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&(u32::from(seq) * 160).to_be_bytes());
        buf.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn params_wrong_port() {
        let arg_vec = vec!["t", "receive", "-p66666"];
        let sub_c = add_subcommand(Command::new("t")).try_get_matches_from(arg_vec);
        let err = sub_c.unwrap_err();
        assert!(err.kind() == clap::error::ErrorKind::ValueValidation);
        assert_eq!(err.to_string(), "error: invalid value '66666' for '--port <port>': 66666 is not in 0..=65535\n\nFor more information, try '--help'.\n");
    }

    #[test]
    fn params_wrong_transport() {
        let arg_vec = vec!["t", "receive", "-t", "sctp"];
        let sub_c = add_subcommand(Command::new("t")).try_get_matches_from(arg_vec);
        let err = sub_c.unwrap_err();
        assert!(err.kind() == clap::error::ErrorKind::ValueValidation);
        assert!(err
            .to_string()
            .contains("unsupported transport protocol 'sctp'"));
    }

    #[test]
    fn params_ok() {
        let arg_vec = vec!["t", "receive", "-t", "TCP", "-m", "239.1.2.3", "-s"];
        let sub_c = add_subcommand(Command::new("t")).get_matches_from(arg_vec);
        let (c, sub_m) = sub_c.subcommand().unwrap();
        assert_eq!("receive", c);
        assert_eq!(
            sub_m.get_one::<TransportProtocol>("transport"),
            Some(&TransportProtocol::Tcp)
        );
        assert_eq!(
            sub_m.get_one::<Ipv4Addr>("ip"),
            Some(&Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(sub_m.get_one::<u16>("port"), Some(&6970));
        assert_eq!(
            sub_m.get_one::<Ipv4Addr>("multicast_address"),
            Some(&Ipv4Addr::new(239, 1, 2, 3))
        );
        assert!(sub_m.get_flag("strip_headers"));
        assert!(!sub_m.get_flag("headers"));
    }

    #[test]
    fn params_headers_conflict_with_output() {
        let arg_vec = vec!["t", "receive", "-x", "-o", "foo.rtp"];
        let sub_c = add_subcommand(Command::new("t")).try_get_matches_from(arg_vec);
        assert_eq!(
            sub_c.unwrap_err().kind(),
            clap::error::ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn recv_udp() {
        let port = pick_unused_port().expect("no ports free");
        let port_str = port.to_string();

        let logger = new_logger();
        let file = NamedTempFile::new().unwrap();
        let file_path = file.path().to_str().unwrap();

        let arg_vec = vec![
            "t", "receive", "-i", "127.0.0.1", "-p", &port_str, "-o", file_path, "-s",
        ];
        let sub_c = add_subcommand(Command::new("t")).get_matches_from(arg_vec);
        let (_c, sub_m) = sub_c.subcommand().unwrap();
        let packets: Vec<Vec<u8>> = (0..5u16)
            .map(|seq| rtp_packet(seq, format!("[{}]", seq).as_bytes()))
            .collect();
        std::thread::scope(|s| {
            let stop_receive = Arc::new(AtomicBool::new(false));
            let stop_receive_t = stop_receive.clone();

            let logger_t = logger.clone();
            let t = s.spawn(move || {
                receive(&logger_t, sub_m, std::io::sink(), Some(stop_receive_t)).unwrap()
            });

            // give the receiver time to start
            std::thread::sleep(Duration::from_millis(200));
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            for p in &packets {
                socket.send_to(p, ("127.0.0.1", port)).unwrap();
            }
            std::thread::sleep(Duration::from_millis(200));
            stop_receive.store(true, Ordering::SeqCst);
            let nr_received = t.join().unwrap();
            assert_eq!(nr_received, packets.len() as u64);
        });
        assert_eq!(std::fs::read(file.path()).unwrap(), b"[0][1][2][3][4]");
    }

    #[test]
    fn recv_udp_print_headers() {
        let port = pick_unused_port().expect("no ports free");
        let port_str = port.to_string();

        let arg_vec = vec!["t", "receive", "-i", "127.0.0.1", "-p", &port_str, "-x"];
        let sub_c = add_subcommand(Command::new("t")).get_matches_from(arg_vec);
        let (_c, sub_m) = sub_c.subcommand().unwrap();

        #[derive(Clone, Default)]
        struct Screen(Arc<Mutex<Vec<u8>>>);
        impl Write for Screen {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let screen = Screen::default();
        let screen_t = screen.clone();

        std::thread::scope(|s| {
            let stop_receive = Arc::new(AtomicBool::new(false));
            let stop_receive_t = stop_receive.clone();
            let t = s.spawn(move || {
                receive(&new_logger(), sub_m, screen_t, Some(stop_receive_t)).unwrap()
            });
            std::thread::sleep(Duration::from_millis(200));
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .send_to(&rtp_packet(4711, b"abcd"), ("127.0.0.1", port))
                .unwrap();
            std::thread::sleep(Duration::from_millis(200));
            stop_receive.store(true, Ordering::SeqCst);
            assert_eq!(t.join().unwrap(), 1);
        });
        let output = String::from_utf8(screen.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(" 4711 "), "{}", output);
        assert!(output.contains("pt= 96"), "{}", output);
        assert!(output.contains("delivered 1"), "{}", output);
    }
}
