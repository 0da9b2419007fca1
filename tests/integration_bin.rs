/// integration tests for full binary
use assert_cmd::Command;
use portpicker::pick_unused_port;
use predicates::prelude::*;
use std::time::{Duration, Instant};

fn rtp_packet(seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x80, 96];
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&(u32::from(seq) * 160).to_be_bytes());
    buf.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[test]
fn bin_version() {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    let assert = cmd.arg("-V").assert();
    assert
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")))
        .success();
}

#[test]
fn bin_no_subcommand() {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    cmd.assert()
        .stderr(predicate::str::contains("unknown subcommand"))
        .failure();
}

#[test]
fn bin_receive_invalid_transport() {
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    let assert = cmd.args(["receive", "-t", "sctp"]).assert();
    assert
        .stderr(predicate::str::contains(
            "unsupported transport protocol 'sctp'",
        ))
        .failure();
}

#[test]
fn bin_receive_port_in_use() {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    // SO_REUSEADDR allows a 2nd bind on some platforms
    if !cfg!(target_os = "linux") {
        return;
    }
    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    cmd.args(["receive", "-i", "127.0.0.1", "-p", &port.to_string()])
        .timeout(Duration::from_secs(5))
        .assert()
        .stderr(
            predicate::str::contains("failed to provision socket")
                .or(predicate::str::contains("SocketProvision")),
        )
        .failure();
}

#[test]
fn bin_receive_duration_print_headers() {
    let port: u16 = pick_unused_port().expect("no ports free");

    // send packets while the receiver runs
    let t = std::thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let start_time = Instant::now();
        let mut seq = 0u16;
        while start_time.elapsed() < Duration::from_millis(1500) {
            socket
                .send_to(&rtp_packet(seq, b"payload"), ("127.0.0.1", port))
                .unwrap();
            seq += 1;
            std::thread::sleep(Duration::from_millis(20));
        }
        seq
    });

    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    let assert = cmd
        .args([
            "receive",
            "-v",
            "-i",
            "127.0.0.1",
            "-p",
            &port.to_string(),
            "-x",
            "--duration",
            "2",
        ])
        .timeout(Duration::from_secs(10))
        .assert()
        .stdout(predicate::str::contains("cafebabe pt= 96"))
        .stdout(predicate::str::is_match("received [1-9][0-9]* packets").unwrap())
        .success();
    println!("{:?}", assert.get_output());
    let nr_sent = t.join().unwrap();
    assert!(nr_sent > 0);
}

#[test]
fn bin_receive_to_file() {
    let port: u16 = pick_unused_port().expect("no ports free");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.rtp");

    let t = std::thread::spawn(move || {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let start_time = Instant::now();
        while start_time.elapsed() < Duration::from_millis(1500) {
            socket
                .send_to(&rtp_packet(1, b"RTP!"), ("127.0.0.1", port))
                .unwrap();
            std::thread::sleep(Duration::from_millis(50));
        }
    });

    let mut cmd = Command::cargo_bin(env!("CARGO_PKG_NAME")).unwrap();
    cmd.args([
        "receive",
        "-i",
        "127.0.0.1",
        "-p",
        &port.to_string(),
        "-s",
        "-o",
        &path.to_string_lossy(),
        "--duration",
        "2",
    ])
    .timeout(Duration::from_secs(10))
    .assert()
    .stdout(predicate::str::contains("written"))
    .success();
    t.join().unwrap();

    let content = std::fs::read(&path).unwrap();
    assert!(!content.is_empty());
    assert_eq!(content.len() % 4, 0);
    assert!(content.chunks(4).all(|c| c == b"RTP!"));
}
