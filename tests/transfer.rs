//! End-to-end transfer tests.
//!
//! Each test spins up a sender and a receiver in one process, talking over
//! the loopback interface.  Both sides run as separate tokio tasks so they
//! can make progress concurrently without blocking each other.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;

use rtp_over_udp::error::TransferError;
use rtp_over_udp::receiver::Receiver;
use rtp_over_udp::sender::Sender;
use rtp_over_udp::simulator::SimulatorConfig;
use rtp_over_udp::socket::Socket;

/// Bind a socket to an OS-assigned port on loopback.
async fn ephemeral() -> Socket {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind failed")
}

/// Unique scratch path in the system temp directory.
fn temp_path(tag: &str) -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("rtp-test-{}-{tag}-{n}.bin", std::process::id()))
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

/// Drive one complete transfer of `data` and return both engines (for
/// stats assertions) plus the bytes that landed in the output file.
async fn run_transfer(
    data: &[u8],
    window: u16,
    faults: Option<(SimulatorConfig, u64)>,
) -> (Sender, Receiver, Vec<u8>) {
    let input = temp_path("in");
    let output = temp_path("out");
    std::fs::write(&input, data).expect("write input");

    let recv_sock = ephemeral().await;
    let recv_addr = recv_sock.local_addr();

    let out_path = output.clone();
    let receiver = tokio::spawn(async move {
        let mut receiver = Receiver::new(recv_sock, window);
        receiver.run(&out_path).await.expect("receiver run");
        receiver
    });

    let in_path = input.clone();
    let sender = tokio::spawn(async move {
        let sock = ephemeral().await;
        let mut sender =
            Sender::new(sock, recv_addr, &in_path, window).expect("open input file");
        if let Some((config, seed)) = faults {
            sender.set_fault_injection(config, seed);
        }
        sender.run().await.expect("sender run");
        sender
    });

    let (receiver, sender) = tokio::join!(receiver, sender);
    let received = std::fs::read(&output).expect("read output");

    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);
    (sender.unwrap(), receiver.unwrap(), received)
}

// ---------------------------------------------------------------------------
// Lossless transfers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_byte_file() {
    let data = vec![0x42u8];
    let (sender, receiver, received) = run_transfer(&data, 32, None).await;

    assert_eq!(received, data);
    assert_eq!(sender.stats.retransmits, 0);
    assert_eq!(receiver.stats.total_packets, 1);
    assert_eq!(receiver.stats.bytes_written, 1);
    assert_eq!(receiver.stats.duplicate_packets, 0);
}

#[tokio::test]
async fn empty_file_closes_cleanly() {
    let (sender, receiver, received) = run_transfer(&[], 32, None).await;

    assert!(received.is_empty());
    assert_eq!(sender.stats.retransmits, 0);
    assert_eq!(receiver.stats.total_packets, 0);
    assert_eq!(receiver.stats.bytes_written, 0);
}

#[tokio::test]
async fn multi_segment_transfer_is_byte_exact() {
    // 100 000 bytes → 69 segments, a few window's worth.
    let data = random_bytes(100_000);
    let (sender, receiver, received) = run_transfer(&data, 32, None).await;

    assert_eq!(received, data);
    assert_eq!(sender.stats.retransmits, 0, "loopback must not retransmit");
    assert_eq!(receiver.stats.bytes_written, data.len() as u64);
}

#[tokio::test]
async fn large_transfer_window32() {
    let data = random_bytes(1 << 20); // 1 MiB, 719 segments
    let (_, receiver, received) = run_transfer(&data, 32, None).await;

    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);
    assert_eq!(receiver.stats.bytes_written, data.len() as u64);
}

#[tokio::test]
async fn window_one_degrades_to_stop_and_wait() {
    let data = random_bytes(10_000); // 7 segments
    let (sender, _, received) = run_transfer(&data, 1, None).await;

    assert_eq!(received, data);
    assert_eq!(sender.stats.retransmits, 0);
}

// ---------------------------------------------------------------------------
// Faulty network
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lossy_link_recovers_byte_exact() {
    // 69 data segments with one in five datagrams dropped on the sender's
    // outgoing path: retransmission machinery must fill every hole.
    let data = random_bytes(100_000);
    let faults = SimulatorConfig {
        loss_rate: 0.2,
        ..SimulatorConfig::default()
    };
    let (sender, _, received) = run_transfer(&data, 32, Some((faults, 7))).await;

    assert_eq!(received, data);
    assert!(
        sender.stats.retransmits > 0,
        "a 20% lossy link without retransmits is not plausible"
    );
}

#[tokio::test]
async fn corrupted_datagrams_are_dropped_and_recovered() {
    let data = random_bytes(50_000);
    let faults = SimulatorConfig {
        corrupt_rate: 0.15,
        ..SimulatorConfig::default()
    };
    let (_, _, received) = run_transfer(&data, 32, Some((faults, 11))).await;

    // Corrupted datagrams fail the checksum at the receiver and count as
    // loss; the payload must still arrive intact.
    assert_eq!(received, data);
}

#[tokio::test]
async fn duplicated_datagrams_do_not_corrupt_output() {
    let data = random_bytes(50_000);
    let faults = SimulatorConfig {
        duplicate_rate: 0.3,
        ..SimulatorConfig::default()
    };
    let (_, receiver, received) = run_transfer(&data, 32, Some((faults, 3))).await;

    assert_eq!(received, data);
    assert!(
        receiver.stats.duplicate_packets > 0,
        "30% duplication must surface duplicates at the receiver"
    );
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_fails_when_nobody_listens() {
    // Bind-then-drop guarantees the port is dead.
    let dead_addr = {
        let sock = ephemeral().await;
        sock.local_addr()
    };

    let input = temp_path("in");
    std::fs::write(&input, b"payload").unwrap();

    let sock = ephemeral().await;
    let mut sender = Sender::new(sock, dead_addr, &input, 32).expect("open input");
    let err = sender.run().await.expect_err("handshake must fail");
    assert!(matches!(err, TransferError::HandshakeFailed), "got {err}");

    let _ = std::fs::remove_file(&input);
}
