//! Integration tests for the TFTP server
//!
//! These tests start the actual server on an ephemeral loopback port and
//! exercise it with real UDP exchanges: reads, writes, netascii
//! transcoding, duplicate and stray packets, and the retransmission budget.

use std::net::SocketAddr;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tftp::server::{Server, ServerConfig};
use tokio::fs;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(300);

struct TestServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let mut server = Server::new(ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
        });
        let addr = server.bind().await.unwrap();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { server.run(rx).await });
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not drain")
            .unwrap()
            .unwrap();
    }
}

fn request_packet(opcode: u16, filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&opcode.to_be_bytes());
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

fn rrq(filename: &str, mode: &str) -> Vec<u8> {
    request_packet(1, filename, mode)
}

fn wrq(filename: &str, mode: &str) -> Vec<u8> {
    request_packet(2, filename, mode)
}

fn data_packet(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&3u16.to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn ack_packet(block: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&block.to_be_bytes());
    buf
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv(sock: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 1024];
    let (len, src) = timeout(RECV_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for the server")
        .unwrap();
    (buf[..len].to_vec(), src)
}

async fn recv_nothing(sock: &UdpSocket) {
    let mut buf = [0u8; 1024];
    assert!(
        timeout(QUIET, sock.recv_from(&mut buf)).await.is_err(),
        "server sent an unexpected packet"
    );
}

fn assert_data(packet: &[u8], block: u16) -> Vec<u8> {
    assert_eq!(&packet[0..2], &3u16.to_be_bytes(), "expected a DATA packet");
    assert_eq!(&packet[2..4], &block.to_be_bytes(), "unexpected block number");
    packet[4..].to_vec()
}

fn assert_ack(packet: &[u8], block: u16) {
    assert_eq!(&packet[0..2], &4u16.to_be_bytes(), "expected an ACK packet");
    assert_eq!(&packet[2..4], &block.to_be_bytes(), "unexpected block number");
    assert_eq!(packet.len(), 4);
}

fn assert_error(packet: &[u8], code: u16, message: &str) {
    assert_eq!(&packet[0..2], &5u16.to_be_bytes(), "expected an ERROR packet");
    assert_eq!(&packet[2..4], &code.to_be_bytes(), "unexpected error code");
    let mut expected = message.as_bytes().to_vec();
    expected.push(0);
    assert_eq!(&packet[4..], &expected[..], "unexpected error message");
}

async fn source_file(dir: &TempDir, name: &str, content: &[u8]) -> String {
    let path = dir.path().join(name);
    fs::write(&path, content).await.unwrap();
    path.to_str().unwrap().to_string()
}

#[tokio::test]
async fn test_rrq_octet_single_short_block() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..100u32).map(|i| (i * 37 % 256) as u8).collect();
    let path = source_file(&dir, "small.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    let payload = assert_data(&packet, 1);
    assert_eq!(payload, content);
    assert_ne!(session_addr, server.addr, "transfer must move to an ephemeral port");

    sock.send_to(&ack_packet(1), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    // The source file is untouched; the transfer served a snapshot.
    assert_eq!(fs::read(&path).await.unwrap(), content);

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_octet_exact_block_sends_empty_tail() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content = vec![0x42u8; 512];
    let path = source_file(&dir, "exact.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 1).len(), 512);

    sock.send_to(&ack_packet(1), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 2).len(), 0);

    sock.send_to(&ack_packet(2), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_octet_round_trip() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content: Vec<u8> = (0..1800u32).map(|i| (i % 251) as u8).collect();
    let path = source_file(&dir, "multi.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let mut received = Vec::new();
    let mut block = 1u16;
    loop {
        let (packet, session_addr) = recv(&sock).await;
        let payload = assert_data(&packet, block);
        received.extend_from_slice(&payload);
        sock.send_to(&ack_packet(block), session_addr).await.unwrap();
        if payload.len() < 512 {
            break;
        }
        block += 1;
    }

    assert_eq!(received, content);
    server.stop().await;
}

#[tokio::test]
async fn test_wrq_octet_two_full_blocks_and_tail() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let target = dir.path().join("upload.bin");

    let sock = client().await;
    sock.send_to(&wrq(target.to_str().unwrap(), "octet"), server.addr)
        .await
        .unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_ack(&packet, 0);

    sock.send_to(&data_packet(1, &[b'a'; 512]), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 1);

    sock.send_to(&data_packet(2, &[b'b'; 512]), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 2);

    sock.send_to(&data_packet(3, &[b'c'; 100]), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 3);

    let written = fs::read(&target).await.unwrap();
    assert_eq!(written.len(), 1124);
    assert_eq!(&written[0..512], &[b'a'; 512][..]);
    assert_eq!(&written[512..1024], &[b'b'; 512][..]);
    assert_eq!(&written[1024..], &[b'c'; 100][..]);

    server.stop().await;
}

#[tokio::test]
async fn test_wrq_mail_unknown_user() {
    // The mail prefix points at a directory that does not exist, so no
    // user's mailbox can be staged under it.
    tftp::staging::set_mail_prefix(std::env::temp_dir().join("tftpd-no-such-mail"));

    let server = TestServer::start().await;
    let sock = client().await;
    sock.send_to(&wrq("nobody", "mail"), server.addr).await.unwrap();

    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 7, "No such user.");

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_mail_is_illegal() {
    let server = TestServer::start().await;
    let sock = client().await;
    sock.send_to(&rrq("somebody", "mail"), server.addr).await.unwrap();

    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 4, "Illegal operation.");

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_missing_file() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.bin");

    let sock = client().await;
    sock.send_to(&rrq(path.to_str().unwrap(), "octet"), server.addr)
        .await
        .unwrap();

    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 1, "File not found.");

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_netascii_single_line() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let path = source_file(&dir, "line.txt", b"Hello, world!\n").await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "netascii"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    let payload = assert_data(&packet, 1);
    assert_eq!(payload, b"Hello, world!\r\n");

    sock.send_to(&ack_packet(1), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_rrq_mid_transfer_is_ignored() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content = vec![0x11u8; 600];
    let path = source_file(&dir, "dup.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 1).len(), 512);

    // A second RRQ to the transfer socket must not restart or disturb the
    // session.
    sock.send_to(&rrq(&path, "octet"), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    sock.send_to(&ack_packet(1), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 2).len(), 600 - 512);

    server.stop().await;
}

#[tokio::test]
async fn test_duplicate_wrq_mid_transfer_is_ignored() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let target = dir.path().join("dup-upload.bin");
    let filename = target.to_str().unwrap().to_string();

    let sock = client().await;
    sock.send_to(&wrq(&filename, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_ack(&packet, 0);

    sock.send_to(&wrq(&filename, "octet"), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    // The original session still accepts block 1.
    sock.send_to(&data_packet(1, b"payload"), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 1);

    assert_eq!(fs::read(&target).await.unwrap(), b"payload");

    server.stop().await;
}

#[tokio::test]
async fn test_wrq_duplicate_data_is_reacked_once_each() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let target = dir.path().join("dedup.bin");

    let sock = client().await;
    sock.send_to(&wrq(target.to_str().unwrap(), "octet"), server.addr)
        .await
        .unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_ack(&packet, 0);

    sock.send_to(&data_packet(1, &[b'x'; 512]), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 1);

    // The retransmitted block is acknowledged again but written only once.
    sock.send_to(&data_packet(1, &[b'x'; 512]), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 1);

    // An out-of-sequence block is dropped without a reply.
    sock.send_to(&data_packet(9, b"stray"), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    sock.send_to(&data_packet(2, b"end"), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 2);

    let written = fs::read(&target).await.unwrap();
    assert_eq!(written.len(), 515);

    server.stop().await;
}

#[tokio::test]
async fn test_short_ack_is_an_illegal_operation() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let path = source_file(&dir, "t.bin", &[0x55u8; 600]).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_data(&packet, 1);

    sock.send_to(&ack_packet(1)[..3], session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 4, "Illegal operation.");

    server.stop().await;
}

#[tokio::test]
async fn test_stray_ack_to_listener_is_unknown_tid() {
    let server = TestServer::start().await;
    let sock = client().await;

    sock.send_to(&ack_packet(3), server.addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 5, "Unknown TID.");

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_opcode_is_illegal() {
    let server = TestServer::start().await;
    let sock = client().await;

    sock.send_to(&[0u8, 9, 0, 0], server.addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_error(&packet, 4, "Illegal operation.");

    server.stop().await;
}

#[tokio::test]
async fn test_stranger_gets_unknown_tid_and_session_survives() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content = vec![0x77u8; 700];
    let path = source_file(&dir, "guarded.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    let (packet, session_addr) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 1).len(), 512);

    // A third party pokes the transfer socket; it is told off and the
    // transfer is not disturbed.
    let stranger = client().await;
    stranger.send_to(&ack_packet(1), session_addr).await.unwrap();
    let (packet, _) = recv(&stranger).await;
    assert_error(&packet, 5, "Unknown TID.");

    sock.send_to(&ack_packet(1), session_addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_eq!(assert_data(&packet, 2).len(), 700 - 512);

    server.stop().await;
}

#[tokio::test]
async fn test_rrq_retry_budget_then_timed_out() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content = vec![0xEEu8; 512 * 8];
    let path = source_file(&dir, "slow.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();

    // Acknowledge five blocks promptly to prime the RTT estimate. Stale
    // retransmissions of an already-acknowledged block are skipped.
    let mut session_addr = None;
    for block in 1..=5u16 {
        loop {
            let (packet, addr) = recv(&sock).await;
            if packet[2..4] != block.to_be_bytes() {
                continue;
            }
            assert_data(&packet, block);
            session_addr = Some(addr);
            sock.send_to(&ack_packet(block), addr).await.unwrap();
            break;
        }
    }
    let session_addr = session_addr.unwrap();

    // Go silent: the server must retransmit block 6 exactly five times
    // after the initial send, then give up.
    let mut block6_packets = 0;
    loop {
        let (packet, _) = recv(&sock).await;
        if packet[0..2] == 3u16.to_be_bytes() {
            if packet[2..4] == 6u16.to_be_bytes() {
                block6_packets += 1;
            }
            continue;
        }
        assert_error(&packet, 0, "Timed Out");
        break;
    }
    assert_eq!(block6_packets, 6, "expected the original send plus five retries");

    // The session is gone; further ACKs go unanswered.
    sock.send_to(&ack_packet(6), session_addr).await.unwrap();
    recv_nothing(&sock).await;

    server.stop().await;
}

#[tokio::test]
async fn test_wrq_silence_times_out() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let target = dir.path().join("stalled.bin");

    let sock = client().await;
    sock.send_to(&wrq(target.to_str().unwrap(), "octet"), server.addr)
        .await
        .unwrap();

    let (packet, _) = recv(&sock).await;
    assert_ack(&packet, 0);

    // Never send DATA 1: one deadline window later the server reports the
    // timeout. The ACK-0 deadline is 5 * avg_rtt = 1s at the initial
    // estimate.
    let mut buf = [0u8; 1024];
    let (len, _) = timeout(Duration::from_secs(3), sock.recv_from(&mut buf))
        .await
        .expect("expected a Timed Out error")
        .unwrap();
    assert_error(&buf[..len], 0, "Timed Out");

    // The request touched the destination but the abandoned upload never
    // surfaced there.
    assert_eq!(fs::read(&target).await.unwrap(), b"");

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_active_transfer() {
    let server = TestServer::start().await;
    let dir = tempdir().unwrap();
    let content = vec![0x33u8; 2048];
    let path = source_file(&dir, "draining.bin", &content).await;

    let sock = client().await;
    sock.send_to(&rrq(&path, "octet"), server.addr).await.unwrap();
    let (packet, _) = recv(&sock).await;
    assert_data(&packet, 1);

    // Stop while the transfer is mid-flight; the server must still drain
    // and return cleanly.
    server.stop().await;
}
