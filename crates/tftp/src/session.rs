//! Transfer Sessions
//!
//! Per-transfer state and the process-wide registry of live transfers.
//!
//! A session is created the moment a datagram arrives on the listening
//! socket and lives until the transfer completes, fails, or times out. The
//! record keeps the stop-and-wait position (last block sent or accepted),
//! the staged file, the outgoing message buffer, and the adaptive RTT
//! estimate that paces retransmissions.

use std::collections::HashMap;
use std::fs::File;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::{Mode, DATA_PACKET_MAX};
use crate::staging;

/// Lower clamp of the RTT estimate.
pub const TIMEOUT_MIN: Duration = Duration::from_millis(2);

/// Upper clamp of the RTT estimate.
pub const TIMEOUT_MAX: Duration = Duration::from_millis(200);

/// Retransmissions of a DATA block before the transfer is declared dead.
pub const MAX_RETRIES: u32 = 5;

/// The transfer a session is performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// No request accepted yet.
    None,
    /// Serving an RRQ.
    Read,
    /// Receiving a WRQ.
    Write,
}

/// Exponentially weighted round-trip estimate, clamped to
/// [`TIMEOUT_MIN`, `TIMEOUT_MAX`].
#[derive(Debug, Clone, Copy)]
pub struct RttStats {
    /// When the packet currently awaiting a response was sent.
    pub start_time: Instant,
    /// The aggregate average round trip time.
    pub avg_rtt: Duration,
}

impl RttStats {
    /// A fresh estimator: pessimistic average, half an interval elapsed.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now() - TIMEOUT_MAX / 2,
            avg_rtt: TIMEOUT_MAX,
        }
    }

    /// Mark the start of a new round trip.
    pub fn mark_send(&mut self) {
        self.start_time = Instant::now();
    }

    /// Fold the elapsed round trip into the average.
    pub fn observe(&mut self) {
        let sample = self.start_time.elapsed();
        self.avg_rtt = (self.avg_rtt * 3 / 4 + sample / 4).clamp(TIMEOUT_MIN, TIMEOUT_MAX);
    }

    /// How long to wait for an ACK before retransmitting.
    pub fn retransmit_after(&self) -> Duration {
        2 * self.avg_rtt
    }

    /// How long to wait for the peer's next DATA, or to linger after
    /// completion.
    pub fn deadline_after(&self) -> Duration {
        5 * self.avg_rtt
    }
}

impl Default for RttStats {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one transfer.
#[derive(Debug)]
pub struct Session {
    /// Remote address, normalized (v4-mapped v6 becomes plain v4).
    pub peer: SocketAddr,
    /// The accepted operation; immutable once set.
    pub operation: Operation,
    /// Transfer mode of the accepted request.
    pub mode: Mode,
    /// Requested path (RRQ) or final destination (WRQ).
    pub target: PathBuf,
    /// Path of the staging file; empty when none exists.
    pub tmp: PathBuf,
    /// Open handle on the staging file.
    pub file: Option<File>,
    /// Last block sent (RRQ) or last block accepted (WRQ); wraps mod 2^16.
    pub block: u16,
    /// Outgoing message: the next DATA packet plus any netascii carry.
    pub buffer: Vec<u8>,
    /// Round-trip statistics pacing the timers.
    pub stats: RttStats,
    /// Consecutive retransmissions of the current DATA block.
    pub retries: u32,
}

impl Session {
    /// A fresh session for `peer` with no operation accepted.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            operation: Operation::None,
            mode: Mode::Octet,
            target: PathBuf::new(),
            tmp: PathBuf::new(),
            file: None,
            block: 0,
            buffer: Vec::new(),
            stats: RttStats::new(),
            retries: 0,
        }
    }

    /// Whether the most recently prepared DATA carried a full 512-byte
    /// payload. A short payload means the block just sent ends the transfer.
    pub fn last_data_was_full(&self) -> bool {
        self.buffer.len() >= DATA_PACKET_MAX
    }

    /// The wire view of the staged DATA message: header plus at most one
    /// payload's worth of bytes. Anything beyond is carry for the next block.
    pub fn data_packet(&self) -> &[u8] {
        &self.buffer[..self.buffer.len().min(DATA_PACKET_MAX)]
    }
}

impl Drop for Session {
    // Every exit path deletes the staging file, panics included. A committed
    // upload has already cleared `tmp`.
    fn drop(&mut self) {
        self.file = None;
        staging::discard(&self.tmp);
    }
}

/// Collapse a v4-mapped IPv6 peer to its IPv4 form so a dual-stack listener
/// keys v4 and v6 clients uniformly.
pub fn normalize_peer(addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(v6) = addr {
        if let Some(v4) = v6.ip().to_ipv4_mapped() {
            return SocketAddr::new(IpAddr::V4(v4), v6.port());
        }
    }
    addr
}

/// Registry of live transfers, keyed by normalized peer address.
///
/// Each entry lists the local ports of the ephemeral sockets serving that
/// peer, so several concurrent transfers from one client coexist. Entries
/// deregister themselves when their [`SessionGuard`] drops.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<SocketAddr, Vec<u16>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transfer for `peer` served from local `port`.
    pub fn register(&self, peer: SocketAddr, port: u16) -> SessionGuard {
        let mut inner = self.inner.lock().expect("session table poisoned");
        inner.entry(peer).or_default().push(port);
        SessionGuard {
            table: self.clone(),
            peer,
            port,
        }
    }

    /// Number of live transfers across all peers.
    pub fn active(&self) -> usize {
        let inner = self.inner.lock().expect("session table poisoned");
        inner.values().map(Vec::len).sum()
    }

    /// Number of live transfers for one peer.
    pub fn active_for(&self, peer: SocketAddr) -> usize {
        let inner = self.inner.lock().expect("session table poisoned");
        inner.get(&peer).map_or(0, Vec::len)
    }

    fn deregister(&self, peer: SocketAddr, port: u16) {
        let mut inner = self.inner.lock().expect("session table poisoned");
        if let Some(ports) = inner.get_mut(&peer) {
            if let Some(pos) = ports.iter().position(|&p| p == port) {
                ports.swap_remove(pos);
            }
            if ports.is_empty() {
                inner.remove(&peer);
            }
        }
    }
}

/// Table membership for one session; deregisters on drop.
#[derive(Debug)]
pub struct SessionGuard {
    table: SessionTable,
    peer: SocketAddr,
    port: u16,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.deregister(self.peer, self.port);
    }
}
