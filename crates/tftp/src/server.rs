//! TFTP Server
//!
//! The listening loop, the per-transfer I/O driver, and the timer policy.
//!
//! Every datagram that reaches the listening port opens a fresh session: the
//! server binds an ephemeral socket of the peer's address family (the RFC
//! 1350 transfer-identifier discipline) and spawns a task that owns the
//! session for its whole life. The kernel then demultiplexes follow-up
//! packets by local port; the task only has to verify the remote address and
//! answer strangers with an Unknown TID error.
//!
//! Timer policy, all derived from the adaptive RTT estimate:
//! - a DATA block is retransmitted after `2 * avg_rtt`, up to
//!   [`MAX_RETRIES`] times, then the transfer dies with "Timed Out";
//! - a write transfer waits `5 * avg_rtt` for the peer's next DATA after
//!   each ACK (including ACK 0, which is never retransmitted);
//! - a finished transfer lingers one `5 * avg_rtt` window to absorb
//!   duplicates before its socket disappears.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::engine::{self, AckAction, DataAction, RequestAction};
use crate::protocol::{self, Opcode, TftpError, DATA_PACKET_MAX};
use crate::session::{normalize_peer, Session, SessionGuard, SessionTable, MAX_RETRIES};

/// Receive buffer size: one byte beyond the largest legal message, so an
/// oversized DATA packet is detected instead of silently truncated.
const RECV_BUFLEN: usize = DATA_PACKET_MAX + 1;

/// TFTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the listening socket. An IPv6 address is bound dual-stack
    /// so v4-mapped peers are served from the same socket.
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "[::]:69".to_string(),
        }
    }
}

/// The TFTP server.
pub struct Server {
    config: ServerConfig,
    socket: Option<Arc<UdpSocket>>,
    table: SessionTable,
}

impl Server {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            socket: None,
            table: SessionTable::new(),
        }
    }

    /// Create a new server with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The registry of live transfers.
    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    /// The address the listening socket is bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the listening socket and return its address.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let addr: SocketAddr = self
            .config
            .bind_address
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.config.bind_address))?;

        let socket = match addr {
            SocketAddr::V6(_) => dual_stack_socket(addr).context("Failed to bind TFTP server socket")?,
            SocketAddr::V4(_) => UdpSocket::bind(addr)
                .await
                .context("Failed to bind TFTP server socket")?,
        };

        let local_addr = socket.local_addr().context("Failed to get local address")?;
        self.socket = Some(Arc::new(socket));
        Ok(local_addr)
    }

    /// Run the server until the shutdown signal flips.
    ///
    /// New sessions stop being accepted the moment the signal arrives;
    /// in-flight transfers are drained before this returns.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.socket.is_none() {
            let local_addr = self.bind().await?;
            info!("TFTP server listening on {}.", local_addr);
        }
        self.serve(shutdown).await
    }

    async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let socket = Arc::clone(self.socket.as_ref().expect("server must be bound before serving"));

        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut buf = [0u8; RECV_BUFLEN];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.accept(&buf[..len], src, &mut sessions, &shutdown).await,
                        Err(err) => warn!("Receive error on listening socket: {}", err),
                    }
                    // Reap finished transfer tasks as we go.
                    while sessions.try_join_next().is_some() {}
                }
                _ = shutdown.changed() => break,
            }
        }

        let active = self.table.active();
        if active > 0 {
            info!("Draining {} active transfer(s).", active);
        }
        while sessions.join_next().await.is_some() {}

        Ok(())
    }

    /// Open a session for a datagram that arrived on the listening socket.
    async fn accept(
        &self,
        datagram: &[u8],
        src: SocketAddr,
        sessions: &mut JoinSet<()>,
        shutdown: &watch::Receiver<bool>,
    ) {
        let peer = normalize_peer(src);

        let socket = match ephemeral_socket(peer).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!("Unable to bind a transfer socket for {}: {}", peer, err);
                return;
            }
        };

        let port = socket.local_addr().map(|addr| addr.port()).unwrap_or(0);
        let guard = self.table.register(peer, port);
        debug!("Session for {} on local port {}.", peer, port);

        let datagram = datagram.to_vec();
        let shutdown = shutdown.clone();
        sessions.spawn(session_task(socket, peer, datagram, guard, shutdown));
    }
}

/// Bind an IPv6 UDP socket that also accepts v4-mapped traffic.
fn dual_stack_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Bind an ephemeral transfer socket of the peer's address family.
async fn ephemeral_socket(peer: SocketAddr) -> io::Result<UdpSocket> {
    let bind: SocketAddr = match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    UdpSocket::bind(bind).await
}

/// What a transfer task observed while waiting for the peer.
enum Event {
    Packet { len: usize, src: SocketAddr },
    Timeout,
    Shutdown,
}

/// Wait for a datagram, the timer deadline, or server shutdown, whichever
/// comes first.
async fn recv_event(
    socket: &UdpSocket,
    buf: &mut [u8],
    deadline: Instant,
    shutdown: &mut watch::Receiver<bool>,
) -> Event {
    tokio::select! {
        _ = shutdown.changed() => Event::Shutdown,
        received = timeout_at(deadline, socket.recv_from(buf)) => match received {
            Err(_) => Event::Timeout,
            Ok(Ok((len, src))) => Event::Packet { len, src },
            Ok(Err(err)) => {
                debug!("Receive error on transfer socket: {}", err);
                Event::Timeout
            }
        },
    }
}

/// Send a datagram, fire-and-forget. The timers are the recovery mechanism
/// for anything that goes missing.
async fn send_packet(socket: &UdpSocket, dest: SocketAddr, packet: &[u8]) {
    if let Err(err) = socket.send_to(packet, dest).await {
        debug!("Send to {} failed: {}", dest, err);
    }
}

/// Drive one transfer from its opening datagram to termination.
async fn session_task(
    socket: UdpSocket,
    peer: SocketAddr,
    first: Vec<u8>,
    guard: SessionGuard,
    mut shutdown: watch::Receiver<bool>,
) {
    // Held for the task's lifetime; dropping it deregisters the session.
    let _guard = guard;
    let mut session = Session::new(peer);

    let action = match initial_action(&first, &mut session) {
        Ok(action) => action,
        Err(err) => {
            debug!("Rejecting request from {}: {}", peer, err);
            send_packet(&socket, peer, &err.to_packet()).await;
            return;
        }
    };

    match action {
        RequestAction::SendData => {
            info!("New RRQ from {}.", peer);
            read_loop(&socket, &mut session, &mut shutdown).await;
        }
        RequestAction::SendAck => {
            info!("New WRQ from {}.", peer);
            write_loop(&socket, &mut session, &mut shutdown).await;
        }
    }
    // Dropping the session deletes any staging file; dropping the socket
    // releases the transfer identifier.
}

/// Route the datagram that opened the session.
fn initial_action(datagram: &[u8], session: &mut Session) -> Result<RequestAction, TftpError> {
    match Opcode::from_u16(protocol::parse_opcode(datagram)?) {
        Some(Opcode::Rrq | Opcode::Wrq) => {
            let request = protocol::parse_request(datagram)?;
            engine::handle_request(&request, session)
        }
        // DATA and ACK on the listening socket belong to no transfer.
        Some(Opcode::Data | Opcode::Ack) => Err(TftpError::UnknownTid),
        _ => Err(TftpError::IllegalOperation),
    }
}

/// Serve an accepted RRQ: send each DATA block, retransmit on silence,
/// advance on matching ACKs.
async fn read_loop(socket: &UdpSocket, session: &mut Session, shutdown: &mut watch::Receiver<bool>) {
    let mut buf = [0u8; RECV_BUFLEN];

    'transfer: loop {
        // Send the current DATA block and arm the retransmission timer.
        send_packet(socket, session.peer, session.data_packet()).await;
        session.stats.mark_send();
        let mut deadline = Instant::now() + session.stats.retransmit_after();

        loop {
            match recv_event(socket, &mut buf, deadline, shutdown).await {
                Event::Shutdown => return,
                Event::Timeout => {
                    session.retries += 1;
                    if session.retries > MAX_RETRIES {
                        debug!("RRQ to {} timed out on block {}.", session.peer, session.block);
                        send_packet(socket, session.peer, &TftpError::TimedOut.to_packet()).await;
                        return;
                    }
                    send_packet(socket, session.peer, session.data_packet()).await;
                    deadline = Instant::now() + session.stats.retransmit_after();
                }
                Event::Packet { len, src } => {
                    if normalize_peer(src) != session.peer {
                        send_packet(socket, src, &TftpError::UnknownTid.to_packet()).await;
                        continue;
                    }
                    match dispatch_read(&buf[..len], session) {
                        Ok(AckAction::SendData) => {
                            session.stats.observe();
                            session.retries = 0;
                            continue 'transfer;
                        }
                        Ok(AckAction::Complete) => {
                            session.stats.observe();
                            info!("RRQ for {} served to {}.", session.target.display(), session.peer);
                            absorb_stragglers(socket, session, shutdown).await;
                            return;
                        }
                        Ok(AckAction::Ignore) => continue,
                        Err(err) => {
                            send_packet(socket, session.peer, &err.to_packet()).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Route a datagram received mid-read.
fn dispatch_read(datagram: &[u8], session: &mut Session) -> Result<AckAction, TftpError> {
    match Opcode::from_u16(protocol::parse_opcode(datagram)?) {
        Some(Opcode::Ack) => engine::handle_ack(protocol::parse_ack(datagram)?, session),
        Some(Opcode::Rrq | Opcode::Wrq) => {
            // Duplicate of the request that opened this session.
            debug!("Duplicate request from {}.", session.peer);
            Ok(AckAction::Ignore)
        }
        Some(Opcode::Data) => Err(TftpError::UnknownTid),
        _ => Err(TftpError::IllegalOperation),
    }
}

/// Receive an accepted WRQ: acknowledge each block, give the peer one
/// deadline window per block, commit on the short final block.
async fn write_loop(socket: &UdpSocket, session: &mut Session, shutdown: &mut watch::Receiver<bool>) {
    let mut buf = [0u8; RECV_BUFLEN];
    let mut committed = false;

    'window: loop {
        // Acknowledge the last accepted block (ACK 0 for a fresh session)
        // and arm the data deadline. ACKs are never retransmitted on a
        // timer, only in response to duplicate DATA.
        send_packet(socket, session.peer, &protocol::build_ack(session.block)).await;
        session.stats.mark_send();
        let deadline = Instant::now() + session.stats.deadline_after();

        loop {
            match recv_event(socket, &mut buf, deadline, shutdown).await {
                Event::Shutdown => return,
                Event::Timeout => {
                    if committed {
                        // Transfer finished; the linger window just expired.
                        return;
                    }
                    debug!("WRQ from {} timed out on block {}.", session.peer, session.block);
                    send_packet(socket, session.peer, &TftpError::TimedOut.to_packet()).await;
                    return;
                }
                Event::Packet { len, src } => {
                    if normalize_peer(src) != session.peer {
                        send_packet(socket, src, &TftpError::UnknownTid.to_packet()).await;
                        continue;
                    }
                    match dispatch_write(&buf[..len], session) {
                        Ok(DataAction::SendAck { done }) => {
                            session.stats.observe();
                            if done && !committed {
                                committed = true;
                                info!(
                                    "WRQ for {} committed from {}.",
                                    session.target.display(),
                                    session.peer
                                );
                            }
                            continue 'window;
                        }
                        Ok(DataAction::ResendAck) => continue 'window,
                        Ok(DataAction::Ignore) => continue,
                        Err(err) => {
                            send_packet(socket, session.peer, &err.to_packet()).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Route a datagram received mid-write.
fn dispatch_write(datagram: &[u8], session: &mut Session) -> Result<DataAction, TftpError> {
    match Opcode::from_u16(protocol::parse_opcode(datagram)?) {
        Some(Opcode::Data) => {
            if datagram.len() > DATA_PACKET_MAX {
                // A payload beyond 512 bytes cannot belong to this protocol.
                return Err(TftpError::IllegalOperation);
            }
            let (block, payload) = protocol::parse_data(datagram)?;
            engine::handle_data(block, payload, session)
        }
        Some(Opcode::Rrq | Opcode::Wrq) => {
            debug!("Duplicate request from {}.", session.peer);
            Ok(DataAction::Ignore)
        }
        Some(Opcode::Ack) => Err(TftpError::UnknownTid),
        _ => Err(TftpError::IllegalOperation),
    }
}

/// Keep a finished read session's socket alive briefly so re-sent final
/// ACKs die here instead of provoking Unknown TID errors from a reused
/// port.
async fn absorb_stragglers(socket: &UdpSocket, session: &mut Session, shutdown: &mut watch::Receiver<bool>) {
    let mut buf = [0u8; RECV_BUFLEN];
    let deadline = Instant::now() + session.stats.deadline_after();

    loop {
        match recv_event(socket, &mut buf, deadline, shutdown).await {
            Event::Shutdown | Event::Timeout => return,
            Event::Packet { src, .. } => {
                if normalize_peer(src) != session.peer {
                    send_packet(socket, src, &TftpError::UnknownTid.to_packet()).await;
                }
                // Duplicates from the peer need no reply after completion.
            }
        }
    }
}
