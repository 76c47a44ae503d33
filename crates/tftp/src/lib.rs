//! Concurrent TFTP Server Library
//!
//! An RFC 1350 TFTP server: UDP datagrams on the well-known port are
//! demultiplexed into per-client transfer sessions, each driven through the
//! stop-and-wait request/data/acknowledgement exchange until it completes,
//! fails, or times out.
//!
//! # Features
//!
//! - Read requests (RRQ) and write requests (WRQ)
//! - `octet`, `netascii`, and `mail` transfer modes
//! - Dual-stack operation: one IPv6 listener serves v4-mapped and native
//!   v6 peers
//! - Per-transfer ephemeral sockets (the TFTP transfer-identifier rule)
//! - Adaptive retransmission timers driven by a clamped RTT estimate
//! - Crash-safe filesystem staging: reads serve a snapshot, writes land via
//!   an atomic rename, temporaries are reclaimed on every exit path
//!
//! # Organization
//!
//! - [`protocol`] - packet codec, opcodes, transfer modes, error taxonomy
//! - [`netascii`] - NVT-ASCII transcoding with cross-block carry
//! - [`staging`] - temporary-file discipline backing both transfer kinds
//! - [`session`] - per-transfer state and the live-transfer registry
//! - [`engine`] - pure protocol state transitions
//! - [`server`] - the listening loop, session tasks, and timer policy
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use tftp::server::{Server, ServerConfig};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (_shutdown, rx) = watch::channel(false);
//!     let mut server = Server::new(ServerConfig {
//!         bind_address: "[::]:69".to_string(),
//!     });
//!     server.run(rx).await
//! }
//! ```

pub mod engine;
pub mod netascii;
pub mod protocol;
pub mod server;
pub mod session;
pub mod staging;

pub use protocol::{Mode, Opcode, TftpError};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionTable};
