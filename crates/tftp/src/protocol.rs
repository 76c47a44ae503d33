//! TFTP Wire Format
//!
//! This module contains the TFTP packet codec: opcode and transfer mode
//! enums, the error taxonomy surfaced on the wire, and the packet parsing
//! and building functions.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350. Every
//! packet starts with a 2-byte big-endian opcode:
//!
//! - Read Request (RRQ) - Request to read a file from the server
//! - Write Request (WRQ) - Request to write a file to the server
//! - Data packets - Transfer file content in 512-byte blocks
//! - Acknowledgment (ACK) - Confirm receipt of data blocks
//! - Error packets - Report errors during transfer
//!
//! All multi-byte integers on the wire are big-endian.

use std::fmt;

/// TFTP Protocol Opcodes
///
/// These opcodes identify the type of TFTP packet being sent or received.
/// Each opcode corresponds to a specific packet format as defined in RFC 1350.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Client requests to read a file from the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    Rrq = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Client requests to write a file to the server.
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 |
    Wrq = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Contains a block of file data. Each data packet carries a 2-byte
    /// block number and up to 512 bytes of payload. A payload shorter than
    /// 512 bytes marks the end of the transfer.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges receipt of a data packet. Contains the block number of
    /// the data packet being acknowledged. ACK 0 acknowledges a WRQ.
    ///
    /// Packet format: | Opcode | Block# |
    Ack = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,
}

impl Opcode {
    /// Convert a u16 value to an Opcode
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 representation
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
        }
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP Transfer Modes
///
/// Transfer modes define how data is processed during transmission. The
/// mode string in a request is matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Text mode (netascii)
    ///
    /// Data is converted to NVT-ASCII on read: line endings become CR-LF
    /// and a bare CR is escaped as CR-NUL.
    Netascii,

    /// Binary mode (octet)
    ///
    /// Data is transferred as-is without any conversion.
    Octet,

    /// Mail mode (mail)
    ///
    /// The filename names a user instead of a file; the upload lands in the
    /// user's mail directory. Only valid for write requests.
    Mail,
}

impl Mode {
    /// Parse a transfer mode from a request string, case-insensitively.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Self::Netascii),
            "octet" => Some(Self::Octet),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }

    /// Get the string representation of the transfer mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
            Self::Mail => "mail",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// TFTP error conditions surfaced on the wire.
///
/// Each variant maps to an RFC 1350 error code and a canonical message.
/// `TimedOut` and `NotImplemented` are aliases of error code 0 with
/// distinguishing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpError {
    /// Error code 0 with message "Not implemented."
    NotImplemented,
    /// Error code 0 with message "Timed Out"; the retransmission budget ran out.
    TimedOut,
    /// Error code 1: the requested file does not exist.
    FileNotFound,
    /// Error code 2: permission failure, rename failure, or unexpected I/O.
    AccessViolation,
    /// Error code 3: a write to the staging file failed.
    DiskFull,
    /// Error code 4: malformed or wrong-state packet.
    IllegalOperation,
    /// Error code 5: datagram arrived on a socket not matching its session.
    UnknownTid,
    /// Error code 6.
    FileAlreadyExists,
    /// Error code 7: mail destination directory does not exist.
    NoSuchUser,
}

impl TftpError {
    /// The RFC 1350 error code for this condition.
    pub fn code(self) -> u16 {
        match self {
            Self::NotImplemented | Self::TimedOut => 0,
            Self::FileNotFound => 1,
            Self::AccessViolation => 2,
            Self::DiskFull => 3,
            Self::IllegalOperation => 4,
            Self::UnknownTid => 5,
            Self::FileAlreadyExists => 6,
            Self::NoSuchUser => 7,
        }
    }

    /// The canonical error message, sent byte-exact on the wire.
    pub fn message(self) -> &'static str {
        match self {
            Self::NotImplemented => "Not implemented.",
            Self::TimedOut => "Timed Out",
            Self::FileNotFound => "File not found.",
            Self::AccessViolation => "Access violation.",
            Self::DiskFull => "No space available.",
            Self::IllegalOperation => "Illegal operation.",
            Self::UnknownTid => "Unknown TID.",
            Self::FileAlreadyExists => "File already exists.",
            Self::NoSuchUser => "No such user.",
        }
    }

    /// Build the ERROR packet announcing this condition.
    pub fn to_packet(self) -> Vec<u8> {
        build_error(self.code(), self.message())
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl std::error::Error for TftpError {}

/// The maximum data payload size in bytes (512 bytes per RFC 1350).
pub const DATA_LEN: usize = 512;

/// The DATA/ACK header size: opcode plus block number.
pub const DATA_HEADER_LEN: usize = 4;

/// The maximum total size of a DATA message (header + payload).
pub const DATA_PACKET_MAX: usize = DATA_HEADER_LEN + DATA_LEN;

/// A decoded RRQ or WRQ.
///
/// An unrecognized transfer mode decodes to `mode: None`; the engine rejects
/// such requests with an illegal-operation error.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// The request opcode (RRQ or WRQ).
    pub opcode: Opcode,
    /// Requested filename (the user name in mail mode).
    pub filename: String,
    /// Transfer mode, if recognized.
    pub mode: Option<Mode>,
}

/// Find the next null byte in a buffer starting from a given position
fn find_zero(buf: &[u8], start: usize) -> Option<usize> {
    buf[start..].iter().position(|&b| b == 0).map(|pos| start + pos)
}

/// Read the opcode off the front of a packet.
pub fn parse_opcode(buf: &[u8]) -> Result<u16, TftpError> {
    if buf.len() < 2 {
        return Err(TftpError::IllegalOperation);
    }

    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// Parse a TFTP request (RRQ/WRQ) packet.
///
/// Scans the two zero-terminated strings after the opcode. A missing
/// terminator or an empty filename makes the request unparseable; an
/// unrecognized mode string is reported as `mode: None`.
pub fn parse_request(buf: &[u8]) -> Result<Request, TftpError> {
    let opcode = match Opcode::from_u16(parse_opcode(buf)?) {
        Some(opc @ (Opcode::Rrq | Opcode::Wrq)) => opc,
        _ => return Err(TftpError::IllegalOperation),
    };

    let mut i = 2;

    // Parse filename
    let fname_end = find_zero(buf, i).ok_or(TftpError::IllegalOperation)?;
    let filename = std::str::from_utf8(&buf[i..fname_end])
        .map_err(|_| TftpError::IllegalOperation)?
        .to_string();
    if filename.is_empty() {
        return Err(TftpError::IllegalOperation);
    }
    i = fname_end + 1;

    // Parse mode
    let mode_end = find_zero(buf, i).ok_or(TftpError::IllegalOperation)?;
    let mode = std::str::from_utf8(&buf[i..mode_end]).map_err(|_| TftpError::IllegalOperation)?;

    Ok(Request {
        opcode,
        filename,
        mode: Mode::from_str_opt(mode),
    })
}

/// Parse a TFTP DATA packet into its block number and payload.
pub fn parse_data(buf: &[u8]) -> Result<(u16, &[u8]), TftpError> {
    if buf.len() < DATA_HEADER_LEN {
        return Err(TftpError::IllegalOperation);
    }

    let block = u16::from_be_bytes([buf[2], buf[3]]);
    Ok((block, &buf[DATA_HEADER_LEN..]))
}

/// Parse a TFTP ACK packet into its block number.
pub fn parse_ack(buf: &[u8]) -> Result<u16, TftpError> {
    if buf.len() < DATA_HEADER_LEN {
        return Err(TftpError::IllegalOperation);
    }

    Ok(u16::from_be_bytes([buf[2], buf[3]]))
}

/// Write a DATA header (opcode and block number) into the first four bytes.
pub fn write_data_header(buf: &mut [u8], block: u16) {
    buf[0..2].copy_from_slice(&Opcode::Data.as_u16().to_be_bytes());
    buf[2..4].copy_from_slice(&block.to_be_bytes());
}

/// Build a TFTP ACK packet
pub fn build_ack(block: u16) -> Vec<u8> {
    let mut v = Vec::with_capacity(DATA_HEADER_LEN);
    v.extend_from_slice(&Opcode::Ack.as_u16().to_be_bytes());
    v.extend_from_slice(&block.to_be_bytes());
    v
}

/// Build a TFTP Error packet
pub fn build_error(code: u16, msg: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(DATA_HEADER_LEN + msg.len() + 1);
    v.extend_from_slice(&Opcode::Error.as_u16().to_be_bytes());
    v.extend_from_slice(&code.to_be_bytes());
    v.extend_from_slice(msg.as_bytes());
    v.push(0);
    v
}
