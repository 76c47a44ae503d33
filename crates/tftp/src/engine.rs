//! Protocol Engine
//!
//! Pure state-transition logic for the stop-and-wait exchange. Every
//! operation takes a mutable session plus a decoded packet and returns the
//! action the I/O driver should take; the engine itself never touches a
//! socket or a timer. File reads and writes do happen here, against the
//! session's staging file, so the transition functions stay synchronous and
//! directly testable.

use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::Utc;

use crate::netascii;
use crate::protocol::{
    write_data_header, Mode, Opcode, Request, TftpError, DATA_HEADER_LEN, DATA_LEN, DATA_PACKET_MAX,
};
use crate::session::{Operation, Session};
use crate::staging;

/// Driver action after an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    /// RRQ accepted: the session buffer stages DATA block 1.
    SendData,
    /// WRQ accepted: acknowledge with ACK 0.
    SendAck,
}

/// Driver action after an ACK during an RRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// The next DATA block is staged in the session buffer.
    SendData,
    /// The final block was acknowledged; linger briefly, then clean up.
    Complete,
    /// Stale or premature block number; keep waiting on the current timer.
    Ignore,
}

/// Driver action after a DATA block during a WRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAction {
    /// Block accepted: acknowledge it. `done` marks the final block, already
    /// committed to the destination.
    SendAck { done: bool },
    /// Duplicate of the last accepted block: repeat the previous ACK.
    ResendAck,
    /// Out-of-sequence block: drop it silently.
    Ignore,
}

/// Accept or reject an initial RRQ/WRQ.
///
/// On success the session's operation, mode, target, and staging file are
/// set; for a read the first DATA block is staged. The operation field is
/// never overwritten: callers route duplicate requests away before this
/// point.
pub fn handle_request(req: &Request, session: &mut Session) -> Result<RequestAction, TftpError> {
    debug_assert_eq!(session.operation, Operation::None);

    let mode = req.mode.ok_or(TftpError::IllegalOperation)?;

    // Mail mode is write-only.
    if req.opcode == Opcode::Rrq && mode == Mode::Mail {
        return Err(TftpError::IllegalOperation);
    }

    session.mode = mode;
    session.target = PathBuf::from(&req.filename);

    match req.opcode {
        Opcode::Rrq => {
            let staged = staging::stage_for_read(&session.target)?;
            session.operation = Operation::Read;
            session.tmp = staged.tmp;
            session.file = Some(staged.file);

            prepare_next_data(session)?;
            Ok(RequestAction::SendData)
        }
        Opcode::Wrq => {
            if mode == Mode::Mail {
                session.target = staging::mail_directory()
                    .join(&req.filename)
                    .join(Utc::now().format("%Y%m%d_%H%M%S").to_string());
            }

            let staged = staging::stage_for_write(&session.target).map_err(|err| {
                if mode == Mode::Mail && err == TftpError::FileNotFound {
                    TftpError::NoSuchUser
                } else {
                    err
                }
            })?;
            session.operation = Operation::Write;
            session.tmp = staged.tmp;
            session.file = Some(staged.file);

            Ok(RequestAction::SendAck)
        }
        _ => Err(TftpError::IllegalOperation),
    }
}

/// Process an ACK for the session's outstanding DATA block.
pub fn handle_ack(block: u16, session: &mut Session) -> Result<AckAction, TftpError> {
    if session.operation != Operation::Read {
        return Err(TftpError::UnknownTid);
    }

    if block != session.block {
        return Ok(AckAction::Ignore);
    }

    if session.last_data_was_full() {
        prepare_next_data(session)?;
        Ok(AckAction::SendData)
    } else {
        session.file = None;
        Ok(AckAction::Complete)
    }
}

/// Process an incoming DATA block of a write transfer.
///
/// Payload bytes are written to the staging file verbatim in every mode;
/// no inverse netascii transform is applied on the write path.
pub fn handle_data(block: u16, payload: &[u8], session: &mut Session) -> Result<DataAction, TftpError> {
    if session.operation != Operation::Write {
        return Err(TftpError::UnknownTid);
    }

    if block == session.block {
        return Ok(DataAction::ResendAck);
    }
    if block != session.block.wrapping_add(1) {
        return Ok(DataAction::Ignore);
    }

    let file = session.file.as_mut().ok_or(TftpError::AccessViolation)?;
    file.write_all(payload).map_err(|_| TftpError::DiskFull)?;
    session.block = session.block.wrapping_add(1);

    if payload.len() < DATA_LEN {
        // Final block: flush and surface the upload at its destination.
        session.file = None;
        staging::commit(&session.tmp, &session.target)?;
        session.tmp = PathBuf::new();
        return Ok(DataAction::SendAck { done: true });
    }

    Ok(DataAction::SendAck { done: false })
}

/// Stage the next DATA block in the session buffer.
///
/// Any bytes beyond the 516-byte wire message are netascii overflow from the
/// previous block; they move down to the start of the payload before more of
/// the file is read. The block sent on the wire is
/// `buffer[..min(len, 516)]`; a resulting length under 516 marks the final
/// block of the transfer.
pub fn prepare_next_data(session: &mut Session) -> Result<(), TftpError> {
    session.block = session.block.wrapping_add(1);

    let buffer = &mut session.buffer;
    buffer.reserve(DATA_PACKET_MAX + DATA_LEN);
    if buffer.len() < DATA_HEADER_LEN {
        buffer.resize(DATA_HEADER_LEN, 0);
    }

    // Carry the overflow of the previous block into this one.
    if buffer.len() > DATA_PACKET_MAX {
        let carry = buffer.len() - DATA_PACKET_MAX;
        buffer.copy_within(DATA_PACKET_MAX.., DATA_HEADER_LEN);
        buffer.truncate(DATA_HEADER_LEN + carry);
    } else {
        buffer.truncate(DATA_HEADER_LEN);
    }

    write_data_header(buffer, session.block);

    let file = session.file.as_mut().ok_or(TftpError::AccessViolation)?;
    let mut scratch = [0u8; DATA_LEN];
    while session.buffer.len() < DATA_PACKET_MAX {
        let len = file.read(&mut scratch).map_err(|_| TftpError::AccessViolation)?;
        if len == 0 {
            break;
        }
        netascii::append(&mut session.buffer, &scratch[..len], session.mode);
    }

    Ok(())
}
