//! Netascii Transcoding
//!
//! Streaming conversion of arbitrary octet data into the NVT-ASCII form
//! sent on the wire for `netascii` read requests:
//!
//! - NUL bytes are dropped (they would collide with the CR-NUL escape).
//! - A bare LF becomes CR-LF.
//! - A bare CR becomes CR-NUL.
//! - A CR-LF pair in the source stays CR-LF: the CR first emits its CR-NUL
//!   escape, and the following LF retracts the trailing NUL.
//!
//! The transcoder appends into the session's outgoing DATA buffer, so the
//! retraction rule looks at the last byte already in the buffer. That makes
//! the conversion stateless across calls: a CR at the end of one file chunk
//! and its LF at the start of the next still collapse into a single CR-LF,
//! even across DATA block boundaries via the carry region.

use crate::protocol::{Mode, DATA_HEADER_LEN};

/// Append `chunk` to `buffer`, transcoding per `mode`.
///
/// `buffer` is an outgoing DATA message whose first [`DATA_HEADER_LEN`]
/// bytes are the packet header; the retraction rule never reaches into the
/// header. Octet and mail modes append verbatim.
pub fn append(buffer: &mut Vec<u8>, chunk: &[u8], mode: Mode) {
    if mode != Mode::Netascii {
        buffer.extend_from_slice(chunk);
        return;
    }

    for &byte in chunk {
        match byte {
            0 => continue,
            b'\n' => {
                if buffer.len() > DATA_HEADER_LEN && buffer.last() == Some(&0) {
                    buffer.pop();
                } else {
                    buffer.push(b'\r');
                }
                buffer.push(b'\n');
            }
            b'\r' => {
                buffer.push(b'\r');
                buffer.push(0);
            }
            _ => buffer.push(byte),
        }
    }
}
