//! Parsing of inbound datagrams and serialization of outbound DATA/ERROR packets.
//!
//! Parsing is total and infallible: any datagram that doesn't look like a
//! well-formed RRQ/ACK/ERROR becomes [`Packet::Unknown`] rather than an error,
//! matching the source server's "never fail, just classify" codec.

use super::consts;
use super::ErrorCode;

/// A classified inbound datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Packet<'a> {
    Read { filename: &'a str, mode_text: &'a str },
    Ack { block: u16 },
    Error,
    Unknown,
}

impl<'a> Packet<'a> {
    /// Classify a received datagram. Never panics, never errors.
    pub fn parse(buf: &'a [u8]) -> Self {
        if buf.len() < 2 {
            return Packet::Unknown;
        }
        // A non-zero high byte means the opcode is >= 256, which is never
        // valid for TFTP; treat it the same as any other unrecognized opcode.
        if buf[0] != 0 {
            return Packet::Unknown;
        }

        match u16::from_be_bytes([buf[0], buf[1]]) {
            consts::OPCODE_RRQ => Self::parse_rrq(&buf[2..]),
            consts::OPCODE_ACK => Self::parse_ack(&buf[2..]),
            consts::OPCODE_ERROR => Packet::Error,
            _ => Packet::Unknown,
        }
    }

    fn parse_rrq(rest: &'a [u8]) -> Self {
        let Some(filename_end) = rest.iter().position(|&b| b == 0) else {
            return Packet::Unknown;
        };
        let mode_start = filename_end + 1;
        let Some(mode_len) = rest[mode_start..].iter().position(|&b| b == 0) else {
            return Packet::Unknown;
        };

        let (Ok(filename), Ok(mode_text)) = (
            std::str::from_utf8(&rest[..filename_end]),
            std::str::from_utf8(&rest[mode_start..mode_start + mode_len]),
        ) else {
            return Packet::Unknown;
        };

        Packet::Read { filename, mode_text }
    }

    fn parse_ack(rest: &'a [u8]) -> Self {
        if rest.len() < 2 {
            return Packet::Unknown;
        }
        Packet::Ack { block: u16::from_be_bytes([rest[0], rest[1]]) }
    }
}

/// Write a DATA packet (opcode, block number, payload) into `buf`, returning
/// the filled prefix. `buf` must be at least `4 + data.len()` bytes.
pub fn encode_data<'b>(buf: &'b mut [u8; consts::MAX_DATA_PACKET], block: u16, data: &[u8]) -> &'b [u8] {
    buf[0..2].copy_from_slice(&consts::OPCODE_DATA.to_be_bytes());
    buf[2..4].copy_from_slice(&block.to_be_bytes());
    buf[4..4 + data.len()].copy_from_slice(data);
    &buf[..4 + data.len()]
}

/// Write an ERROR packet (opcode, code, NUL-terminated message) into `buf`.
/// The fixed messages (see [`ErrorCode::message`]) never exceed the buffer.
pub fn encode_error<'b>(buf: &'b mut [u8], code: ErrorCode) -> &'b [u8] {
    let msg = code.message().as_bytes();
    let len = 4 + msg.len() + 1;
    assert!(buf.len() >= len, "error packet buffer too small");

    buf[0..2].copy_from_slice(&consts::OPCODE_ERROR.to_be_bytes());
    buf[2..4].copy_from_slice(&(code as u16).to_be_bytes());
    buf[4..4 + msg.len()].copy_from_slice(msg);
    buf[4 + msg.len()] = 0;

    &buf[..len]
}
