//! Error hierarchy: protocol errors (sent to a client as an ERROR packet)
//! versus fatal errors (terminate the process). Mirrors the teacher's
//! `tftp::error` module shape, consolidated around `ErrorCode` since
//! option negotiation is out of scope here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::tftp::ErrorCode;

/// A protocol-level failure, reported to the offending client as an
/// ERROR packet rather than escalated to the process.
#[derive(Debug, Error)]
#[error("{code}: {detail}")]
pub struct ProtocolError {
    pub code: ErrorCode,
    pub detail: &'static str,
}

impl ProtocolError {
    pub fn new(code: ErrorCode, detail: &'static str) -> Self {
        Self { code, detail }
    }
}

/// A failure that cannot be recovered from inside the dispatch loop;
/// `main` maps this to a non-zero exit code.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] io::Error),

    #[error("socket I/O failure: {0}")]
    SocketIo(#[source] io::Error),

    #[error("root directory does not exist or is not accessible: {0}")]
    InvalidRoot(PathBuf),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
}

impl From<io::Error> for FatalError {
    fn from(e: io::Error) -> Self {
        FatalError::SocketIo(e)
    }
}
