//! Crate-wide error type.
//!
//! Configuration errors are fatal at startup; everything else closes the
//! offending connection without affecting the rest of the process (see
//! `peer::session`).

use std::result::Result as StdResult;
use thiserror::Error;

use crate::PieceIndex;

pub type Result<T> = StdResult<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake protocol string did not match")]
    BadHandshake,

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("frame of length {len} exceeds maximum of {max}")]
    OversizedFrame { len: u32, max: u32 },

    #[error("connection closed mid-frame")]
    ShortRead,

    #[error("piece {0} is not held locally")]
    MissingPiece(PieceIndex),

    #[error("peer requested piece {0} it has no right to")]
    BadRequest(PieceIndex),

    #[error("expected peer {expected} but got {got}")]
    UnexpectedPeer { expected: crate::PeerId, got: crate::PeerId },

    #[error("bitfield has wrong size: expected {expected} bytes, got {got}")]
    BitfieldWrongSize { expected: usize, got: usize },

    #[error("peer sent bitfield after the availability exchange")]
    BitfieldNotFirst,

    #[error("message type {id} payload too short: need at least {expected} bytes, got {got}")]
    PayloadTooShort { id: u8, expected: usize, got: usize },

    #[error("piece index {0} is out of range for this torrent")]
    InvalidPieceIndex(PieceIndex),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Common.cfg is missing required key {0}")]
    MissingKey(&'static str),

    #[error("Common.cfg contains unrecognized key {0}")]
    UnknownKey(String),

    #[error("malformed line in {file}: {line}")]
    MalformedLine { file: &'static str, line: String },

    #[error("PeerInfo.cfg does not list peer id {0}")]
    UnknownPeerId(u32),

    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: &'static str, value: String },
}
