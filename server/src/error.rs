//! Error taxonomy for sessions and world state.
//!
//! Everything a single connection can do wrong ends up as a [`SessionError`],
//! which the tick turns into a disconnect for that connection only.

use shared::protocol::status;
use shared::{CodecError, FrameError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("expected handshake opcode 14, got {0}")]
    BadHandshake(u8),
    #[error("name hash {0} out of range")]
    BadNameHash(u8),
    #[error("unexpected login opcode {0}")]
    BadLoginOpcode(u8),
    #[error("login magic {0} is not 255")]
    BadMagic(u8),
    #[error("client revision {0} does not match")]
    RevisionMismatch(u16),
    #[error("login block magic {0} is not 10")]
    BadBlockMagic(u8),
    #[error("login size {declared} is too small for its {block} byte block")]
    BlockLength { declared: usize, block: usize },
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
    #[error("{0} is already logged in")]
    AlreadyOnline(String),
    #[error("walk request of {0} steps is too long")]
    PathTooLong(usize),
    #[error("inbound buffer overflow ({0} bytes pending)")]
    InboundOverflow(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed payload: {0}")]
    Codec(#[from] CodecError),
}

impl ProtocolError {
    /// Status byte written to the peer before the connection is closed.
    ///
    /// Only failures during the handshake and login have one; once the
    /// session is established the connection is simply dropped.
    pub fn status_code(&self) -> Option<u8> {
        match self {
            ProtocolError::BadHandshake(_)
            | ProtocolError::BadNameHash(_)
            | ProtocolError::BadLoginOpcode(_)
            | ProtocolError::BadMagic(_)
            | ProtocolError::BadBlockMagic(_)
            | ProtocolError::BlockLength { .. } => Some(status::REJECTED),
            ProtocolError::RevisionMismatch(_) => Some(status::GAME_UPDATED),
            ProtocolError::InvalidUsername(_) => Some(status::INVALID_CREDENTIALS),
            ProtocolError::AlreadyOnline(_) => Some(status::ALREADY_ONLINE),
            _ => None,
        }
    }
}

/// Internal state that should be impossible. Logged as an error and
/// confined to the entity that triggered it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("no chunk loaded at ({x}, {y})")]
    MissingChunk { x: i32, y: i32 },
    #[error("entity slot {0} is vacant")]
    VacantSlot(usize),
    #[error("slot {0} has no session")]
    MissingSession(usize),
    #[error("session has no ciphers before login")]
    NotLoggedIn,
    #[error("movement of {0} uncommitted ticks is still queued")]
    MovementBacklog(usize),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("internal fault: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("logged out")]
    Logout,
    #[error("connection closed by peer")]
    Closed,
}

impl SessionError {
    /// Status byte owed to the peer, if the failure happened while it still
    /// expects one.
    pub fn status_code(&self) -> Option<u8> {
        match self {
            SessionError::Protocol(err) => err.status_code(),
            _ => None,
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        SessionError::Protocol(err.into())
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        SessionError::Protocol(err.into())
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("all {0} slots are in use")]
pub struct CapacityError(pub usize);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error(transparent)]
    Full(#[from] CapacityError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// A region or music table file that does not follow the record format.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read table: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated table: {0}")]
    Truncated(#[from] CodecError),
    #[error("unknown record opcode {opcode} at offset {offset}")]
    UnknownRecord { opcode: u8, offset: usize },
    #[error("chunk byte {0:#x} is out of range")]
    BadChunk(u8),
}
