//! Protocol constants, the incoming size table and frame codecs.

use crate::buffer::Buffer;
use crate::isaac::IsaacCipher;
use thiserror::Error;

pub const REVISION: u16 = 317;
pub const BASE_PORT: u16 = 43594;

pub const HANDSHAKE_OPCODE: u8 = 14;
pub const LOGIN_NEW: u8 = 16;
pub const LOGIN_RECONNECT: u8 = 18;
pub const LOGIN_MAGIC: u8 = 255;
pub const BLOCK_MAGIC: u8 = 10;
pub const MAX_NAME_HASH: u8 = 31;
pub const CRC_COUNT: usize = 9;
pub const MAX_USERNAME_LEN: usize = 12;

/// Length of the handshake reply before the session key.
pub const HANDSHAKE_REPLY_LEN: usize = 9;

/// Single-byte status codes written during the handshake and login.
pub mod status {
    pub const CONTINUE: u8 = 0;
    pub const LOGIN_OK: u8 = 2;
    pub const INVALID_CREDENTIALS: u8 = 3;
    pub const ALREADY_ONLINE: u8 = 5;
    pub const GAME_UPDATED: u8 = 6;
    pub const SERVER_FULL: u8 = 7;
    pub const REJECTED: u8 = 10;
}

/// Opcodes the client sends once the session is established.
pub mod incoming {
    pub const PING: u8 = 0;
    pub const CHAT: u8 = 4;
    pub const WALK_MINIMAP: u8 = 248;
    pub const WALK: u8 = 164;
    pub const WALK_ACTION: u8 = 98;
    pub const COMMAND: u8 = 103;
    pub const LOGOUT: u8 = 202;
}

/// Opcodes the server sends once the session is established.
pub mod outgoing {
    pub const SET_CHUNK: u8 = 73;
    pub const PLAY_MUSIC: u8 = 74;
    pub const PLAYER_UPDATE: u8 = 81;
    pub const MESSAGE: u8 = 253;
}

/// Bytes of minimap data trailing a minimap walk request.
pub const MINIMAP_TRAILER: usize = 14;

/// Index written after the last added player. Never a real slot.
pub const ADD_TERMINATOR: u32 = 2047;

/// Number of player slots that can be addressed next to the terminator.
pub const MAX_PLAYERS: usize = 2047;

/// Entities a single observer can have in view.
pub const MAX_ACTIVE: usize = 255;

/// Bytes a session may have buffered but not yet decoded.
pub const INBOUND_CAPACITY: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketSize {
    Fixed(usize),
    VarByte,
    VarShort,
}

impl PacketSize {
    /// Longest body the length field can describe.
    pub fn max_len(self) -> usize {
        match self {
            PacketSize::Fixed(len) => len,
            PacketSize::VarByte => u8::MAX as usize,
            PacketSize::VarShort => u16::MAX as usize,
        }
    }
}

const INCOMING_SIZES: [i8; 255] = [
    0, -3, -3, 1, -1, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, 8, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, 4, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -1, 0, -3, //
    -3, -3, -3, -3, -3, -3, 4, 6, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -1, -3, //
    -3, -3, -3, -1, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, 0, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, 6, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -1, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, 4, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, -3, 0, -3, -3, -3, -3, -3, -3, -3, //
    4, -3, 0, -3, 7, -3, -3, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -1, -3, -3, -3, //
    -3, -3, -3, -3, -3, -3, -3, -3, -3, -3, //
    -3, 4, -3, -3, -3, -3, -3, -3, -1, -3, //
    -3, -3, 6, -3, -3,
];

/// Size class of an incoming opcode, or `None` when the opcode is invalid.
pub fn incoming_size(opcode: u8) -> Option<PacketSize> {
    match INCOMING_SIZES.get(opcode as usize).copied()? {
        size if size >= 0 => Some(PacketSize::Fixed(size as usize)),
        -1 => Some(PacketSize::VarByte),
        -2 => Some(PacketSize::VarShort),
        _ => None,
    }
}

/// Size class of the packets this server sends.
pub fn outgoing_size(opcode: u8) -> Option<PacketSize> {
    match opcode {
        outgoing::SET_CHUNK => Some(PacketSize::Fixed(4)),
        outgoing::PLAY_MUSIC => Some(PacketSize::Fixed(2)),
        outgoing::PLAYER_UPDATE => Some(PacketSize::VarShort),
        outgoing::MESSAGE => Some(PacketSize::VarByte),
        _ => None,
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("opcode {0} is not part of the protocol")]
    UnknownOpcode(u8),
    #[error("frame for opcode {opcode} needs {needed} bytes, more than the {capacity} byte inbound buffer")]
    Oversized {
        opcode: u8,
        needed: usize,
        capacity: usize,
    },
    #[error("{len} byte body for opcode {opcode} exceeds its {max} byte length field")]
    BodyTooLong { opcode: u8, len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// Splits a cipher-obfuscated byte stream into frames.
///
/// The opcode is decoded as soon as its byte is seen and kept until the rest
/// of the frame arrives, so a frame split across reads draws exactly one
/// keystream value.
#[derive(Debug)]
pub struct FrameDecoder {
    cipher: IsaacCipher,
    sizes: fn(u8) -> Option<PacketSize>,
    pending: Option<u8>,
    capacity: usize,
}

impl FrameDecoder {
    pub fn new(cipher: IsaacCipher) -> Self {
        Self::with_sizes(cipher, incoming_size)
    }

    /// A decoder over a different size table, used for the server-to-client
    /// direction.
    pub fn with_sizes(cipher: IsaacCipher, sizes: fn(u8) -> Option<PacketSize>) -> Self {
        Self {
            cipher,
            sizes,
            pending: None,
            capacity: INBOUND_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Decodes one frame from the front of `input`.
    ///
    /// Returns the frame and the number of bytes it occupied, or `None` when
    /// more bytes are needed.
    pub fn decode(&mut self, input: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
        let Some(&first) = input.first() else {
            return Ok(None);
        };
        let opcode = match self.pending {
            Some(opcode) => opcode,
            None => {
                let opcode = first.wrapping_sub(self.cipher.next_byte());
                self.pending = Some(opcode);
                opcode
            }
        };
        let size = (self.sizes)(opcode).ok_or(FrameError::UnknownOpcode(opcode))?;
        let (header, len) = match size {
            PacketSize::Fixed(len) => (1, len),
            PacketSize::VarByte => match input.get(1) {
                Some(&len) => (2, len as usize),
                None => return Ok(None),
            },
            PacketSize::VarShort => match input.get(1..3) {
                Some(bytes) => (3, u16::from_be_bytes([bytes[0], bytes[1]]) as usize),
                None => return Ok(None),
            },
        };
        let needed = header + len;
        if needed > self.capacity {
            return Err(FrameError::Oversized {
                opcode,
                needed,
                capacity: self.capacity,
            });
        }
        if input.len() < needed {
            return Ok(None);
        }
        self.pending = None;
        let frame = Frame {
            opcode,
            payload: input[header..needed].to_vec(),
        };
        Ok(Some((frame, needed)))
    }
}

/// Writes a complete frame with an obfuscated opcode.
///
/// A body longer than the length field allows is refused before the opcode
/// draws from the keystream, leaving both the buffer and the cipher as they
/// were.
pub fn encode_frame(
    buffer: &mut Buffer,
    cipher: &mut IsaacCipher,
    opcode: u8,
    size: PacketSize,
    payload: &[u8],
) -> Result<(), FrameError> {
    let max = size.max_len();
    if payload.len() > max {
        return Err(FrameError::BodyTooLong {
            opcode,
            len: payload.len(),
            max,
        });
    }
    buffer.put_u8(opcode.wrapping_add(cipher.next_byte()));
    match size {
        PacketSize::Fixed(_) => {}
        PacketSize::VarByte => buffer.put_u8(payload.len() as u8),
        PacketSize::VarShort => buffer.put_u16(payload.len() as u16),
    }
    buffer.put_bytes(payload);
    Ok(())
}

/// Start of a frame whose length is patched in once the body is written.
#[derive(Debug, Clone, Copy)]
pub struct OpenFrame {
    opcode: u8,
    length_at: usize,
    size: PacketSize,
}

pub fn begin_frame(buffer: &mut Buffer, cipher: &mut IsaacCipher, opcode: u8, size: PacketSize) -> OpenFrame {
    buffer.put_u8(opcode.wrapping_add(cipher.next_byte()));
    let length_at = buffer.offset();
    match size {
        PacketSize::Fixed(_) => {}
        PacketSize::VarByte => buffer.put_u8(0),
        PacketSize::VarShort => buffer.put_u16(0),
    }
    OpenFrame {
        opcode,
        length_at,
        size,
    }
}

/// Patches the length of a frame opened with [`begin_frame`].
///
/// An oversized body is cut from the buffer together with its header. The
/// opcode has already drawn from the keystream, so the peer's cipher is out
/// of step and the stream must not be used further.
pub fn end_frame(buffer: &mut Buffer, frame: OpenFrame) -> Result<(), FrameError> {
    let end = buffer.offset();
    let body_at = match frame.size {
        PacketSize::Fixed(_) => return Ok(()),
        PacketSize::VarByte => frame.length_at + 1,
        PacketSize::VarShort => frame.length_at + 2,
    };
    let len = end - body_at;
    let max = frame.size.max_len();
    if len > max {
        buffer.truncate(frame.length_at - 1);
        return Err(FrameError::BodyTooLong {
            opcode: frame.opcode,
            len,
            max,
        });
    }
    buffer.set_offset(frame.length_at);
    match frame.size {
        PacketSize::VarByte => buffer.put_u8(len as u8),
        _ => buffer.put_u16(len as u16),
    }
    buffer.set_offset(end);
    Ok(())
}

/// Compass direction of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    NorthWest = 0,
    North = 1,
    NorthEast = 2,
    West = 3,
    East = 4,
    SouthWest = 5,
    South = 6,
    SouthEast = 7,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::NorthWest,
        Direction::North,
        Direction::NorthEast,
        Direction::West,
        Direction::East,
        Direction::SouthWest,
        Direction::South,
        Direction::SouthEast,
    ];

    /// Direction of travel for a step whose deltas have the given signs.
    pub fn from_delta(dx: i32, dy: i32) -> Option<Self> {
        match (dx.signum(), dy.signum()) {
            (-1, 1) => Some(Direction::NorthWest),
            (0, 1) => Some(Direction::North),
            (1, 1) => Some(Direction::NorthEast),
            (-1, 0) => Some(Direction::West),
            (1, 0) => Some(Direction::East),
            (-1, -1) => Some(Direction::SouthWest),
            (0, -1) => Some(Direction::South),
            (1, -1) => Some(Direction::SouthEast),
            _ => None,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::NorthWest => (-1, 1),
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::West => (-1, 0),
            Direction::East => (1, 0),
            Direction::SouthWest => (-1, -1),
            Direction::South => (0, -1),
            Direction::SouthEast => (1, -1),
        }
    }
}

/// Packs a player name into the base-37 form used by appearance blocks.
pub fn encode_base37(name: &str) -> u64 {
    let mut value = 0u64;
    for c in name.chars().take(MAX_USERNAME_LEN) {
        value = value.wrapping_mul(37);
        value += match c {
            'A'..='Z' => 1 + (c as u64 - 'A' as u64),
            'a'..='z' => 1 + (c as u64 - 'a' as u64),
            '0'..='9' => 27 + (c as u64 - '0' as u64),
            _ => 0,
        };
    }
    while value % 37 == 0 && value != 0 {
        value /= 37;
    }
    value
}

pub fn decode_base37(mut value: u64) -> String {
    const ALPHABET: &[u8; 37] = b"_abcdefghijklmnopqrstuvwxyz0123456789";
    let mut out = Vec::new();
    while value != 0 {
        out.push(ALPHABET[(value % 37) as usize]);
        value /= 37;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
