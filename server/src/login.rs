//! Handshake and login block parsing.
//!
//! Both stages arrive in cleartext apart from the login block, whose
//! decryption is delegated to a [`BlockDecipher`]. Parsers take the bytes
//! buffered so far and return `Ok(None)` until a complete message is present.

use crate::error::ProtocolError;
use shared::protocol::{
    status, BLOCK_MAGIC, CRC_COUNT, HANDSHAKE_OPCODE, HANDSHAKE_REPLY_LEN, LOGIN_MAGIC, LOGIN_NEW,
    LOGIN_RECONNECT, MAX_NAME_HASH, MAX_USERNAME_LEN, REVISION,
};
use shared::Buffer;

/// Turns the enciphered login block into plaintext.
pub trait BlockDecipher: Send + Sync {
    fn decipher(&self, block: &[u8]) -> Result<Vec<u8>, ProtocolError>;
}

/// Accepts blocks that were never enciphered.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainBlock;

impl BlockDecipher for PlainBlock {
    fn decipher(&self, block: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Ok(block.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub name_hash: u8,
}

pub fn read_handshake(input: &[u8]) -> Result<Option<(Handshake, usize)>, ProtocolError> {
    let Some(&opcode) = input.first() else {
        return Ok(None);
    };
    if opcode != HANDSHAKE_OPCODE {
        return Err(ProtocolError::BadHandshake(opcode));
    }
    let Some(&name_hash) = input.get(1) else {
        return Ok(None);
    };
    if name_hash > MAX_NAME_HASH {
        return Err(ProtocolError::BadNameHash(name_hash));
    }
    Ok(Some((Handshake { name_hash }, 2)))
}

/// Nine-byte handshake reply, followed by the session key on success.
pub fn handshake_reply(code: u8, session_key: Option<u64>) -> Vec<u8> {
    let mut reply = Buffer::with_capacity(HANDSHAKE_REPLY_LEN + 8);
    reply.put_bytes(&[0; HANDSHAKE_REPLY_LEN - 1]);
    reply.put_u8(code);
    if let Some(key) = session_key {
        reply.put_u64(key);
    }
    reply.into_inner()
}

pub fn login_reply(rights: u8) -> [u8; 3] {
    [status::LOGIN_OK, rights, 0]
}

#[derive(Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub reconnecting: bool,
    pub low_memory: bool,
    pub crcs: [u32; CRC_COUNT],
    pub seeds: [u32; 4],
    pub uid: u32,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("reconnecting", &self.reconnecting)
            .field("low_memory", &self.low_memory)
            .field("uid", &self.uid)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

pub fn read_login(
    input: &[u8],
    decipher: &dyn BlockDecipher,
) -> Result<Option<(LoginRequest, usize)>, ProtocolError> {
    let Some(&opcode) = input.first() else {
        return Ok(None);
    };
    if opcode != LOGIN_NEW && opcode != LOGIN_RECONNECT {
        return Err(ProtocolError::BadLoginOpcode(opcode));
    }
    let Some(&size) = input.get(1) else {
        return Ok(None);
    };
    let size = size as usize;
    let Some(body) = input.get(2..2 + size) else {
        return Ok(None);
    };

    let mut body = Buffer::wrap(body.to_vec());
    let magic = body.get_u8()?;
    if magic != LOGIN_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let revision = body.get_u16()?;
    if revision != REVISION {
        return Err(ProtocolError::RevisionMismatch(revision));
    }
    let low_memory = body.get_u8()? == 1;
    let mut crcs = [0u32; CRC_COUNT];
    for crc in &mut crcs {
        *crc = body.get_u32()?;
    }
    let block_len = body.get_u8()? as usize;
    if block_len > body.remaining() {
        return Err(ProtocolError::BlockLength {
            declared: size,
            block: block_len,
        });
    }
    let block = decipher.decipher(&body.get_bytes(block_len)?)?;

    let mut block = Buffer::wrap(block);
    let block_magic = block.get_u8()?;
    if block_magic != BLOCK_MAGIC {
        return Err(ProtocolError::BadBlockMagic(block_magic));
    }
    let mut seeds = [0u32; 4];
    for seed in &mut seeds {
        *seed = block.get_u32()?;
    }
    let uid = block.get_u32()?;
    let username = block.get_string()?;
    let password = block.get_string()?;
    validate_username(&username)?;

    let request = LoginRequest {
        reconnecting: opcode == LOGIN_RECONNECT,
        low_memory,
        crcs,
        seeds,
        uid,
        username,
        password,
    };
    Ok(Some((request, 2 + size)))
}

pub fn validate_username(name: &str) -> Result<(), ProtocolError> {
    let valid = !name.trim().is_empty()
        && name.len() <= MAX_USERNAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidUsername(name.to_string()))
    }
}
