//! Client-side view of the world, rebuilt from server packets.
//!
//! [`PlayerView`] decodes the player update packet exactly as a game client
//! would: it keeps the list of rendered players in server order and applies
//! each tick's movement, removals and additions to it.

use shared::protocol::{decode_base37, outgoing, ADD_TERMINATOR};
use shared::{Buffer, CodecError, Direction, Frame};
use std::collections::HashMap;
use thiserror::Error;

const GRAPHIC: u16 = 0x100;
const ANIMATION: u16 = 0x8;
const FORCED_CHAT: u16 = 0x4;
const CHAT: u16 = 0x80;
const APPEARANCE: u16 = 0x10;
const WIDE: u16 = 0x40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("update lists {count} players but only {known} are rendered")]
    CountMismatch { count: usize, known: usize },
    #[error("player update arrived before the map anchor")]
    NoAnchor,
    #[error("invalid direction code {0}")]
    BadDirection(u32),
}

/// Another player as this client sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Seen {
    pub x: i32,
    pub y: i32,
    pub name: Option<String>,
    pub forced_chat: Option<String>,
}

/// Update blocks of one player.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blocks {
    pub mask: u16,
    pub name: Option<String>,
    pub forced_chat: Option<String>,
    pub chat: Option<Vec<u8>>,
    pub animation: Option<u16>,
    pub graphic: Option<u16>,
}

#[derive(Debug, Default)]
pub struct PlayerView {
    anchor: Option<(i32, i32)>,
    position: Option<(i32, i32, u8)>,
    active: Vec<usize>,
    players: HashMap<usize, Seen>,
    /// Players dropped by the last update.
    pub removed: Vec<usize>,
    /// Players added by the last update.
    pub added: Vec<usize>,
    pub local_blocks: Option<Blocks>,
    pub messages: Vec<String>,
    pub track: Option<u16>,
    pub updates: u64,
}

impl PlayerView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk the map is anchored on.
    pub fn anchor(&self) -> Option<(i32, i32)> {
        self.anchor
    }

    /// Absolute position of the local player.
    pub fn position(&self) -> Option<(i32, i32, u8)> {
        self.position
    }

    /// Rendered players in server order.
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    pub fn player(&self, slot: usize) -> Option<&Seen> {
        self.players.get(&slot)
    }

    pub fn sees(&self, slot: usize) -> bool {
        self.players.contains_key(&slot)
    }

    pub fn handle(&mut self, frame: &Frame) -> Result<(), ViewError> {
        let mut payload = Buffer::wrap(frame.payload.clone());
        match frame.opcode {
            outgoing::SET_CHUNK => {
                let x = payload.get_u16_add()? as i32;
                let y = payload.get_u16()? as i32;
                self.anchor = Some((x - 6, y - 6));
            }
            outgoing::PLAY_MUSIC => self.track = Some(payload.get_u16_le()?),
            outgoing::MESSAGE => self.messages.push(payload.get_string()?),
            outgoing::PLAYER_UPDATE => self.apply_update(payload)?,
            _ => {}
        }
        Ok(())
    }

    fn step(position: &mut (i32, i32), code: u32) -> Result<(), ViewError> {
        let (dx, dy) = Direction::from_code(code)
            .ok_or(ViewError::BadDirection(code))?
            .delta();
        position.0 += dx;
        position.1 += dy;
        Ok(())
    }

    fn apply_update(&mut self, mut buf: Buffer) -> Result<(), ViewError> {
        self.updates += 1;
        self.removed.clear();
        self.added.clear();
        self.local_blocks = None;
        // None stands for the local player.
        let mut flagged: Vec<Option<usize>> = Vec::new();

        buf.begin_bit_mode();
        if buf.get_bit()? {
            let (mut x, mut y, mut plane) = self.position.unwrap_or_default();
            match buf.get_bits(2)? {
                0 => flagged.push(None),
                1 => {
                    let mut at = (x, y);
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    (x, y) = at;
                    if buf.get_bit()? {
                        flagged.push(None);
                    }
                }
                2 => {
                    let mut at = (x, y);
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    (x, y) = at;
                    if buf.get_bit()? {
                        flagged.push(None);
                    }
                }
                _ => {
                    plane = buf.get_bits(2)? as u8;
                    let _discard = buf.get_bit()?;
                    if buf.get_bit()? {
                        flagged.push(None);
                    }
                    let local_y = buf.get_bits(7)? as i32;
                    let local_x = buf.get_bits(7)? as i32;
                    let (anchor_x, anchor_y) = self.anchor.ok_or(ViewError::NoAnchor)?;
                    x = anchor_x * 8 + local_x;
                    y = anchor_y * 8 + local_y;
                }
            }
            self.position = Some((x, y, plane));
        }

        let count = buf.get_bits(8)? as usize;
        if count > self.active.len() {
            return Err(ViewError::CountMismatch {
                count,
                known: self.active.len(),
            });
        }
        let previous = std::mem::take(&mut self.active);
        for (index, slot) in previous.into_iter().enumerate() {
            if index >= count {
                self.players.remove(&slot);
                self.removed.push(slot);
                continue;
            }
            if !buf.get_bit()? {
                self.active.push(slot);
                continue;
            }
            let seen = self.players.entry(slot).or_default();
            let mut at = (seen.x, seen.y);
            match buf.get_bits(2)? {
                0 => flagged.push(Some(slot)),
                1 => {
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    if buf.get_bit()? {
                        flagged.push(Some(slot));
                    }
                }
                2 => {
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    Self::step(&mut at, buf.get_bits(3)?)?;
                    if buf.get_bit()? {
                        flagged.push(Some(slot));
                    }
                }
                _ => {
                    self.players.remove(&slot);
                    self.removed.push(slot);
                    continue;
                }
            }
            (seen.x, seen.y) = at;
            self.active.push(slot);
        }

        let (x, y, _) = self.position.unwrap_or_default();
        loop {
            let slot = buf.get_bits(11)?;
            if slot == ADD_TERMINATOR {
                break;
            }
            let slot = slot as usize;
            let update = buf.get_bit()?;
            let _discard = buf.get_bit()?;
            let dy = signed_5(buf.get_bits(5)?);
            let dx = signed_5(buf.get_bits(5)?);
            self.players.insert(
                slot,
                Seen {
                    x: x + dx,
                    y: y + dy,
                    ..Seen::default()
                },
            );
            self.active.push(slot);
            self.added.push(slot);
            if update {
                flagged.push(Some(slot));
            }
        }
        buf.end_bit_mode();

        for target in flagged {
            let blocks = read_blocks(&mut buf)?;
            match target {
                None => self.local_blocks = Some(blocks),
                Some(slot) => {
                    if let Some(seen) = self.players.get_mut(&slot) {
                        if blocks.name.is_some() {
                            seen.name = blocks.name;
                        }
                        if blocks.forced_chat.is_some() {
                            seen.forced_chat = blocks.forced_chat;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn signed_5(value: u32) -> i32 {
    if value > 15 {
        value as i32 - 32
    } else {
        value as i32
    }
}

pub fn read_blocks(buf: &mut Buffer) -> Result<Blocks, CodecError> {
    let mut mask = buf.get_u8()? as u16;
    if mask & WIDE != 0 {
        mask |= (buf.get_u8()? as u16) << 8;
    }
    let mut blocks = Blocks {
        mask,
        ..Blocks::default()
    };
    if mask & GRAPHIC != 0 {
        blocks.graphic = Some(buf.get_u16_le()?);
        buf.get_u32()?;
    }
    if mask & ANIMATION != 0 {
        blocks.animation = Some(buf.get_u16_le()?);
        buf.get_u8_neg()?;
    }
    if mask & FORCED_CHAT != 0 {
        blocks.forced_chat = Some(buf.get_string()?);
    }
    if mask & CHAT != 0 {
        buf.get_u16_le()?;
        buf.get_u8()?;
        let len = buf.get_u8_neg()? as usize;
        blocks.chat = Some(buf.get_bytes_reversed(len)?);
    }
    if mask & APPEARANCE != 0 {
        let len = buf.get_u8_neg()? as usize;
        let mut body = Buffer::wrap(buf.get_bytes(len)?);
        body.get_u8()?;
        body.get_u8()?;
        for _ in 0..12 {
            if body.get_u8()? != 0 {
                body.get_u8()?;
            }
        }
        body.get_bytes(5)?;
        body.get_bytes(14)?;
        blocks.name = Some(decode_base37(body.get_u64()?));
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::PacketSize;

    fn frame(opcode: u8, payload: Vec<u8>) -> Frame {
        Frame { opcode, payload }
    }

    fn anchored() -> PlayerView {
        let mut view = PlayerView::new();
        let mut payload = Buffer::new();
        payload.put_u16_add(400 + 6);
        payload.put_u16(400 + 6);
        view.handle(&frame(outgoing::SET_CHUNK, payload.into_inner()))
            .unwrap();
        view
    }

    fn update(write: impl FnOnce(&mut Buffer)) -> Frame {
        let mut bits = Buffer::new();
        bits.begin_bit_mode();
        write(&mut bits);
        bits.end_bit_mode();
        frame(outgoing::PLAYER_UPDATE, bits.into_inner())
    }

    #[test]
    fn test_local_teleport_uses_anchor() {
        let mut view = anchored();
        assert_eq!(view.anchor(), Some((400, 400)));
        let packet = update(|b| {
            b.put_bit(true).unwrap();
            b.put_bits(2, 3).unwrap();
            b.put_bits(2, 0).unwrap();
            b.put_bit(true).unwrap();
            b.put_bit(false).unwrap();
            b.put_bits(7, 52).unwrap();
            b.put_bits(7, 50).unwrap();
            b.put_bits(8, 0).unwrap();
            b.put_bits(11, ADD_TERMINATOR).unwrap();
        });
        view.handle(&packet).unwrap();
        assert_eq!(view.position(), Some((3250, 3252, 0)));
    }

    #[test]
    fn test_add_then_walk_then_remove() {
        let mut view = anchored();
        view.position = Some((3200, 3200, 0));

        let add = update(|b| {
            b.put_bit(false).unwrap();
            b.put_bits(8, 0).unwrap();
            b.put_bits(11, 7).unwrap();
            b.put_bit(false).unwrap();
            b.put_bit(true).unwrap();
            b.put_bits(5, (-3i32) as u32 & 31).unwrap();
            b.put_bits(5, 4).unwrap();
            b.put_bits(11, ADD_TERMINATOR).unwrap();
        });
        view.handle(&add).unwrap();
        assert_eq!(view.added, vec![7]);
        assert_eq!(view.player(7).map(|p| (p.x, p.y)), Some((3204, 3197)));

        let walk = update(|b| {
            b.put_bit(false).unwrap();
            b.put_bits(8, 1).unwrap();
            b.put_bit(true).unwrap();
            b.put_bits(2, 1).unwrap();
            b.put_bits(3, Direction::North.code()).unwrap();
            b.put_bit(false).unwrap();
            b.put_bits(11, ADD_TERMINATOR).unwrap();
        });
        view.handle(&walk).unwrap();
        assert_eq!(view.player(7).map(|p| (p.x, p.y)), Some((3204, 3198)));

        let remove = update(|b| {
            b.put_bit(false).unwrap();
            b.put_bits(8, 1).unwrap();
            b.put_bit(true).unwrap();
            b.put_bits(2, 3).unwrap();
            b.put_bits(11, ADD_TERMINATOR).unwrap();
        });
        view.handle(&remove).unwrap();
        assert_eq!(view.removed, vec![7]);
        assert!(!view.sees(7));
        assert!(view.active().is_empty());
    }

    #[test]
    fn test_count_larger_than_known_is_error() {
        let mut view = anchored();
        let packet = update(|b| {
            b.put_bit(false).unwrap();
            b.put_bits(8, 2).unwrap();
        });
        assert_eq!(
            view.handle(&packet),
            Err(ViewError::CountMismatch { count: 2, known: 0 })
        );
    }

    #[test]
    fn test_blocks_forced_chat_and_graphic() {
        let mut buf = Buffer::new();
        buf.put_u8((GRAPHIC | WIDE | FORCED_CHAT) as u8);
        buf.put_u8(((GRAPHIC | WIDE) >> 8) as u8);
        buf.put_u16_le(99);
        buf.put_u32(0);
        buf.put_string("hello");
        let blocks = read_blocks(&mut Buffer::wrap(buf.into_inner())).unwrap();
        assert_eq!(blocks.graphic, Some(99));
        assert_eq!(blocks.forced_chat.as_deref(), Some("hello"));
    }

    #[test]
    fn test_messages_and_music() {
        let mut view = PlayerView::new();
        let mut out = Buffer::new();
        out.put_string("Welcome.");
        view.handle(&frame(outgoing::MESSAGE, out.into_inner())).unwrap();
        view.handle(&frame(outgoing::PLAY_MUSIC, vec![62, 0])).unwrap();
        assert_eq!(view.messages, vec!["Welcome.".to_string()]);
        assert_eq!(view.track, Some(62));
        assert_eq!(shared::protocol::outgoing_size(outgoing::PLAY_MUSIC), Some(PacketSize::Fixed(2)));
    }
}
