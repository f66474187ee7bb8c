//! Appearance and behaviour blocks appended to the player update packet.
//!
//! Each player's blocks are serialized once per tick, in two variants: the
//! regular one and one that also carries the appearance for observers that
//! are adding the player this tick.

use shared::Buffer;

pub mod mask {
    pub const FORCED_CHAT: u16 = 0x4;
    pub const ANIMATION: u16 = 0x8;
    pub const APPEARANCE: u16 = 0x10;
    pub const WIDE: u16 = 0x40;
    pub const CHAT: u16 = 0x80;
    pub const GRAPHIC: u16 = 0x100;
}

pub const EQUIPMENT_SLOTS: usize = 12;
const BODY_PART: u16 = 0x100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appearance {
    pub gender: u8,
    pub head_icon: u8,
    /// Per equipment slot: 0 for nothing, `0x100 + id` for a body part,
    /// `0x200 + id` for a worn item.
    pub slots: [u16; EQUIPMENT_SLOTS],
    pub colors: [u8; 5],
    /// Stand, turn, walk, turn around, turn right, turn left, run.
    pub animations: [u16; 7],
    pub combat_level: u8,
    pub skill_total: u16,
}

impl Default for Appearance {
    fn default() -> Self {
        let mut slots = [0; EQUIPMENT_SLOTS];
        for (slot, part) in [(4, 18), (6, 26), (7, 36), (8, 0), (9, 33), (10, 42), (11, 10)] {
            slots[slot] = BODY_PART + part;
        }
        Self {
            gender: 0,
            head_icon: 0,
            slots,
            colors: [0; 5],
            animations: [808, 823, 819, 820, 821, 822, 824],
            combat_level: 3,
            skill_total: 0,
        }
    }
}

impl Appearance {
    fn write(&self, name: u64, out: &mut Buffer) {
        let mut body = Buffer::with_capacity(64);
        body.put_u8(self.gender);
        body.put_u8(self.head_icon);
        for &slot in &self.slots {
            if slot == 0 {
                body.put_u8(0);
            } else {
                body.put_u16(slot);
            }
        }
        for &color in &self.colors {
            body.put_u8(color);
        }
        for &animation in &self.animations {
            body.put_u16(animation);
        }
        body.put_u64(name);
        body.put_u8(self.combat_level);
        body.put_u16(self.skill_total);

        out.put_u8_neg(body.len() as u8);
        out.put_bytes(body.as_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub effects: u16,
    pub rights: u8,
    /// Packed chat text as the client encoded it.
    pub text: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Animation {
    pub id: u16,
    pub delay: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graphic {
    pub id: u16,
    pub height: u16,
    pub delay: u16,
}

/// Pending blocks for one player plus their serialized forms.
#[derive(Debug, Clone, Default)]
pub struct UpdateFlags {
    appearance: bool,
    chat: Option<ChatMessage>,
    forced_chat: Option<String>,
    animation: Option<Animation>,
    graphic: Option<Graphic>,
    block: Vec<u8>,
    add_block: Vec<u8>,
}

impl UpdateFlags {
    pub fn flag_appearance(&mut self) {
        self.appearance = true;
    }

    pub fn set_chat(&mut self, message: ChatMessage) {
        self.chat = Some(message);
    }

    pub fn set_forced_chat(&mut self, text: impl Into<String>) {
        self.forced_chat = Some(text.into());
    }

    pub fn set_animation(&mut self, animation: Animation) {
        self.animation = Some(animation);
    }

    pub fn set_graphic(&mut self, graphic: Graphic) {
        self.graphic = Some(graphic);
    }

    pub fn mask(&self) -> u16 {
        let mut mask = 0;
        if self.graphic.is_some() {
            mask |= mask::GRAPHIC;
        }
        if self.animation.is_some() {
            mask |= mask::ANIMATION;
        }
        if self.forced_chat.is_some() {
            mask |= mask::FORCED_CHAT;
        }
        if self.chat.is_some() {
            mask |= mask::CHAT;
        }
        if self.appearance {
            mask |= mask::APPEARANCE;
        }
        mask
    }

    pub fn is_pending(&self) -> bool {
        self.mask() != 0
    }

    /// Serializes this tick's blocks for regular observers and for observers
    /// adding the player.
    pub fn prepare(&mut self, name: u64, appearance: &Appearance) {
        let mask = self.mask();
        self.block = if mask == 0 {
            Vec::new()
        } else {
            self.serialize(mask, name, appearance)
        };
        self.add_block = self.serialize(mask | mask::APPEARANCE, name, appearance);
    }

    fn serialize(&self, mask: u16, name: u64, appearance: &Appearance) -> Vec<u8> {
        let mut out = Buffer::with_capacity(96);
        if mask >= 0x100 {
            let wide = mask | mask::WIDE;
            out.put_u8(wide as u8);
            out.put_u8((wide >> 8) as u8);
        } else {
            out.put_u8(mask as u8);
        }
        if let (true, Some(graphic)) = (mask & mask::GRAPHIC != 0, self.graphic) {
            out.put_u16_le(graphic.id);
            out.put_u32((graphic.height as u32) << 16 | graphic.delay as u32);
        }
        if let (true, Some(animation)) = (mask & mask::ANIMATION != 0, self.animation) {
            out.put_u16_le(animation.id);
            out.put_u8_neg(animation.delay);
        }
        if let (true, Some(text)) = (mask & mask::FORCED_CHAT != 0, &self.forced_chat) {
            out.put_string(text);
        }
        if let (true, Some(chat)) = (mask & mask::CHAT != 0, &self.chat) {
            out.put_u16_le(chat.effects);
            out.put_u8(chat.rights);
            out.put_u8_neg(chat.text.len() as u8);
            out.put_bytes_reversed(&chat.text);
        }
        if mask & mask::APPEARANCE != 0 {
            appearance.write(name, &mut out);
        }
        out.into_inner()
    }

    /// The serialized blocks from the last [`UpdateFlags::prepare`].
    pub fn block(&self, added: bool) -> &[u8] {
        if added {
            &self.add_block
        } else {
            &self.block
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Appends a serialized block, writing a lone zero byte for an empty one.
pub fn write_block(payload: &mut Buffer, block: &[u8]) {
    if block.is_empty() {
        payload.put_u8(0);
    } else {
        payload.put_bytes(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_player_has_no_block_but_add_form_carries_appearance() {
        let mut flags = UpdateFlags::default();
        flags.prepare(1, &Appearance::default());
        assert!(!flags.is_pending());
        assert!(flags.block(false).is_empty());
        let added = flags.block(true);
        assert_eq!(added[0], mask::APPEARANCE as u8);
        assert_eq!(added[1].wrapping_neg() as usize, added.len() - 2);
    }

    #[test]
    fn test_appearance_layout() {
        let mut out = Buffer::new();
        Appearance::default().write(42, &mut out);
        let mut body = Buffer::wrap(out.into_inner());
        let len = body.get_u8_neg().unwrap() as usize;
        assert_eq!(len, body.remaining());
        assert_eq!(body.get_u8().unwrap(), 0);
        assert_eq!(body.get_u8().unwrap(), 0);
        for slot in 0..EQUIPMENT_SLOTS {
            let high = body.get_u8().unwrap();
            if high != 0 {
                let low = body.get_u8().unwrap();
                assert_eq!((high as u16) << 8 | low as u16, Appearance::default().slots[slot]);
            }
        }
        body.get_bytes(5).unwrap();
        assert_eq!(body.get_u16().unwrap(), 808);
        body.get_bytes(12).unwrap();
        assert_eq!(body.get_u64().unwrap(), 42);
        assert_eq!(body.get_u8().unwrap(), 3);
        assert_eq!(body.get_u16().unwrap(), 0);
    }

    #[test]
    fn test_chat_block_reverses_text() {
        let mut flags = UpdateFlags::default();
        flags.set_chat(ChatMessage {
            effects: 0x0102,
            rights: 1,
            text: vec![7, 8, 9],
        });
        flags.prepare(1, &Appearance::default());
        assert_eq!(flags.block(false), &[0x80, 0x02, 0x01, 1, 253, 9, 8, 7]);
    }

    #[test]
    fn test_wide_mask_for_graphic() {
        let mut flags = UpdateFlags::default();
        flags.set_graphic(Graphic {
            id: 0x1234,
            height: 100,
            delay: 5,
        });
        flags.prepare(1, &Appearance::default());
        let block = flags.block(false);
        assert_eq!(&block[..2], &[0x40, 0x01]);
        assert_eq!(&block[2..4], &[0x34, 0x12]);
        assert_eq!(&block[4..8], &[0, 100, 0, 5]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut flags = UpdateFlags::default();
        flags.flag_appearance();
        flags.set_forced_chat("hi");
        flags.set_animation(Animation { id: 1, delay: 0 });
        flags.prepare(1, &Appearance::default());
        assert!(!flags.block(false).is_empty());
        flags.clear();
        assert!(!flags.is_pending());
        assert!(flags.block(true).is_empty());
    }

    #[test]
    fn test_empty_block_written_as_zero() {
        let mut payload = Buffer::new();
        write_block(&mut payload, &[]);
        write_block(&mut payload, &[0x10, 1]);
        assert_eq!(payload.as_bytes(), &[0, 0x10, 1]);
    }
}
