//! Decoding of session packets and building of the simple outbound ones.

use crate::error::ProtocolError;
use shared::buffer::STRING_TERMINATOR;
use shared::protocol::{begin_frame, end_frame, incoming, outgoing, PacketSize, MINIMAP_TRAILER};
use shared::{Buffer, CodecError, Frame, FrameError, IsaacCipher};

/// Longest message text; the terminator takes the last byte of the frame.
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize - 1;

/// A decoded client packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Ping,
    Chat { effects: u16, text: Vec<u8> },
    Command(String),
    Walk { points: Vec<(i32, i32)>, run: bool },
    Logout,
    /// A packet with a valid size that nothing here acts on.
    Ignored(u8),
}

impl Inbound {
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let mut payload = Buffer::wrap(frame.payload.clone());
        let packet = match frame.opcode {
            incoming::PING => Inbound::Ping,
            incoming::LOGOUT => Inbound::Logout,
            incoming::CHAT => {
                let effect = payload.get_u8_sub()? as u16;
                let color = payload.get_u8_sub()? as u16;
                let mut text = payload.get_bytes(payload.remaining())?;
                for byte in &mut text {
                    *byte = byte.wrapping_sub(128);
                }
                text.reverse();
                Inbound::Chat {
                    effects: effect | color << 8,
                    text,
                }
            }
            incoming::COMMAND => {
                let mut bytes = frame.payload.as_slice();
                if let [rest @ .., STRING_TERMINATOR] = bytes {
                    bytes = rest;
                }
                Inbound::Command(String::from_utf8_lossy(bytes).into_owned())
            }
            incoming::WALK | incoming::WALK_ACTION | incoming::WALK_MINIMAP => {
                decode_walk(frame.opcode, &mut payload)?
            }
            opcode => Inbound::Ignored(opcode),
        };
        Ok(packet)
    }
}

fn decode_walk(opcode: u8, payload: &mut Buffer) -> Result<Inbound, ProtocolError> {
    let trailer = if opcode == incoming::WALK_MINIMAP {
        MINIMAP_TRAILER
    } else {
        0
    };
    let body = payload
        .len()
        .checked_sub(trailer + 5)
        .ok_or(CodecError::Overrun {
            offset: 0,
            wanted: trailer + 5,
            len: payload.len(),
        })?;
    let steps = body / 2;
    if steps + 1 >= crate::motion::MAX_POINTS {
        return Err(ProtocolError::PathTooLong(steps + 1));
    }

    let first_x = payload.get_u16_le_add()? as i32;
    let mut offsets = Vec::with_capacity(steps);
    for _ in 0..steps {
        let dx = payload.get_i8()? as i32;
        let dy = payload.get_i8()? as i32;
        offsets.push((dx, dy));
    }
    payload.set_offset(payload.len() - trailer - 3);
    let first_y = payload.get_u16_le()? as i32;
    let run = payload.get_u8_neg()? == 1;

    let mut points = Vec::with_capacity(steps + 1);
    points.push((first_x, first_y));
    points.extend(offsets.into_iter().map(|(dx, dy)| (first_x + dx, first_y + dy)));
    Ok(Inbound::Walk { points, run })
}

/// Anchors the client's map view on a chunk.
pub fn set_chunk(out: &mut Buffer, cipher: &mut IsaacCipher, anchor: (i32, i32)) -> Result<(), FrameError> {
    let frame = begin_frame(out, cipher, outgoing::SET_CHUNK, PacketSize::Fixed(4));
    out.put_u16_add((anchor.0 + 6) as u16);
    out.put_u16((anchor.1 + 6) as u16);
    end_frame(out, frame)
}

pub fn play_music(out: &mut Buffer, cipher: &mut IsaacCipher, track: u16) -> Result<(), FrameError> {
    let frame = begin_frame(out, cipher, outgoing::PLAY_MUSIC, PacketSize::Fixed(2));
    out.put_u16_le(track);
    end_frame(out, frame)
}

/// Sends a chat box message, cut to [`MAX_MESSAGE_LEN`] bytes.
pub fn message(out: &mut Buffer, cipher: &mut IsaacCipher, text: &str) -> Result<(), FrameError> {
    let frame = begin_frame(out, cipher, outgoing::MESSAGE, PacketSize::VarByte);
    out.put_string(clip(text, MAX_MESSAGE_LEN));
    end_frame(out, frame)
}

fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::outgoing_size;
    use shared::FrameDecoder;

    fn frame(opcode: u8, payload: Vec<u8>) -> Frame {
        Frame { opcode, payload }
    }

    fn walk_payload(first: (u16, u16), offsets: &[(i8, i8)], run: bool, trailer: usize) -> Vec<u8> {
        let mut buffer = Buffer::new();
        buffer.put_u16_le_add(first.0);
        for &(dx, dy) in offsets {
            buffer.put_i8(dx);
            buffer.put_i8(dy);
        }
        buffer.put_u16_le(first.1);
        buffer.put_u8_neg(run as u8);
        buffer.put_bytes(&vec![0; trailer]);
        buffer.into_inner()
    }

    #[test]
    fn test_walk_points_are_relative_to_first() {
        let payload = walk_payload((3200, 3201), &[(1, 0), (3, -2)], true, 0);
        let packet = Inbound::decode(&frame(incoming::WALK, payload)).unwrap();
        assert_eq!(
            packet,
            Inbound::Walk {
                points: vec![(3200, 3201), (3201, 3201), (3203, 3199)],
                run: true,
            }
        );
    }

    #[test]
    fn test_minimap_walk_skips_trailer() {
        let payload = walk_payload((10, 20), &[(0, 5)], false, MINIMAP_TRAILER);
        let packet = Inbound::decode(&frame(incoming::WALK_MINIMAP, payload)).unwrap();
        assert_eq!(
            packet,
            Inbound::Walk {
                points: vec![(10, 20), (10, 25)],
                run: false,
            }
        );
    }

    #[test]
    fn test_walk_too_long() {
        let offsets = vec![(1i8, 0i8); 29];
        let payload = walk_payload((0, 0), &offsets, false, 0);
        assert!(matches!(
            Inbound::decode(&frame(incoming::WALK, payload)),
            Err(ProtocolError::PathTooLong(30))
        ));
    }

    #[test]
    fn test_walk_too_short() {
        assert!(matches!(
            Inbound::decode(&frame(incoming::WALK, vec![1, 2])),
            Err(ProtocolError::Codec(_))
        ));
    }

    #[test]
    fn test_chat_decoding() {
        let text = [3u8, 4, 5];
        let mut payload = Buffer::new();
        payload.put_u8_sub(2);
        payload.put_u8_sub(9);
        for &byte in text.iter().rev() {
            payload.put_u8_add(byte);
        }
        let packet = Inbound::decode(&frame(incoming::CHAT, payload.into_inner())).unwrap();
        assert_eq!(
            packet,
            Inbound::Chat {
                effects: 9 << 8 | 2,
                text: text.to_vec(),
            }
        );
    }

    #[test]
    fn test_command_strips_terminator() {
        let packet = Inbound::decode(&frame(incoming::COMMAND, b"home\n".to_vec())).unwrap();
        assert_eq!(packet, Inbound::Command("home".to_string()));
    }

    #[test]
    fn test_unhandled_opcode_is_ignored() {
        let packet = Inbound::decode(&frame(241, vec![0; 4])).unwrap();
        assert_eq!(packet, Inbound::Ignored(241));
    }

    #[test]
    fn test_set_chunk_layout() {
        let mut out = Buffer::new();
        let mut cipher = IsaacCipher::new(&[0; 4]);
        let mut mirror = cipher.clone();
        set_chunk(&mut out, &mut cipher, (394, 395)).unwrap();
        let bytes = out.as_bytes();
        assert_eq!(bytes[0], outgoing::SET_CHUNK.wrapping_add(mirror.next_byte()));
        assert_eq!(&bytes[1..], &[1, (400u16 as u8).wrapping_add(128), 1, 145]);
    }

    #[test]
    fn test_message_is_var_byte() {
        let mut out = Buffer::new();
        let mut cipher = IsaacCipher::new(&[0; 4]);
        message(&mut out, &mut cipher, "hey").unwrap();
        assert_eq!(&out.as_bytes()[1..], &[4, b'h', b'e', b'y', 10]);
    }

    fn decode_messages(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::with_sizes(IsaacCipher::new(&[0; 4]), outgoing_size);
        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some((frame, used)) = decoder.decode(&bytes[offset..]).unwrap() {
            frames.push(frame);
            offset += used;
        }
        assert_eq!(offset, bytes.len());
        frames
    }

    #[test]
    fn test_longest_message_fits() {
        let text = "a".repeat(MAX_MESSAGE_LEN);
        let mut out = Buffer::new();
        let mut cipher = IsaacCipher::new(&[0; 4]);
        message(&mut out, &mut cipher, &text).unwrap();
        play_music(&mut out, &mut cipher, 7).unwrap();

        let frames = decode_messages(out.as_bytes());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), 255);
        assert_eq!(frames[1].opcode, outgoing::PLAY_MUSIC);
    }

    #[test]
    fn test_long_message_is_cut_and_stream_stays_aligned() {
        let text = "é".repeat(150);
        let mut out = Buffer::new();
        let mut cipher = IsaacCipher::new(&[0; 4]);
        message(&mut out, &mut cipher, &text).unwrap();
        message(&mut out, &mut cipher, "after").unwrap();

        let frames = decode_messages(out.as_bytes());
        assert_eq!(frames.len(), 2);
        let first = &frames[0].payload;
        assert_eq!(first.len(), 255);
        assert_eq!(first.last(), Some(&STRING_TERMINATOR));
        assert!(std::str::from_utf8(&first[..first.len() - 1]).is_ok());
        assert_eq!(frames[1].payload, b"after\n".to_vec());
    }
}
