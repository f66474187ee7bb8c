//! Byte and bit cursors over a growable payload.
//!
//! The wire format mixes plain big-endian integers with a handful of legacy
//! transforms (`add`: +128 on the low byte, `neg`: negated byte, `sub`:
//! 128 minus the byte) and with bit-packed sections. A single [`Buffer`]
//! serves all of them: writes extend the payload as needed, reads are bounds
//! checked and report [`CodecError`] instead of panicking.

use thiserror::Error;

/// Terminator byte for strings on the wire.
pub const STRING_TERMINATOR: u8 = 10;

/// Largest value a smart integer can carry.
pub const SMART_MAX: u16 = 0x7FFF;

const fn bit_masks() -> [u32; 33] {
    let mut masks = [0u32; 33];
    let mut i = 0;
    while i < 32 {
        masks[i] = (1u32 << i) - 1;
        i += 1;
    }
    masks[32] = u32::MAX;
    masks
}

const MASKS: [u32; 33] = bit_masks();

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("read of {wanted} bytes at offset {offset} overruns payload of {len} bytes")]
    Overrun {
        offset: usize,
        wanted: usize,
        len: usize,
    },
    #[error("read of {wanted} bits at bit offset {bit_offset} overruns payload of {len} bytes")]
    BitOverrun {
        bit_offset: usize,
        wanted: u32,
        len: usize,
    },
    #[error("string starting at offset {0} is not terminated")]
    UnterminatedString(usize),
    #[error("bit field width {0} is outside 1..=32")]
    BitWidth(u32),
    #[error("smart value {0} does not fit in 15 bits")]
    SmartRange(u16),
}

/// A payload with a byte cursor and a bit cursor.
///
/// Bit mode is entered with [`Buffer::begin_bit_mode`], which places the bit
/// cursor on the current byte, and left with [`Buffer::end_bit_mode`], which
/// rounds the byte cursor up to the next whole byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    payload: Vec<u8>,
    offset: usize,
    bit_offset: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            offset: 0,
            bit_offset: 0,
        }
    }

    /// Wraps received bytes for reading from the start.
    pub fn wrap(payload: Vec<u8>) -> Self {
        Self {
            payload,
            offset: 0,
            bit_offset: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remaining(&self) -> usize {
        self.payload.len().saturating_sub(self.offset)
    }

    pub fn clear(&mut self) {
        self.payload.clear();
        self.offset = 0;
        self.bit_offset = 0;
    }

    /// Drops everything written from `len` on.
    pub fn truncate(&mut self, len: usize) {
        self.payload.truncate(len);
        self.offset = self.offset.min(len);
        self.bit_offset = self.bit_offset.min(len * 8);
    }

    /// Hands the written bytes over and leaves an empty buffer behind.
    pub fn take(&mut self) -> Vec<u8> {
        self.offset = 0;
        self.bit_offset = 0;
        std::mem::take(&mut self.payload)
    }

    fn reserve_to(&mut self, end: usize) {
        if self.payload.len() < end {
            self.payload.resize(end, 0);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        let end = self.offset + bytes.len();
        self.reserve_to(end);
        self.payload[self.offset..end].copy_from_slice(bytes);
        self.offset = end;
    }

    fn read<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.offset + N;
        if end > self.payload.len() {
            return Err(CodecError::Overrun {
                offset: self.offset,
                wanted: N,
                len: self.payload.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.payload[self.offset..end]);
        self.offset = end;
        Ok(out)
    }

    pub fn put_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    pub fn put_i8(&mut self, value: i8) {
        self.write(&[value as u8]);
    }

    pub fn put_u8_add(&mut self, value: u8) {
        self.put_u8(value.wrapping_add(128));
    }

    pub fn put_u8_neg(&mut self, value: u8) {
        self.put_u8(value.wrapping_neg());
    }

    pub fn put_u8_sub(&mut self, value: u8) {
        self.put_u8(128u8.wrapping_sub(value));
    }

    pub fn put_u16(&mut self, value: u16) {
        self.write(&value.to_be_bytes());
    }

    pub fn put_u16_le(&mut self, value: u16) {
        self.write(&value.to_le_bytes());
    }

    /// Big-endian word with +128 applied to the low byte.
    pub fn put_u16_add(&mut self, value: u16) {
        self.put_u8((value >> 8) as u8);
        self.put_u8_add(value as u8);
    }

    /// Little-endian word with +128 applied to the low byte.
    pub fn put_u16_le_add(&mut self, value: u16) {
        self.put_u8_add(value as u8);
        self.put_u8((value >> 8) as u8);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.write(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.write(&value.to_be_bytes());
    }

    /// One byte below 128, otherwise a word with the high bit set.
    pub fn put_smart(&mut self, value: u16) -> Result<(), CodecError> {
        match value {
            0..=0x7F => self.put_u8(value as u8),
            0x80..=SMART_MAX => self.put_u16(value | 0x8000),
            _ => return Err(CodecError::SmartRange(value)),
        }
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.write(bytes);
    }

    pub fn put_bytes_reversed(&mut self, bytes: &[u8]) {
        for &byte in bytes.iter().rev() {
            self.put_u8(byte);
        }
    }

    pub fn put_string(&mut self, value: &str) {
        self.write(value.as_bytes());
        self.put_u8(STRING_TERMINATOR);
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read::<1>()?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_u8_add(&mut self) -> Result<u8, CodecError> {
        Ok(self.get_u8()?.wrapping_sub(128))
    }

    pub fn get_u8_neg(&mut self) -> Result<u8, CodecError> {
        Ok(self.get_u8()?.wrapping_neg())
    }

    pub fn get_i8_neg(&mut self) -> Result<i8, CodecError> {
        Ok(self.get_u8_neg()? as i8)
    }

    pub fn get_u8_sub(&mut self) -> Result<u8, CodecError> {
        Ok(128u8.wrapping_sub(self.get_u8()?))
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.read()?))
    }

    pub fn get_u16_le(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.read()?))
    }

    pub fn get_u16_add(&mut self) -> Result<u16, CodecError> {
        let high = self.get_u8()? as u16;
        let low = self.get_u8_add()? as u16;
        Ok(high << 8 | low)
    }

    pub fn get_u16_le_add(&mut self) -> Result<u16, CodecError> {
        let low = self.get_u8_add()? as u16;
        let high = self.get_u8()? as u16;
        Ok(high << 8 | low)
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.read()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.read()?))
    }

    pub fn get_smart(&mut self) -> Result<u16, CodecError> {
        let peek = *self.payload.get(self.offset).ok_or(CodecError::Overrun {
            offset: self.offset,
            wanted: 1,
            len: self.payload.len(),
        })?;
        if peek < 0x80 {
            Ok(self.get_u8()? as u16)
        } else {
            Ok(self.get_u16()? - 0x8000)
        }
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        let end = self.offset + count;
        if end > self.payload.len() {
            return Err(CodecError::Overrun {
                offset: self.offset,
                wanted: count,
                len: self.payload.len(),
            });
        }
        let bytes = self.payload[self.offset..end].to_vec();
        self.offset = end;
        Ok(bytes)
    }

    pub fn get_bytes_reversed(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        let mut bytes = self.get_bytes(count)?;
        bytes.reverse();
        Ok(bytes)
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let start = self.offset;
        let tail = &self.payload[start.min(self.payload.len())..];
        let end = tail
            .iter()
            .position(|&b| b == STRING_TERMINATOR)
            .ok_or(CodecError::UnterminatedString(start))?;
        let value = String::from_utf8_lossy(&tail[..end]).into_owned();
        self.offset = start + end + 1;
        Ok(value)
    }

    pub fn begin_bit_mode(&mut self) {
        self.bit_offset = self.offset * 8;
    }

    pub fn end_bit_mode(&mut self) {
        self.offset = (self.bit_offset + 7) / 8;
    }

    /// Packs the low `count` bits of `value`, most significant bit first.
    pub fn put_bits(&mut self, count: u32, value: u32) -> Result<(), CodecError> {
        if !(1..=32).contains(&count) {
            return Err(CodecError::BitWidth(count));
        }
        let mut remaining = count as usize;
        let mut byte = self.bit_offset >> 3;
        let mut free = 8 - (self.bit_offset & 7);
        self.bit_offset += remaining;
        self.reserve_to((self.bit_offset + 7) >> 3);

        while remaining > free {
            let chunk = (value >> (remaining - free)) & MASKS[free];
            self.payload[byte] &= !(MASKS[free] as u8);
            self.payload[byte] |= chunk as u8;
            remaining -= free;
            byte += 1;
            free = 8;
        }
        if remaining == free {
            self.payload[byte] &= !(MASKS[free] as u8);
            self.payload[byte] |= (value & MASKS[free]) as u8;
        } else {
            let shift = free - remaining;
            self.payload[byte] &= !((MASKS[remaining] << shift) as u8);
            self.payload[byte] |= ((value & MASKS[remaining]) << shift) as u8;
        }
        Ok(())
    }

    pub fn put_bit(&mut self, flag: bool) -> Result<(), CodecError> {
        self.put_bits(1, flag as u32)
    }

    pub fn get_bits(&mut self, count: u32) -> Result<u32, CodecError> {
        if !(1..=32).contains(&count) {
            return Err(CodecError::BitWidth(count));
        }
        let end = self.bit_offset + count as usize;
        if (end + 7) >> 3 > self.payload.len() {
            return Err(CodecError::BitOverrun {
                bit_offset: self.bit_offset,
                wanted: count,
                len: self.payload.len(),
            });
        }
        let mut remaining = count as usize;
        let mut byte = self.bit_offset >> 3;
        let mut available = 8 - (self.bit_offset & 7);
        let mut value = 0u32;
        self.bit_offset = end;

        while remaining > available {
            let chunk = self.payload[byte] as u32 & MASKS[available];
            value |= chunk << (remaining - available);
            remaining -= available;
            byte += 1;
            available = 8;
        }
        if remaining == available {
            value |= self.payload[byte] as u32 & MASKS[available];
        } else {
            value |= (self.payload[byte] as u32 >> (available - remaining)) & MASKS[remaining];
        }
        Ok(value)
    }

    pub fn get_bit(&mut self) -> Result<bool, CodecError> {
        Ok(self.get_bits(1)? == 1)
    }
}
