//! Music track names, used for the unlock message.

use crate::error::TableError;
use shared::Buffer;

const RECORD_END: u8 = 0;
const RECORD_TRACK: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct MusicTable {
    names: Vec<Option<String>>,
}

impl MusicTable {
    /// Decodes a table: the highest track id, then `(id, name)` records
    /// ending in opcode 0.
    pub fn decode(bytes: Vec<u8>) -> Result<Self, TableError> {
        let mut buffer = Buffer::wrap(bytes);
        let max_id = buffer.get_u16()? as usize;
        let mut names = vec![None; max_id + 1];
        loop {
            let offset = buffer.offset();
            match buffer.get_u8()? {
                RECORD_END => break,
                RECORD_TRACK => {
                    let id = buffer.get_u16()? as usize;
                    let len = buffer.get_u8()? as usize;
                    let name = String::from_utf8_lossy(&buffer.get_bytes(len)?).into_owned();
                    if id >= names.len() {
                        names.resize(id + 1, None);
                    }
                    names[id] = Some(name);
                }
                opcode => return Err(TableError::UnknownRecord { opcode, offset }),
            }
        }
        Ok(Self { names })
    }

    pub fn load(path: &std::path::Path) -> Result<Self, TableError> {
        Self::decode(std::fs::read(path)?)
    }

    pub fn insert(&mut self, id: u16, name: impl Into<String>) {
        let id = id as usize;
        if id >= self.names.len() {
            self.names.resize(id + 1, None);
        }
        self.names[id] = Some(name.into());
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        self.names.get(id as usize)?.as_deref()
    }

    /// Number of track ids the table covers, for sizing unlock bitmaps.
    pub fn track_count(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_names() {
        let mut buffer = Buffer::new();
        buffer.put_u16(80);
        buffer.put_u8(RECORD_TRACK);
        buffer.put_u16(62);
        buffer.put_u8(7);
        buffer.put_bytes(b"Harmony");
        buffer.put_u8(RECORD_END);

        let table = MusicTable::decode(buffer.into_inner()).unwrap();
        assert_eq!(table.name(62), Some("Harmony"));
        assert_eq!(table.name(61), None);
        assert_eq!(table.name(500), None);
        assert_eq!(table.track_count(), 81);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            MusicTable::decode(vec![0, 5, RECORD_TRACK, 0]),
            Err(TableError::Truncated(_))
        ));
        assert!(matches!(
            MusicTable::decode(vec![0, 5, 4]),
            Err(TableError::UnknownRecord { opcode: 4, offset: 2 })
        ));
    }

    #[test]
    fn test_insert_grows() {
        let mut table = MusicTable::default();
        table.insert(3, "Newbie Melody");
        assert_eq!(table.name(3), Some("Newbie Melody"));
        assert_eq!(table.track_count(), 4);
    }
}
