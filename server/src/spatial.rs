//! Region and chunk index over world coordinates.
//!
//! The world is split into 64x64 regions, each an 8x8 grid of 8x8 chunks.
//! Every loaded chunk owns a list of the entities standing in it. Entity ids
//! double as node handles in the index's arena, so moving an entity between
//! chunks is a single O(1) relink.

use crate::error::{InvariantViolation, TableError};
use serde::{Deserialize, Serialize};
use shared::list::{NodeArena, NodeId};
use shared::Buffer;
use std::collections::HashMap;

/// Regions per axis. Coordinates at or above `REGIONS * 64` are off the map.
pub const REGIONS: i32 = 256;
pub const CHUNKS_PER_REGION: i32 = 8;

const RECORD_END: u8 = 0;
const RECORD_REGIONS: u8 = 1;
const RECORD_TRACK: u8 = 2;

pub const PLANE_COUNT: u8 = 4;

/// A tile position on one of the four planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub plane: u8,
}

impl Position {
    pub const fn new(x: i32, y: i32, plane: u8) -> Self {
        Self { x, y, plane }
    }

    pub fn chunk_x(&self) -> i32 {
        self.x >> 3
    }

    pub fn chunk_y(&self) -> i32 {
        self.y >> 3
    }
}

/// Region hash `rx << 8 | ry` and chunk hash `cx << 3 | cy` of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub region: u16,
    pub chunk: u8,
}

impl ChunkKey {
    /// Key for the chunk at absolute chunk coordinates.
    pub fn from_chunk(chunk_x: i32, chunk_y: i32) -> Option<Self> {
        let limit = REGIONS * CHUNKS_PER_REGION;
        if !(0..limit).contains(&chunk_x) || !(0..limit).contains(&chunk_y) {
            return None;
        }
        Some(Self {
            region: ((chunk_x >> 3) << 8 | (chunk_y >> 3)) as u16,
            chunk: ((chunk_x & 7) << 3 | (chunk_y & 7)) as u8,
        })
    }

    pub fn of(position: Position) -> Option<Self> {
        Self::from_chunk(position.chunk_x(), position.chunk_y())
    }

    pub fn region_x(&self) -> i32 {
        (self.region >> 8) as i32
    }

    pub fn region_y(&self) -> i32 {
        (self.region & 0xFF) as i32
    }
}

/// What a call to [`SpatialIndex::reindex`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reindexed {
    Unchanged,
    Chunk,
    /// The entity entered another region, carrying that region's track.
    Region(Option<u16>),
}

#[derive(Debug)]
struct Region {
    chunks: [Option<NodeId>; 64],
    track: Option<u16>,
}

impl Default for Region {
    fn default() -> Self {
        Self {
            chunks: [None; 64],
            track: None,
        }
    }
}

#[derive(Debug)]
pub struct SpatialIndex {
    links: NodeArena<()>,
    regions: HashMap<u16, Region>,
    entities: usize,
}

impl SpatialIndex {
    /// An empty world able to index `entities` entity ids.
    pub fn new(entities: usize) -> Self {
        let mut links = NodeArena::with_capacity(entities);
        for _ in 0..entities {
            links.add_node(());
        }
        Self {
            links,
            regions: HashMap::new(),
            entities,
        }
    }

    /// Decodes a region table: a stream of records ending in opcode 0.
    pub fn decode(bytes: Vec<u8>, entities: usize) -> Result<Self, TableError> {
        let mut index = Self::new(entities);
        let mut buffer = Buffer::wrap(bytes);
        loop {
            let offset = buffer.offset();
            match buffer.get_u8()? {
                RECORD_END => break,
                RECORD_REGIONS => {
                    let region_x = buffer.get_u8()? as i32;
                    let count = buffer.get_u8()?;
                    for _ in 0..count {
                        let region_y = buffer.get_u8()? as i32;
                        index.add_region(region_x, region_y);
                        if buffer.get_u8()? == 0 {
                            continue;
                        }
                        let chunks = buffer.get_u8()?;
                        for _ in 0..chunks {
                            let chunk = buffer.get_u8()?;
                            if chunk >> 6 != 0 {
                                return Err(TableError::BadChunk(chunk));
                            }
                            index.add_chunk(
                                region_x * 8 + (chunk >> 3) as i32,
                                region_y * 8 + (chunk & 7) as i32,
                            );
                        }
                    }
                }
                RECORD_TRACK => {
                    let region_x = buffer.get_u8()? as i32;
                    let region_y = buffer.get_u8()? as i32;
                    let track = buffer.get_u16()?;
                    index.set_track(region_x, region_y, track);
                }
                opcode => return Err(TableError::UnknownRecord { opcode, offset }),
            }
        }
        Ok(index)
    }

    pub fn load(path: &std::path::Path, entities: usize) -> Result<Self, TableError> {
        Self::decode(std::fs::read(path)?, entities)
    }

    pub fn add_region(&mut self, region_x: i32, region_y: i32) {
        if let Some(key) = ChunkKey::from_chunk(region_x * 8, region_y * 8) {
            self.regions.entry(key.region).or_default();
        }
    }

    /// Loads the chunk at absolute chunk coordinates, creating its region.
    pub fn add_chunk(&mut self, chunk_x: i32, chunk_y: i32) {
        let Some(key) = ChunkKey::from_chunk(chunk_x, chunk_y) else {
            return;
        };
        let region = self.regions.entry(key.region).or_default();
        if region.chunks[key.chunk as usize].is_none() {
            region.chunks[key.chunk as usize] = Some(self.links.add_list(()));
        }
    }

    pub fn set_track(&mut self, region_x: i32, region_y: i32, track: u16) {
        if let Some(key) = ChunkKey::from_chunk(region_x * 8, region_y * 8) {
            self.regions.entry(key.region).or_default().track = Some(track);
        }
    }

    pub fn ensure_chunk_at(&mut self, position: Position) {
        self.add_chunk(position.chunk_x(), position.chunk_y());
    }

    /// Loads every chunk of the regions within `radius` regions of `center`.
    pub fn fill_around(&mut self, center: Position, radius: i32) {
        let (region_x, region_y) = (center.x >> 6, center.y >> 6);
        for rx in region_x - radius..=region_x + radius {
            for ry in region_y - radius..=region_y + radius {
                for cx in 0..CHUNKS_PER_REGION {
                    for cy in 0..CHUNKS_PER_REGION {
                        self.add_chunk(rx * 8 + cx, ry * 8 + cy);
                    }
                }
            }
        }
    }

    fn chunk_list(&self, key: ChunkKey) -> Option<NodeId> {
        self.regions.get(&key.region)?.chunks[key.chunk as usize]
    }

    pub fn is_loaded(&self, position: Position) -> bool {
        ChunkKey::of(position).and_then(|key| self.chunk_list(key)).is_some()
    }

    pub fn track_at(&self, position: Position) -> Option<u16> {
        self.regions.get(&ChunkKey::of(position)?.region)?.track
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn entity_node(&self, entity: usize) -> Result<NodeId, InvariantViolation> {
        if entity >= self.entities {
            return Err(InvariantViolation::VacantSlot(entity));
        }
        self.links
            .node(entity)
            .ok_or(InvariantViolation::VacantSlot(entity))
    }

    /// Moves `entity` into the chunk list for `position` if it changed chunk.
    pub fn reindex(
        &mut self,
        entity: usize,
        cache: &mut Option<ChunkKey>,
        position: Position,
    ) -> Result<Reindexed, InvariantViolation> {
        let missing = InvariantViolation::MissingChunk {
            x: position.x,
            y: position.y,
        };
        let key = ChunkKey::of(position).ok_or_else(|| missing.clone())?;
        if *cache == Some(key) {
            return Ok(Reindexed::Unchanged);
        }
        let list = self.chunk_list(key).ok_or(missing)?;
        let node = self.entity_node(entity)?;
        self.links.push_back(list, node);

        let previous = cache.replace(key);
        if previous.map(|old| old.region) == Some(key.region) {
            return Ok(Reindexed::Chunk);
        }
        let track = self.regions.get(&key.region).and_then(|region| region.track);
        Ok(Reindexed::Region(track))
    }

    pub fn unlink(&mut self, entity: usize, cache: &mut Option<ChunkKey>) {
        if let Ok(node) = self.entity_node(entity) {
            self.links.remove(node);
        }
        *cache = None;
    }

    /// Entity ids standing in the chunks within `radius` chunks of `center`.
    pub fn nearby(&self, center: Position, radius: i32) -> impl Iterator<Item = usize> + '_ {
        let (cx, cy) = (center.chunk_x(), center.chunk_y());
        (cx - radius..=cx + radius)
            .flat_map(move |x| (cy - radius..=cy + radius).map(move |y| (x, y)))
            .filter_map(move |(x, y)| self.chunk_list(ChunkKey::from_chunk(x, y)?))
            .flat_map(move |list| self.links.iter(list).map(NodeId::index))
    }

    pub fn members_at(&self, position: Position) -> Vec<usize> {
        ChunkKey::of(position)
            .and_then(|key| self.chunk_list(key))
            .map(|list| self.links.iter(list).map(NodeId::index).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(records: impl FnOnce(&mut Buffer)) -> Vec<u8> {
        let mut buffer = Buffer::new();
        records(&mut buffer);
        buffer.put_u8(RECORD_END);
        buffer.into_inner()
    }

    #[test]
    fn test_chunk_key_hashes() {
        let key = ChunkKey::of(Position::new(3222, 3218, 0)).unwrap();
        assert_eq!(key.region, (50 << 8 | 50) as u16);
        assert_eq!(key.chunk, ((402 & 7) << 3 | (402 & 7)) as u8);
        assert_eq!(key.region_x(), 50);
        assert!(ChunkKey::of(Position::new(-1, 0, 0)).is_none());
        assert!(ChunkKey::of(Position::new(16384, 0, 0)).is_none());
    }

    #[test]
    fn test_relinks_only_on_chunk_change() {
        let mut index = SpatialIndex::new(4);
        index.fill_around(Position::new(3200, 3200, 0), 1);
        let mut cache = None;

        let first = index.reindex(1, &mut cache, Position::new(3200, 3200, 0)).unwrap();
        assert_eq!(first, Reindexed::Region(None));
        let same = index.reindex(1, &mut cache, Position::new(3207, 3201, 0)).unwrap();
        assert_eq!(same, Reindexed::Unchanged);
        let moved = index.reindex(1, &mut cache, Position::new(3208, 3201, 0)).unwrap();
        assert_eq!(moved, Reindexed::Chunk);

        assert!(index.members_at(Position::new(3200, 3200, 0)).is_empty());
        assert_eq!(index.members_at(Position::new(3208, 3200, 0)), vec![1]);
    }

    #[test]
    fn test_region_change_reports_track() {
        let mut index = SpatialIndex::new(2);
        index.fill_around(Position::new(3200, 3200, 0), 1);
        index.set_track(50, 51, 76);
        let mut cache = None;
        index.reindex(0, &mut cache, Position::new(3200, 3263, 0)).unwrap();
        let crossed = index.reindex(0, &mut cache, Position::new(3200, 3264, 0)).unwrap();
        assert_eq!(crossed, Reindexed::Region(Some(76)));
    }

    #[test]
    fn test_missing_chunk_is_invariant_violation() {
        let mut index = SpatialIndex::new(2);
        index.add_chunk(400, 400);
        let mut cache = None;
        index.reindex(0, &mut cache, Position::new(3200, 3200, 0)).unwrap();
        let err = index.reindex(0, &mut cache, Position::new(3208, 3200, 0));
        assert_eq!(err, Err(InvariantViolation::MissingChunk { x: 3208, y: 3200 }));
        assert_eq!(index.members_at(Position::new(3200, 3200, 0)), vec![0]);
    }

    #[test]
    fn test_unlink_clears_cache() {
        let mut index = SpatialIndex::new(2);
        index.ensure_chunk_at(Position::new(10, 10, 0));
        let mut cache = None;
        index.reindex(1, &mut cache, Position::new(10, 10, 0)).unwrap();
        index.unlink(1, &mut cache);
        assert_eq!(cache, None);
        assert!(index.members_at(Position::new(10, 10, 0)).is_empty());
        index.unlink(1, &mut cache);
    }

    #[test]
    fn test_nearby_covers_radius() {
        let mut index = SpatialIndex::new(3);
        index.fill_around(Position::new(3200, 3200, 0), 1);
        let (mut a, mut b, mut c) = (None, None, None);
        index.reindex(0, &mut a, Position::new(3200, 3200, 0)).unwrap();
        index.reindex(1, &mut b, Position::new(3216, 3216, 0)).unwrap();
        index.reindex(2, &mut c, Position::new(3224, 3200, 0)).unwrap();

        let mut seen: Vec<usize> = index.nearby(Position::new(3200, 3200, 0), 2).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_decode_region_table() {
        let bytes = table(|b| {
            b.put_u8(RECORD_REGIONS);
            b.put_u8(50);
            b.put_u8(2);
            b.put_u8(50);
            b.put_u8(1);
            b.put_u8(2);
            b.put_u8(0);
            b.put_u8(3 << 3 | 4);
            b.put_u8(51);
            b.put_u8(0);
            b.put_u8(RECORD_TRACK);
            b.put_u8(50);
            b.put_u8(50);
            b.put_u16(62);
        });
        let index = SpatialIndex::decode(bytes, 1).unwrap();
        assert_eq!(index.region_count(), 2);
        assert!(index.is_loaded(Position::new(3200, 3200, 0)));
        assert!(index.is_loaded(Position::new(3200 + 24, 3200 + 32, 0)));
        assert!(!index.is_loaded(Position::new(3208, 3200, 0)));
        assert!(!index.is_loaded(Position::new(3200, 3264, 0)));
        assert_eq!(index.track_at(Position::new(3263, 3263, 0)), Some(62));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            SpatialIndex::decode(vec![9], 1),
            Err(TableError::UnknownRecord { opcode: 9, offset: 0 })
        ));
        assert!(matches!(
            SpatialIndex::decode(vec![RECORD_REGIONS, 50], 1),
            Err(TableError::Truncated(_))
        ));
        assert!(matches!(
            SpatialIndex::decode(vec![RECORD_REGIONS, 1, 1, 1, 1, 1, 0xFF, 0], 1),
            Err(TableError::BadChunk(0xFF))
        ));
    }
}
