//! The world context: every entity, the spatial index, connected clients and
//! the tables loaded at startup.
//!
//! Entity ids are shared between the entity table, the spatial index and
//! the client manager. Players occupy ids below [`MAX_PLAYERS`]; NPCs follow
//! at `MAX_PLAYERS + npc_slot`.

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::error::{CapacityError, InvariantViolation, SessionError, SpawnError, TableError};
use crate::login::{BlockDecipher, PlainBlock};
use crate::motion::Motion;
use crate::music::MusicTable;
use crate::session::{Session, Stage};
use crate::slots::SlotPool;
use crate::spatial::{ChunkKey, Position, SpatialIndex};
use crate::updates::{Appearance, UpdateFlags};
use log::{debug, error, info, warn};
use shared::protocol::MAX_PLAYERS;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Npc { type_id: u16 },
}

#[derive(Debug)]
pub struct Entity {
    pub kind: EntityKind,
    pub position: Position,
    /// Chunk the entity is linked into, `None` while unindexed.
    pub chunk: Option<ChunkKey>,
    pub motion: Option<Motion>,
    pub flags: UpdateFlags,
    pub appearance: Appearance,
    /// Base-37 encoded display name.
    pub name: u64,
    pub session: Option<Box<Session>>,
}

impl Entity {
    fn player(position: Position, session: Session) -> Self {
        Self {
            kind: EntityKind::Player,
            position,
            chunk: None,
            motion: Some(Motion::new()),
            flags: UpdateFlags::default(),
            appearance: Appearance::default(),
            name: 0,
            session: Some(Box::new(session)),
        }
    }

    fn npc(type_id: u16, position: Position) -> Self {
        Self {
            kind: EntityKind::Npc { type_id },
            position,
            chunk: None,
            motion: Some(Motion::new()),
            flags: UpdateFlags::default(),
            appearance: Appearance::default(),
            name: 0,
            session: None,
        }
    }

    /// True for players past login that are linked into the spatial index.
    pub fn is_visible_player(&self) -> bool {
        self.kind == EntityKind::Player && self.chunk.is_some()
    }
}

/// A connection the network layer should drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub slot: usize,
    pub session_id: u64,
}

pub struct World {
    pub(crate) config: ServerConfig,
    pub(crate) entities: Vec<Option<Entity>>,
    pub(crate) spatial: SpatialIndex,
    pub(crate) clients: ClientManager,
    pub(crate) npcs: SlotPool,
    pub(crate) music: MusicTable,
    pub(crate) decipher: Box<dyn BlockDecipher>,
    pub(crate) online: HashMap<String, usize>,
    removed: Vec<Removed>,
    next_session_id: u64,
    pub(crate) tick: u64,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.tick)
            .field("clients", &self.clients.len())
            .field("npcs", &self.npcs.in_use())
            .field("regions", &self.spatial.region_count())
            .finish_non_exhaustive()
    }
}

impl World {
    pub fn new(config: ServerConfig, mut spatial: SpatialIndex, music: MusicTable) -> Self {
        spatial.ensure_chunk_at(config.spawn);
        let entities = std::iter::repeat_with(|| None)
            .take(MAX_PLAYERS + config.max_npcs)
            .collect();
        Self {
            clients: ClientManager::new(config.client_capacity()),
            npcs: SlotPool::new(config.max_npcs),
            config,
            entities,
            spatial,
            music,
            decipher: Box::new(PlainBlock),
            online: HashMap::new(),
            removed: Vec::new(),
            next_session_id: 1,
            tick: 0,
        }
    }

    /// Builds the world from the tables named in `config`. Without a region
    /// table the regions around the spawn point are filled in.
    pub fn from_config(config: ServerConfig) -> Result<Self, TableError> {
        let entities = MAX_PLAYERS + config.max_npcs;
        let spatial = match &config.regions {
            Some(path) => SpatialIndex::load(path, entities)?,
            None => {
                let mut spatial = SpatialIndex::new(entities);
                spatial.fill_around(config.spawn, 1);
                spatial
            }
        };
        let music = match &config.music {
            Some(path) => MusicTable::load(path)?,
            None => MusicTable::default(),
        };
        info!(
            "Loaded {} regions and {} music tracks",
            spatial.region_count(),
            music.track_count()
        );
        Ok(Self::new(config, spatial, music))
    }

    pub fn with_decipher(mut self, decipher: Box<dyn BlockDecipher>) -> Self {
        self.decipher = decipher;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn entity(&self, id: usize) -> Option<&Entity> {
        self.entities.get(id)?.as_ref()
    }

    pub fn session(&self, slot: usize) -> Option<&Session> {
        self.entity(slot)?.session.as_deref()
    }

    pub(crate) fn session_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.entities.get_mut(slot)?.as_mut()?.session.as_deref_mut()
    }

    /// Slot of the logged-in player called `username`.
    pub fn find_player(&self, username: &str) -> Option<usize> {
        self.online.get(&username.to_ascii_lowercase()).copied()
    }

    /// Takes a slot for a freshly accepted connection.
    pub fn admit(&mut self, addr: SocketAddr, now: Instant) -> Result<(usize, u64), CapacityError> {
        let slot = self.clients.admit()?;
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let session = Session::new(session_id, addr, now);
        self.entities[slot] = Some(Entity::player(self.config.spawn, session));
        info!("Accepted {} into slot {}", addr, slot);
        Ok((slot, session_id))
    }

    fn live_session(&mut self, slot: usize, session_id: u64) -> Option<&mut Session> {
        self.session_mut(slot).filter(|session| session.id == session_id)
    }

    /// Buffers bytes read from a connection. Bytes for a session that has
    /// already gone are dropped.
    pub fn receive(&mut self, slot: usize, session_id: u64, bytes: &[u8]) {
        let Some(session) = self.live_session(slot, session_id) else {
            return;
        };
        if session.stage == Stage::Closing {
            return;
        }
        if let Err(err) = session.receive(bytes) {
            self.disconnect(slot, err.into(), Instant::now());
        }
    }

    /// Ends a session whose socket failed or was closed by the peer.
    pub fn fail_connection(&mut self, slot: usize, session_id: u64, err: SessionError) {
        if self.live_session(slot, session_id).is_some() {
            self.remove_player(slot, &err);
        }
    }

    /// Disconnects a client because of `err`.
    ///
    /// Failures before login that owe the peer a status byte queue it and
    /// let the session close once the byte is flushed. Everything else
    /// removes the player at once.
    pub fn disconnect(&mut self, slot: usize, err: SessionError, now: Instant) {
        let code = err.status_code();
        let Some(session) = self.session_mut(slot) else {
            return;
        };
        if let (Some(code), false) = (code, session.stage.is_logged_in()) {
            if session.stage != Stage::Closing {
                warn!(
                    "Rejecting slot {} ({}) with status {}: {}",
                    slot, session.addr, code, err
                );
                session.reject(code, now);
                return;
            }
        }
        self.remove_player(slot, &err);
    }

    pub(crate) fn remove_player(&mut self, slot: usize, reason: &SessionError) {
        let Some(mut entity) = self.entities.get_mut(slot).and_then(Option::take) else {
            return;
        };
        self.spatial.unlink(slot, &mut entity.chunk);
        self.clients.release(slot);
        let Some(session) = entity.session else {
            return;
        };
        let username = session.profile.as_ref().map(|profile| profile.username.as_str());
        match reason {
            _ if session.stage == Stage::Closing => {
                debug!("Closed rejected slot {} ({})", slot, session.addr)
            }
            SessionError::Logout => info!(
                "{} logged out from slot {}",
                username.unwrap_or("?"),
                slot
            ),
            SessionError::Invariant(err) => error!(
                "Disconnecting slot {} ({}) after internal fault: {}",
                slot, session.addr, err
            ),
            SessionError::Closed => info!("Slot {} ({}) disconnected", slot, session.addr),
            err => warn!("Disconnecting slot {} ({}): {}", slot, session.addr, err),
        }
        if let Some(name) = username {
            let key = name.to_ascii_lowercase();
            if self.online.get(&key) == Some(&slot) {
                self.online.remove(&key);
            }
        }
        self.removed.push(Removed {
            slot,
            session_id: session.id,
        });
    }

    /// Connections removed since the last call.
    pub fn take_removed(&mut self) -> Vec<Removed> {
        std::mem::take(&mut self.removed)
    }

    /// Collects pending output of every session for the flusher.
    pub fn drain_output(&mut self) -> Vec<(usize, u64, Vec<u8>)> {
        let mut batch = Vec::new();
        for slot in self.clients.slots() {
            if let Some(session) = self.session_mut(slot) {
                if let Some(bytes) = session.take_output() {
                    batch.push((slot, session.id, bytes));
                }
            }
        }
        batch
    }

    pub fn finish_flush(&mut self, slot: usize, session_id: u64) {
        if let Some(session) = self.live_session(slot, session_id) {
            session.finish_flush();
        }
    }

    /// Moves an entity, dropping any path it was walking.
    pub fn teleport(&mut self, id: usize, position: Position) -> Result<(), InvariantViolation> {
        if !self.spatial.is_loaded(position) {
            return Err(InvariantViolation::MissingChunk {
                x: position.x,
                y: position.y,
            });
        }
        let entity = self
            .entities
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(InvariantViolation::VacantSlot(id))?;
        entity.position = position;
        if let Some(motion) = entity.motion.as_mut() {
            motion.teleport();
        }
        Ok(())
    }

    /// Queues a walk for any entity.
    pub fn walk_to(&mut self, id: usize, points: &[(i32, i32)], run: bool) -> bool {
        let Some(motion) = self
            .entities
            .get_mut(id)
            .and_then(Option::as_mut)
            .and_then(|entity| entity.motion.as_mut())
        else {
            return false;
        };
        motion.running = run;
        motion.set_path(points)
    }

    pub fn spawn_npc(&mut self, type_id: u16, position: Position) -> Result<usize, SpawnError> {
        let id = MAX_PLAYERS + self.npcs.acquire()?;
        let mut npc = Entity::npc(type_id, position);
        if let Err(err) = self.spatial.reindex(id, &mut npc.chunk, position) {
            self.npcs.release(id - MAX_PLAYERS);
            return Err(err.into());
        }
        self.entities[id] = Some(npc);
        Ok(id)
    }

    pub fn despawn_npc(&mut self, id: usize) {
        if id < MAX_PLAYERS {
            return;
        }
        if let Some(mut npc) = self.entities.get_mut(id).and_then(Option::take) {
            self.spatial.unlink(id, &mut npc.chunk);
            self.npcs.release(id - MAX_PLAYERS);
        }
    }

    pub fn npc_count(&self) -> usize {
        self.npcs.in_use()
    }

    /// Ids of the entities standing in chunks around `position`.
    pub fn nearby(&self, position: Position, radius: i32) -> Vec<usize> {
        self.spatial.nearby(position, radius).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        let config = ServerConfig {
            spawn: Position::new(3200, 3200, 0),
            max_clients: 4,
            max_npcs: 4,
            ..ServerConfig::default()
        };
        World::from_config(config).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_admit_and_capacity() {
        let mut world = world();
        let now = Instant::now();
        let ids: Vec<_> = (0..4).map(|_| world.admit(addr(), now).unwrap()).collect();
        assert_eq!(ids.iter().map(|(slot, _)| *slot).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(world.admit(addr(), now), Err(CapacityError(4)));
        assert_eq!(world.client_count(), 4);
    }

    #[test]
    fn test_receive_ignores_stale_session() {
        let mut world = world();
        let (slot, id) = world.admit(addr(), Instant::now()).unwrap();
        world.receive(slot, id + 1, &[14, 0]);
        assert_eq!(world.session(slot).unwrap().pending_input(), 0);
        world.receive(slot, id, &[14, 0]);
        assert_eq!(world.session(slot).unwrap().pending_input(), 2);
    }

    #[test]
    fn test_pre_login_failure_rejects_then_closes() {
        let mut world = world();
        let (slot, id) = world.admit(addr(), Instant::now()).unwrap();
        let err = SessionError::from(crate::error::ProtocolError::BadHandshake(1));
        world.disconnect(slot, err, Instant::now());
        assert_eq!(world.session(slot).unwrap().stage, Stage::Closing);
        assert!(world.take_removed().is_empty());

        world.fail_connection(slot, id, SessionError::Closed);
        assert!(world.session(slot).is_none());
        assert_eq!(world.take_removed(), vec![Removed { slot, session_id: id }]);
        assert_eq!(world.client_count(), 0);
    }

    #[test]
    fn test_drain_output_sets_in_flight() {
        let mut world = world();
        let (slot, id) = world.admit(addr(), Instant::now()).unwrap();
        world.disconnect(
            slot,
            crate::error::ProtocolError::BadMagic(0).into(),
            Instant::now(),
        );
        let batch = world.drain_output();
        assert_eq!(batch, vec![(slot, id, vec![0, 0, 0, 0, 0, 0, 0, 0, 10])]);
        assert!(world.drain_output().is_empty());
        world.finish_flush(slot, id);
        assert!(world.session(slot).unwrap().is_drained());
    }

    #[test]
    fn test_npc_spawn_and_despawn() {
        let mut world = world();
        let id = world.spawn_npc(1, Position::new(3201, 3201, 0)).unwrap();
        assert!(id >= MAX_PLAYERS);
        assert!(world.nearby(Position::new(3201, 3201, 0), 0).contains(&id));
        world.despawn_npc(id);
        assert!(world.nearby(Position::new(3201, 3201, 0), 0).is_empty());
        assert_eq!(world.npc_count(), 0);
    }

    #[test]
    fn test_npc_cannot_spawn_off_map() {
        let mut world = world();
        assert_eq!(
            world.spawn_npc(1, Position::new(100, 100, 0)),
            Err(SpawnError::Invariant(InvariantViolation::MissingChunk { x: 100, y: 100 }))
        );
        assert_eq!(world.npc_count(), 0);
    }

    #[test]
    fn test_teleport_requires_loaded_chunk() {
        let mut world = world();
        let (slot, _) = world.admit(addr(), Instant::now()).unwrap();
        assert!(world.teleport(slot, Position::new(3210, 3210, 0)).is_ok());
        assert_eq!(
            world.teleport(slot, Position::new(10, 10, 0)),
            Err(InvariantViolation::MissingChunk { x: 10, y: 10 })
        );
    }
}
