//! The tick pipeline.
//!
//! Every tick walks all connected clients through the same phases, each
//! phase finishing for every client before the next starts:
//!
//! 1. input: handshake, login, welcome and inbound packets
//! 2. reindex: movement and spatial index updates, players then NPCs
//! 3. broadcast: one player update packet per logged-in client
//! 4. commit: consumed movement and update flags are cleared
//!
//! A failure while processing one client disconnects that client and
//! nothing else.

use crate::error::{InvariantViolation, ProtocolError, SessionError};
use crate::music::MusicTable;
use crate::packets::{self, Inbound};
use crate::session::{Session, Stage};
use crate::spatial::{Position, Reindexed, PLANE_COUNT};
use crate::sync;
use crate::updates::{Animation, ChatMessage, Graphic, UpdateFlags};
use crate::world::{Entity, World};
use log::{debug, error, info};
use shared::protocol::MAX_PLAYERS;
use std::time::Instant;

fn entity_at(entities: &mut [Option<Entity>], slot: usize) -> Result<&mut Entity, InvariantViolation> {
    entities
        .get_mut(slot)
        .and_then(Option::as_mut)
        .ok_or(InvariantViolation::VacantSlot(slot))
}

/// Something a command asked for that needs the whole world.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Followup {
    Teleport(Position),
}

/// Applies a `::command` typed by a player.
fn run_command(flags: &mut UpdateFlags, position: Position, command: &str) -> Option<Followup> {
    let mut words = command.split_whitespace();
    let name = words.next()?;
    let args: Vec<i32> = words.clone().filter_map(|word| word.parse().ok()).collect();
    match (name, args.as_slice()) {
        ("tele", [x, y]) => Some(Followup::Teleport(Position::new(*x, *y, position.plane))),
        ("tele", [x, y, plane]) => match u8::try_from(*plane) {
            Ok(plane) if plane < PLANE_COUNT => Some(Followup::Teleport(Position::new(*x, *y, plane))),
            _ => {
                debug!("Ignoring teleport to plane {}", plane);
                None
            }
        },
        ("anim", [id]) => {
            match u16::try_from(*id) {
                Ok(id) => flags.set_animation(Animation { id, delay: 0 }),
                Err(_) => debug!("Ignoring animation {}", id),
            }
            None
        }
        ("gfx", [id]) => {
            match u16::try_from(*id) {
                Ok(id) => flags.set_graphic(Graphic {
                    id,
                    height: 100,
                    delay: 0,
                }),
                Err(_) => debug!("Ignoring graphic {}", id),
            }
            None
        }
        ("say", _) => {
            let text: Vec<&str> = words.collect();
            flags.set_forced_chat(text.join(" "));
            None
        }
        _ => None,
    }
}

/// Sends the track change and, once per track, the unlock message.
fn enter_track(session: &mut Session, music: &MusicTable, track: u16) -> Result<(), SessionError> {
    if session.profile.as_ref().is_some_and(|profile| profile.low_memory) {
        return Ok(());
    }
    let changed = session.current_track != Some(track);
    session.current_track = Some(track);
    let unlocked = session.unlock_track(track);
    let (out, cipher) = session.writer()?;
    if changed {
        packets::play_music(out, cipher, track)?;
    }
    if let (true, Some(name)) = (unlocked, music.name(track)) {
        packets::message(
            out,
            cipher,
            &format!("You have unlocked the music track: {name}."),
        )?;
    }
    Ok(())
}

impl World {
    /// Runs one tick over every client and NPC.
    pub fn tick(&mut self, now: Instant) {
        self.tick += 1;

        let mut ready = Vec::new();
        for slot in self.clients.slots() {
            match self.process_input(slot, now) {
                Ok(true) => ready.push(slot),
                Ok(false) => {}
                Err(err) => self.disconnect(slot, err, now),
            }
        }

        for slot in ready {
            if let Err(err) = self.reindex_player(slot) {
                self.disconnect(slot, err, now);
            }
        }
        self.move_npcs();

        for entity in self.entities.iter_mut().flatten() {
            if entity.is_visible_player() {
                entity.flags.prepare(entity.name, &entity.appearance);
            }
        }
        for slot in self.clients.slots() {
            if let Err(err) = self.broadcast(slot) {
                self.disconnect(slot, err, now);
            }
        }

        for entity in self.entities.iter_mut().flatten() {
            if let Some(motion) = entity.motion.as_mut() {
                motion.commit();
            }
            entity.flags.clear();
            if let Some(session) = entity.session.as_deref_mut() {
                if session.stage == Stage::Commit {
                    session.stage = Stage::Idle;
                }
            }
        }
        self.clients.recycle();
        self.npcs.recycle();
    }

    /// Advances a session through its pre-game stages and reads its input.
    /// Returns whether the client takes part in the rest of this tick.
    fn process_input(&mut self, slot: usize, now: Instant) -> Result<bool, SessionError> {
        let login_timeout = self.config.login_timeout();
        let ping_timeout = self.config.ping_timeout();
        let entity = entity_at(&mut self.entities, slot)?;
        let session = entity
            .session
            .as_deref_mut()
            .ok_or(InvariantViolation::MissingSession(slot))?;

        if session.stage == Stage::Closing {
            if session.can_reap(now, self.config.write_timeout()) {
                self.remove_player(slot, &SessionError::Closed);
            }
            return Ok(false);
        }
        if session.timed_out(now, login_timeout, ping_timeout) {
            return Err(SessionError::Timeout);
        }

        if session.stage == Stage::AwaitHandshake && !session.read_handshake()? {
            return Ok(false);
        }
        if session.stage == Stage::AwaitLoginBlock {
            let Some(request) = session.read_login(&*self.decipher)? else {
                return Ok(false);
            };
            let key = request.username.to_ascii_lowercase();
            if self.online.contains_key(&key) {
                return Err(ProtocolError::AlreadyOnline(request.username).into());
            }
            session.establish(&request, self.config.default_rights, self.music.track_count());
            session.touch_ping(now);
            entity.name = shared::protocol::encode_base37(&request.username);
            self.online.insert(key, slot);
            info!(
                "{} logged in to slot {} from {}",
                request.username, slot, session.addr
            );
        }
        if session.stage == Stage::Welcome {
            let (out, cipher) = session.writer()?;
            packets::message(out, cipher, &self.config.welcome_message)?;
            entity.position = self.config.spawn;
            entity.flags.flag_appearance();
            if let Some(motion) = entity.motion.as_mut() {
                motion.teleport();
            }
            session.stage = Stage::ApplyInput;
        }
        if session.stage != Stage::ApplyInput {
            if !session.is_drained() {
                return Ok(false);
            }
            session.stage = Stage::ApplyInput;
        }

        let mut followups = Vec::new();
        while let Some(frame) = session.next_frame()? {
            match Inbound::decode(&frame)? {
                Inbound::Ping => session.touch_ping(now),
                Inbound::Chat { effects, text } => {
                    let rights = session.profile.as_ref().map_or(0, |profile| profile.rights);
                    entity.flags.set_chat(ChatMessage {
                        effects,
                        rights,
                        text,
                    });
                }
                Inbound::Command(command) => {
                    debug!("Slot {} command: {}", slot, command);
                    followups.extend(run_command(&mut entity.flags, entity.position, &command));
                }
                Inbound::Walk { points, run } => {
                    if let Some(motion) = entity.motion.as_mut() {
                        motion.running = run;
                        if !motion.set_path(&points) {
                            return Err(ProtocolError::PathTooLong(points.len()).into());
                        }
                    }
                }
                Inbound::Logout => return Err(SessionError::Logout),
                Inbound::Ignored(opcode) => debug!("Slot {} sent unhandled opcode {}", slot, opcode),
            }
        }
        session.stage = Stage::Reindex;

        for followup in followups {
            match followup {
                Followup::Teleport(position) => {
                    if let Err(err) = self.teleport(slot, position) {
                        debug!("Slot {} cannot teleport: {}", slot, err);
                    }
                }
            }
        }
        Ok(true)
    }

    fn reindex_player(&mut self, slot: usize) -> Result<(), SessionError> {
        let entity = entity_at(&mut self.entities, slot)?;
        let session = entity
            .session
            .as_deref_mut()
            .ok_or(InvariantViolation::MissingSession(slot))?;
        let motion = entity
            .motion
            .as_mut()
            .ok_or(InvariantViolation::VacantSlot(slot))?;

        motion.plan_steps(entity.position);
        let advance = motion.advance(&mut entity.position, true)?;
        if advance.anchor_moved {
            if let Some(anchor) = motion.anchor() {
                let (out, cipher) = session.writer()?;
                packets::set_chunk(out, cipher, anchor)?;
            }
        }

        match self.spatial.reindex(slot, &mut entity.chunk, entity.position)? {
            Reindexed::Region(track) => {
                debug!("Slot {} entered region at {:?}", slot, entity.position);
                if let Some(track) = track {
                    enter_track(session, &self.music, track)?;
                }
            }
            Reindexed::Chunk | Reindexed::Unchanged => {}
        }
        session.stage = Stage::Broadcast;
        Ok(())
    }

    fn move_npcs(&mut self) {
        let mut lost = Vec::new();
        for (id, slot) in self.entities.iter_mut().enumerate().skip(MAX_PLAYERS) {
            let Some(npc) = slot.as_mut() else {
                continue;
            };
            let Some(motion) = npc.motion.as_mut() else {
                continue;
            };
            motion.plan_steps(npc.position);
            if let Err(err) = motion.advance(&mut npc.position, false) {
                error!("Despawning npc {}: {}", id, err);
                lost.push(id);
                continue;
            }
            if let Err(err) = self.spatial.reindex(id, &mut npc.chunk, npc.position) {
                error!("Despawning npc {}: {}", id, err);
                lost.push(id);
            }
        }
        for id in lost {
            self.despawn_npc(id);
        }
    }

    fn broadcast(&mut self, slot: usize) -> Result<(), SessionError> {
        let entity = entity_at(&mut self.entities, slot)?;
        if !entity.is_visible_player() {
            return Ok(());
        }
        let mut session = entity
            .session
            .take()
            .ok_or(InvariantViolation::MissingSession(slot))?;
        let result = sync::write_player_update(
            slot,
            &mut session,
            &self.entities,
            &self.spatial,
            self.config.view_radius,
        );
        if session.stage == Stage::Broadcast {
            session.stage = Stage::Commit;
        }
        entity_at(&mut self.entities, slot)?.session = Some(session);
        let summary = result?;
        if summary.added + summary.removed > 0 {
            debug!(
                "Slot {} view: {} kept, {} added, {} removed",
                slot, summary.kept, summary.added, summary.removed
            );
        }
        Ok(())
    }
}
