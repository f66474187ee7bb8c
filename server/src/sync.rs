//! Player update packet: per observer, per tick, the diff between what the
//! client renders and what is around it.
//!
//! The packet is a bit-packed header followed by the update blocks of every
//! player flagged in it, in the order the header flags them: the observer
//! first, then active players in list order, then players added this tick.

use crate::error::{InvariantViolation, SessionError};
use crate::motion::Movement;
use crate::session::Session;
use crate::spatial::{Position, SpatialIndex};
use crate::updates::write_block;
use crate::world::Entity;
use shared::protocol::{encode_frame, outgoing, ADD_TERMINATOR, MAX_ACTIVE, MAX_PLAYERS};
use shared::{Buffer, CodecError, PacketSize};

/// Largest coordinate delta the 5-bit add fields can carry.
pub const VIEW_DISTANCE: i32 = 15;

const MOVE_NONE: u32 = 0;
const MOVE_WALK: u32 = 1;
const MOVE_RUN: u32 = 2;
const MOVE_TELEPORT: u32 = 3;
const REMOVE: u32 = 3;

/// What one observer's packet contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub kept: usize,
    pub added: usize,
    pub removed: usize,
}

fn within_view(observer: Position, other: Position) -> bool {
    observer.plane == other.plane
        && (other.x - observer.x).abs() <= VIEW_DISTANCE
        && (other.y - observer.y).abs() <= VIEW_DISTANCE
}

fn pending_movement(entity: &Entity) -> Option<Movement> {
    entity.motion.as_ref().and_then(|motion| motion.pending())
}

fn write_local(bits: &mut Buffer, entity: &Entity) -> Result<bool, CodecError> {
    let flagged = entity.flags.is_pending();
    match pending_movement(entity) {
        Some(Movement::Teleport {
            plane,
            local_x,
            local_y,
            discard,
        }) => {
            bits.put_bit(true)?;
            bits.put_bits(2, MOVE_TELEPORT)?;
            bits.put_bits(2, plane as u32)?;
            bits.put_bit(discard)?;
            bits.put_bit(flagged)?;
            bits.put_bits(7, local_y as u32)?;
            bits.put_bits(7, local_x as u32)?;
        }
        movement => write_step(bits, movement, flagged)?,
    }
    Ok(flagged)
}

/// Movement of a player the client already renders. Teleports never get
/// here; they are sent as a removal and a fresh add.
fn write_step(bits: &mut Buffer, movement: Option<Movement>, flagged: bool) -> Result<(), CodecError> {
    match movement {
        Some(Movement::Walk(direction)) => {
            bits.put_bit(true)?;
            bits.put_bits(2, MOVE_WALK)?;
            bits.put_bits(3, direction.code())?;
            bits.put_bit(flagged)?;
        }
        Some(Movement::Run(first, second)) => {
            bits.put_bit(true)?;
            bits.put_bits(2, MOVE_RUN)?;
            bits.put_bits(3, first.code())?;
            bits.put_bits(3, second.code())?;
            bits.put_bit(flagged)?;
        }
        _ if flagged => {
            bits.put_bit(true)?;
            bits.put_bits(2, MOVE_NONE)?;
        }
        _ => bits.put_bit(false)?,
    }
    Ok(())
}

/// Appends the player update packet for `observer` to its session output.
///
/// `entities` must hold the observer's entity at index `observer`, with its
/// session taken out and passed separately.
pub fn write_player_update(
    observer: usize,
    session: &mut Session,
    entities: &[Option<Entity>],
    spatial: &SpatialIndex,
    view_radius: i32,
) -> Result<SyncSummary, SessionError> {
    let me = entities
        .get(observer)
        .and_then(Option::as_ref)
        .ok_or(InvariantViolation::VacantSlot(observer))?;
    let mut summary = SyncSummary::default();
    let mut bits = Buffer::with_capacity(256);
    let mut blocks = Buffer::with_capacity(256);

    bits.begin_bit_mode();
    if write_local(&mut bits, me)? {
        write_block(&mut blocks, me.flags.block(false));
    }

    let active = session.viewport.active();
    bits.put_bits(8, active.len() as u32)?;
    let mut dropped = Vec::new();
    for other in active {
        let entity = entities
            .get(other)
            .and_then(Option::as_ref)
            .filter(|entity| entity.is_visible_player());
        let movement = entity.and_then(pending_movement);
        let stays = entity.is_some_and(|entity| within_view(me.position, entity.position))
            && !matches!(movement, Some(Movement::Teleport { .. }));
        match entity {
            Some(entity) if stays => {
                let flagged = entity.flags.is_pending();
                write_step(&mut bits, movement, flagged)?;
                if flagged {
                    write_block(&mut blocks, entity.flags.block(false));
                }
                summary.kept += 1;
            }
            _ => {
                bits.put_bit(true)?;
                bits.put_bits(2, REMOVE)?;
                session.viewport.remove(other);
                dropped.push(other);
                summary.removed += 1;
            }
        }
    }

    let mut room = MAX_ACTIVE.saturating_sub(summary.kept);
    for other in spatial.nearby(me.position, view_radius) {
        if room == 0 {
            break;
        }
        if other == observer
            || other >= MAX_PLAYERS
            || session.viewport.contains(other)
            || dropped.contains(&other)
        {
            continue;
        }
        let Some(entity) = entities.get(other).and_then(Option::as_ref) else {
            continue;
        };
        if !entity.is_visible_player() || !within_view(me.position, entity.position) {
            continue;
        }
        session.viewport.add(other);
        bits.put_bits(11, other as u32)?;
        bits.put_bit(true)?;
        bits.put_bit(true)?;
        bits.put_bits(5, (entity.position.y - me.position.y) as u32 & 31)?;
        bits.put_bits(5, (entity.position.x - me.position.x) as u32 & 31)?;
        write_block(&mut blocks, entity.flags.block(true));
        summary.added += 1;
        room -= 1;
    }
    session.viewport.promote();

    bits.put_bits(11, ADD_TERMINATOR)?;
    bits.end_bit_mode();
    bits.put_bytes(blocks.as_bytes());

    let (out, cipher) = session.writer()?;
    encode_frame(out, cipher, outgoing::PLAYER_UPDATE, PacketSize::VarShort, bits.as_bytes())?;
    Ok(summary)
}
