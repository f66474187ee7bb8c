//! Per-entity movement queues.
//!
//! Three fixed rings drive movement: waypoints requested by the client, the
//! per-step directions derived from them, and the packed movement
//! descriptors committed each tick for the update packet.

use crate::error::InvariantViolation;
use crate::spatial::Position;
use shared::Direction;

/// Capacity of every movement ring.
pub const MAX_POINTS: usize = 30;

/// Chunk distance from the view anchor that forces a region refresh.
pub const REFRESH_DISTANCE: i32 = 4;

/// Offset between an entity's chunk and the anchor of the 13x13 chunk view.
pub const ANCHOR_OFFSET: i32 = 6;

/// Number of entries between two cursors of a ring of `capacity` slots.
pub fn ring_distance(read: usize, write: usize, capacity: usize) -> usize {
    (write + capacity - read) % capacity
}

#[derive(Debug, Clone)]
struct Ring<T> {
    slots: [T; MAX_POINTS],
    read: usize,
    write: usize,
}

impl<T: Copy + Default> Ring<T> {
    fn new() -> Self {
        Self {
            slots: [T::default(); MAX_POINTS],
            read: 0,
            write: 0,
        }
    }

    fn depth(&self) -> usize {
        ring_distance(self.read, self.write, MAX_POINTS)
    }

    /// Appends a value, returning false when the ring is full.
    fn push(&mut self, value: T) -> bool {
        if self.depth() == MAX_POINTS - 1 {
            return false;
        }
        self.slots[self.write] = value;
        self.write = (self.write + 1) % MAX_POINTS;
        true
    }

    fn peek(&self) -> Option<T> {
        (self.depth() > 0).then(|| self.slots[self.read])
    }

    fn pop(&mut self) -> Option<T> {
        let value = self.peek()?;
        self.read = (self.read + 1) % MAX_POINTS;
        Some(value)
    }

    fn clear(&mut self) {
        self.read = self.write;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Waypoint {
    x: i32,
    y: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum WalkStep {
    #[default]
    Teleport,
    Step(Direction),
}

/// Movement of one entity during one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Walk(Direction),
    Run(Direction, Direction),
    /// Placement relative to the view anchor. `discard` tells the client to
    /// drop any walking it was still animating.
    Teleport {
        plane: u8,
        local_x: u8,
        local_y: u8,
        discard: bool,
    },
}

impl Movement {
    /// Packs into the descriptor layout kept in the last-updates ring:
    /// a 2-bit type followed by its fields.
    pub fn pack(self) -> u32 {
        match self {
            Movement::Walk(dir) => 1 | dir.code() << 2,
            Movement::Run(first, second) => 2 | first.code() << 2 | second.code() << 5,
            Movement::Teleport {
                plane,
                local_x,
                local_y,
                discard,
            } => {
                3 | (plane as u32 & 3) << 2
                    | (discard as u32) << 4
                    | (local_x as u32 & 0x7F) << 5
                    | (local_y as u32 & 0x7F) << 12
            }
        }
    }

    pub fn unpack(packed: u32) -> Option<Self> {
        match packed & 3 {
            1 => Some(Movement::Walk(Direction::from_code(packed >> 2 & 7)?)),
            2 => Some(Movement::Run(
                Direction::from_code(packed >> 2 & 7)?,
                Direction::from_code(packed >> 5 & 7)?,
            )),
            3 => Some(Movement::Teleport {
                plane: (packed >> 2 & 3) as u8,
                discard: packed >> 4 & 1 == 1,
                local_x: (packed >> 5 & 0x7F) as u8,
                local_y: (packed >> 12 & 0x7F) as u8,
            }),
            _ => None,
        }
    }
}

/// Result of advancing an entity by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Advance {
    /// The view anchor moved; the client needs a fresh set-chunk packet.
    pub anchor_moved: bool,
}

#[derive(Debug, Clone)]
pub struct Motion {
    steps: Ring<Waypoint>,
    walking: Ring<WalkStep>,
    updates: Ring<u32>,
    /// Chunk the client's 13x13 view is anchored on; `None` until placed.
    anchor: Option<(i32, i32)>,
    pub running: bool,
}

impl Default for Motion {
    fn default() -> Self {
        Self::new()
    }
}

impl Motion {
    pub fn new() -> Self {
        Self {
            steps: Ring::new(),
            walking: Ring::new(),
            updates: Ring::new(),
            anchor: None,
            running: false,
        }
    }

    pub fn anchor(&self) -> Option<(i32, i32)> {
        self.anchor
    }

    /// Replaces the current path with `points`, walked in order.
    ///
    /// Returns false, leaving the old path, if the path does not fit.
    pub fn set_path(&mut self, points: &[(i32, i32)]) -> bool {
        if points.len() >= MAX_POINTS {
            return false;
        }
        self.steps.clear();
        for &(x, y) in points {
            self.steps.push(Waypoint { x, y });
        }
        true
    }

    pub fn has_path(&self) -> bool {
        self.steps.depth() > 0
    }

    /// Drops all queued movement and schedules a placement at the entity's
    /// position on the next tick.
    pub fn teleport(&mut self) {
        self.steps.clear();
        self.walking.clear();
        self.walking.push(WalkStep::Teleport);
    }

    fn speed(&self) -> usize {
        if self.running {
            2
        } else {
            1
        }
    }

    /// Turns waypoints into per-step directions for this tick.
    pub fn plan_steps(&mut self, position: Position) {
        let (mut x, mut y) = (position.x, position.y);
        let mut planned = 0;
        while planned < self.speed() {
            let Some(target) = self.steps.peek() else {
                break;
            };
            let Some(direction) = Direction::from_delta(target.x - x, target.y - y) else {
                self.steps.pop();
                continue;
            };
            if !self.walking.push(WalkStep::Step(direction)) {
                break;
            }
            let (dx, dy) = direction.delta();
            x += dx;
            y += dy;
            planned += 1;
        }
    }

    /// Applies this tick's directions to `position` and records the movement
    /// descriptor. When `tracks_view` is set the entity has a client view
    /// anchor that is placed on first use and refreshed when the entity
    /// strays too far from it.
    ///
    /// Fails when earlier descriptors were never committed and the ring has
    /// no room left.
    pub fn advance(&mut self, position: &mut Position, tracks_view: bool) -> Result<Advance, InvariantViolation> {
        let mut advance = Advance::default();
        if tracks_view && self.anchor.is_none() && self.walking.peek() != Some(WalkStep::Teleport) {
            self.walking.clear();
            self.walking.push(WalkStep::Teleport);
        }

        let mut movement = None;
        for _ in 0..self.speed() {
            let Some(step) = self.walking.pop() else {
                break;
            };
            match step {
                WalkStep::Step(direction) => {
                    let (dx, dy) = direction.delta();
                    position.x += dx;
                    position.y += dy;
                    movement = Some(match movement {
                        Some(Movement::Walk(first)) => Movement::Run(first, direction),
                        _ => Movement::Walk(direction),
                    });
                }
                WalkStep::Teleport => {
                    self.walking.clear();
                    movement = Some(if tracks_view {
                        advance.anchor_moved = true;
                        self.place(*position, true)
                    } else {
                        Movement::Teleport {
                            plane: position.plane,
                            local_x: 0,
                            local_y: 0,
                            discard: true,
                        }
                    });
                    break;
                }
            }
        }

        if tracks_view && !advance.anchor_moved {
            if let Some((anchor_x, anchor_y)) = self.anchor {
                let drift_x = anchor_x - (position.chunk_x() - ANCHOR_OFFSET);
                let drift_y = anchor_y - (position.chunk_y() - ANCHOR_OFFSET);
                if drift_x.abs() >= REFRESH_DISTANCE || drift_y.abs() >= REFRESH_DISTANCE {
                    advance.anchor_moved = true;
                    movement = Some(self.place(*position, false));
                }
            }
        }

        if let Some(movement) = movement {
            if !self.updates.push(movement.pack()) {
                return Err(InvariantViolation::MovementBacklog(self.updates.depth()));
            }
        }
        Ok(advance)
    }

    fn place(&mut self, position: Position, discard: bool) -> Movement {
        let anchor = (
            position.chunk_x() - ANCHOR_OFFSET,
            position.chunk_y() - ANCHOR_OFFSET,
        );
        self.anchor = Some(anchor);
        let (local_x, local_y) = self.local(position).unwrap_or_default();
        Movement::Teleport {
            plane: position.plane,
            local_x,
            local_y,
            discard,
        }
    }

    /// Position relative to the view anchor, as the client sees it.
    pub fn local(&self, position: Position) -> Option<(u8, u8)> {
        let (anchor_x, anchor_y) = self.anchor?;
        Some((
            (position.x - anchor_x * 8) as u8,
            (position.y - anchor_y * 8) as u8,
        ))
    }

    /// The uncommitted movement of the current tick, if any.
    pub fn pending(&self) -> Option<Movement> {
        self.updates.peek().and_then(Movement::unpack)
    }

    pub fn has_pending(&self) -> bool {
        self.updates.depth() > 0
    }

    /// Consumes the movement broadcast this tick.
    pub fn commit(&mut self) {
        self.updates.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(position: &mut Position) -> Motion {
        let mut motion = Motion::new();
        motion.advance(position, true).unwrap();
        motion.commit();
        motion
    }

    #[test]
    fn test_ring_distance_wraps() {
        assert_eq!(ring_distance(0, 0, MAX_POINTS), 0);
        assert_eq!(ring_distance(3, 7, MAX_POINTS), 4);
        assert_eq!(ring_distance(28, 2, MAX_POINTS), 4);
        assert_eq!(ring_distance(29, 28, MAX_POINTS), MAX_POINTS - 1);
    }

    #[test]
    fn test_ring_refuses_overflow() {
        let mut ring: Ring<u32> = Ring::new();
        for value in 0..(MAX_POINTS as u32 - 1) {
            assert!(ring.push(value));
        }
        assert!(!ring.push(99));
        assert_eq!(ring.pop(), Some(0));
        assert!(ring.push(99));
    }

    #[test]
    fn test_descriptor_packing() {
        let cases = [
            Movement::Walk(Direction::South),
            Movement::Run(Direction::NorthEast, Direction::West),
            Movement::Teleport {
                plane: 2,
                local_x: 52,
                local_y: 49,
                discard: true,
            },
        ];
        for movement in cases {
            assert_eq!(Movement::unpack(movement.pack()), Some(movement));
        }
        assert_eq!(Movement::Walk(Direction::East).pack(), 1 | 4 << 2);
        assert_eq!(Movement::unpack(0), None);
    }

    #[test]
    fn test_first_tick_places_entity() {
        let mut position = Position::new(3222, 3218, 0);
        let mut motion = Motion::new();
        let advance = motion.advance(&mut position, true).unwrap();
        assert!(advance.anchor_moved);
        assert_eq!(motion.anchor(), Some((402 - 6, 402 - 6)));
        assert_eq!(
            motion.pending(),
            Some(Movement::Teleport {
                plane: 0,
                local_x: 54,
                local_y: 50,
                discard: true,
            })
        );
    }

    #[test]
    fn test_walking_one_step_per_tick() {
        let mut position = Position::new(3200, 3200, 0);
        let mut motion = placed(&mut position);
        assert!(motion.set_path(&[(3203, 3200)]));

        for expected_x in 3201..=3203 {
            motion.plan_steps(position);
            motion.advance(&mut position, true).unwrap();
            assert_eq!(motion.pending(), Some(Movement::Walk(Direction::East)));
            assert_eq!(position.x, expected_x);
            motion.commit();
        }
        motion.plan_steps(position);
        motion.advance(&mut position, true).unwrap();
        assert_eq!(motion.pending(), None);
        assert!(!motion.has_path());
    }

    #[test]
    fn test_running_folds_two_steps() {
        let mut position = Position::new(3200, 3200, 0);
        let mut motion = placed(&mut position);
        motion.running = true;
        motion.set_path(&[(3201, 3201), (3201, 3205)]);
        motion.plan_steps(position);
        motion.advance(&mut position, true).unwrap();
        assert_eq!(
            motion.pending(),
            Some(Movement::Run(Direction::NorthEast, Direction::North))
        );
        assert_eq!(position, Position::new(3201, 3202, 0));
    }

    #[test]
    fn test_diagonal_then_straight() {
        let mut position = Position::new(100, 100, 0);
        let mut motion = Motion::new();
        motion.set_path(&[(103, 101)]);
        let mut directions = Vec::new();
        for _ in 0..3 {
            motion.plan_steps(position);
            motion.advance(&mut position, false).unwrap();
            if let Some(Movement::Walk(direction)) = motion.pending() {
                directions.push(direction);
            }
            motion.commit();
        }
        assert_eq!(
            directions,
            vec![Direction::NorthEast, Direction::East, Direction::East]
        );
        assert_eq!(position, Position::new(103, 101, 0));
    }

    #[test]
    fn test_straying_from_anchor_refreshes_view() {
        let mut position = Position::new(3200, 3200, 0);
        let mut motion = placed(&mut position);
        motion.set_path(&[(3240, 3200)]);
        let mut refreshed_at = None;
        for _ in 0..40 {
            motion.plan_steps(position);
            let advance = motion.advance(&mut position, true).unwrap();
            if advance.anchor_moved {
                refreshed_at = Some(position.x);
                break;
            }
            motion.commit();
        }
        assert_eq!(refreshed_at, Some(3232));
        assert_eq!(motion.anchor(), Some((404 - 6, 400 - 6)));
        assert!(matches!(
            motion.pending(),
            Some(Movement::Teleport { discard: false, local_x: 48, .. })
        ));
    }

    #[test]
    fn test_teleport_drops_path() {
        let mut position = Position::new(3200, 3200, 0);
        let mut motion = placed(&mut position);
        motion.set_path(&[(3210, 3200)]);
        motion.teleport();
        assert!(!motion.has_path());
        position = Position::new(3300, 3300, 1);
        motion.plan_steps(position);
        let advance = motion.advance(&mut position, true).unwrap();
        assert!(advance.anchor_moved);
        assert!(matches!(
            motion.pending(),
            Some(Movement::Teleport { plane: 1, discard: true, .. })
        ));
    }

    #[test]
    fn test_uncommitted_movement_is_reported() {
        let mut position = Position::new(3200, 3200, 0);
        let mut motion = placed(&mut position);
        motion.set_path(&[(3200 + MAX_POINTS as i32, 3200)]);
        for _ in 0..MAX_POINTS - 1 {
            motion.plan_steps(position);
            motion.advance(&mut position, true).unwrap();
        }
        motion.plan_steps(position);
        let before = position;
        assert!(matches!(
            motion.advance(&mut position, true),
            Err(InvariantViolation::MovementBacklog(depth)) if depth == MAX_POINTS - 1
        ));
        assert_eq!(position.x, before.x + 1);

        motion.commit();
        motion.plan_steps(position);
        assert!(motion.advance(&mut position, true).is_ok());
    }

    #[test]
    fn test_path_length_is_bounded() {
        let mut motion = Motion::new();
        let long: Vec<(i32, i32)> = (0..MAX_POINTS as i32).map(|i| (i, 0)).collect();
        assert!(!motion.set_path(&long));
        assert!(motion.set_path(&long[..MAX_POINTS - 1]));
    }
}
