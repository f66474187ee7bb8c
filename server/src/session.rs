//! Per-connection state: buffers, ciphers, login progress and the set of
//! players the client currently renders.

use crate::error::{InvariantViolation, ProtocolError};
use crate::login::{self, BlockDecipher, LoginRequest};
use crate::slots::SlotSet;
use shared::list::{NodeArena, NodeId};
use shared::protocol::{status, INBOUND_CAPACITY, MAX_PLAYERS};
use shared::{Buffer, Frame, FrameDecoder, IsaacCipher};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where a session is in its per-tick pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    AwaitHandshake,
    AwaitLoginBlock,
    Welcome,
    ApplyInput,
    Reindex,
    Broadcast,
    Commit,
    /// Waiting for the flusher to drain the previous tick's output.
    Idle,
    /// A status byte is queued; the connection goes once it is written.
    Closing,
}

impl Stage {
    pub fn is_logged_in(self) -> bool {
        !matches!(
            self,
            Stage::AwaitHandshake | Stage::AwaitLoginBlock | Stage::Closing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub username: String,
    pub name: u64,
    pub uid: u32,
    pub rights: u8,
    pub low_memory: bool,
    pub reconnecting: bool,
}

/// The players a client renders: an active list, the list of players added
/// this tick, and a bitmap mirroring membership of both.
#[derive(Debug)]
pub struct Viewport {
    links: NodeArena<()>,
    active: NodeId,
    added: NodeId,
    known: SlotSet,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new()
    }
}

impl Viewport {
    pub fn new() -> Self {
        let mut links = NodeArena::with_capacity(MAX_PLAYERS + 2);
        for _ in 0..MAX_PLAYERS {
            links.add_node(());
        }
        let active = links.add_list(());
        let added = links.add_list(());
        Self {
            links,
            active,
            added,
            known: SlotSet::new(MAX_PLAYERS),
        }
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.known.contains(slot)
    }

    /// Queues `slot` on the add list. Returns false if it is already known.
    pub fn add(&mut self, slot: usize) -> bool {
        let Some(node) = self.links.node(slot).filter(|_| slot < MAX_PLAYERS) else {
            return false;
        };
        if !self.known.insert(slot) {
            return false;
        }
        self.links.push_back(self.added, node);
        true
    }

    /// Moves everything added this tick onto the end of the active list.
    pub fn promote(&mut self) {
        while let Some(node) = self.links.pop_front(self.added) {
            self.links.push_back(self.active, node);
        }
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(node) = self.links.node(slot).filter(|_| slot < MAX_PLAYERS) {
            self.links.remove(node);
        }
        self.known.remove(slot);
    }

    /// Snapshot of the active list in render order.
    pub fn active(&self) -> Vec<usize> {
        self.links.iter(self.active).map(NodeId::index).collect()
    }

    pub fn active_count(&self) -> usize {
        self.links.count(self.active)
    }

    pub fn known_count(&self) -> usize {
        self.known.count()
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub addr: SocketAddr,
    pub stage: Stage,
    pub profile: Option<Profile>,
    pub viewport: Viewport,
    pub current_track: Option<u16>,
    unlocked_tracks: SlotSet,
    inbound: Vec<u8>,
    outgoing: Buffer,
    in_flight: bool,
    decoder: Option<FrameDecoder>,
    encoder: Option<IsaacCipher>,
    name_hash: u8,
    connected_at: Instant,
    last_ping: Instant,
    closing_since: Option<Instant>,
}

impl Session {
    pub fn new(id: u64, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            stage: Stage::AwaitHandshake,
            profile: None,
            viewport: Viewport::new(),
            current_track: None,
            unlocked_tracks: SlotSet::new(0),
            inbound: Vec::new(),
            outgoing: Buffer::with_capacity(512),
            in_flight: false,
            decoder: None,
            encoder: None,
            name_hash: 0,
            connected_at: now,
            last_ping: now,
            closing_since: None,
        }
    }

    /// Buffers bytes read from the socket until the next tick consumes them.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let pending = self.inbound.len() + bytes.len();
        if pending > INBOUND_CAPACITY {
            return Err(ProtocolError::InboundOverflow(pending));
        }
        self.inbound.extend_from_slice(bytes);
        Ok(())
    }

    pub fn pending_input(&self) -> usize {
        self.inbound.len()
    }

    /// Consumes the handshake if it has fully arrived, replying with the
    /// session key. Returns whether the stage advanced.
    pub fn read_handshake(&mut self) -> Result<bool, ProtocolError> {
        let Some((handshake, used)) = login::read_handshake(&self.inbound)? else {
            return Ok(false);
        };
        self.inbound.drain(..used);
        self.name_hash = handshake.name_hash;
        let key = rand::random::<u64>();
        self.outgoing
            .put_bytes(&login::handshake_reply(status::CONTINUE, Some(key)));
        self.stage = Stage::AwaitLoginBlock;
        Ok(true)
    }

    pub fn read_login(
        &mut self,
        decipher: &dyn BlockDecipher,
    ) -> Result<Option<LoginRequest>, ProtocolError> {
        let Some((request, used)) = login::read_login(&self.inbound, decipher)? else {
            return Ok(None);
        };
        self.inbound.drain(..used);
        Ok(Some(request))
    }

    /// Installs the ciphers and profile of an accepted login and writes the
    /// login reply.
    pub fn establish(&mut self, request: &LoginRequest, rights: u8, tracks: usize) {
        self.decoder = Some(FrameDecoder::new(IsaacCipher::new(&request.seeds)));
        self.encoder = Some(IsaacCipher::outbound(&request.seeds));
        self.profile = Some(Profile {
            username: request.username.clone(),
            name: shared::protocol::encode_base37(&request.username),
            uid: request.uid,
            rights,
            low_memory: request.low_memory,
            reconnecting: request.reconnecting,
        });
        self.unlocked_tracks = SlotSet::new(tracks);
        self.outgoing.put_bytes(&login::login_reply(rights));
        self.stage = Stage::Welcome;
    }

    /// Decodes the next complete frame from the inbound bytes.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, crate::error::SessionError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or(InvariantViolation::NotLoggedIn)?;
        let Some((frame, used)) = decoder.decode(&self.inbound)? else {
            return Ok(None);
        };
        self.inbound.drain(..used);
        Ok(Some(frame))
    }

    /// The outgoing buffer together with the cipher that obfuscates opcodes
    /// written to it.
    pub fn writer(&mut self) -> Result<(&mut Buffer, &mut IsaacCipher), InvariantViolation> {
        let cipher = self.encoder.as_mut().ok_or(InvariantViolation::NotLoggedIn)?;
        Ok((&mut self.outgoing, cipher))
    }

    /// Queues a status byte and marks the session for closing.
    ///
    /// A peer still waiting for its handshake reply gets the full nine-byte
    /// form; during login it expects a single byte.
    pub fn reject(&mut self, code: u8, now: Instant) {
        match self.stage {
            Stage::AwaitHandshake => self
                .outgoing
                .put_bytes(&login::handshake_reply(code, None)),
            Stage::AwaitLoginBlock => self.outgoing.put_u8(code),
            _ => {}
        }
        self.inbound.clear();
        self.stage = Stage::Closing;
        self.closing_since = Some(now);
    }

    pub fn touch_ping(&mut self, now: Instant) {
        self.last_ping = now;
    }

    pub fn timed_out(&self, now: Instant, login_timeout: Duration, ping_timeout: Duration) -> bool {
        match self.stage {
            Stage::Closing => false,
            Stage::AwaitHandshake | Stage::AwaitLoginBlock => {
                now.saturating_duration_since(self.connected_at) > login_timeout
            }
            _ => now.saturating_duration_since(self.last_ping) > ping_timeout,
        }
    }

    /// A closing session can go once its last bytes are written, or once
    /// `grace` has passed without the peer taking them.
    pub fn can_reap(&self, now: Instant, grace: Duration) -> bool {
        self.is_drained()
            || self
                .closing_since
                .is_some_and(|since| now.saturating_duration_since(since) > grace)
    }

    /// Records `track` as unlocked, returning whether it was new.
    pub fn unlock_track(&mut self, track: u16) -> bool {
        self.unlocked_tracks.insert(track as usize)
    }

    pub fn name_hash(&self) -> u8 {
        self.name_hash
    }

    /// Hands the pending output to the flusher. Nothing more is handed out
    /// until [`Session::finish_flush`] confirms the write.
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        if self.in_flight || self.outgoing.is_empty() {
            return None;
        }
        self.in_flight = true;
        Some(self.outgoing.take())
    }

    pub fn finish_flush(&mut self) {
        self.in_flight = false;
    }

    pub fn is_drained(&self) -> bool {
        !self.in_flight && self.outgoing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::login::PlainBlock;
    use client::network::{encode_login, Credentials};

    fn session() -> Session {
        Session::new(1, "127.0.0.1:5000".parse().unwrap(), Instant::now())
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            seeds: [9, 8, 7, 6],
            uid: 1,
            low_memory: false,
            reconnecting: false,
        }
    }

    #[test]
    fn test_viewport_add_promote_remove() {
        let mut viewport = Viewport::new();
        assert!(viewport.add(5));
        assert!(viewport.add(2));
        assert!(!viewport.add(5));
        assert!(!viewport.add(MAX_PLAYERS));
        assert_eq!(viewport.active_count(), 0);
        viewport.promote();
        assert_eq!(viewport.active(), vec![5, 2]);
        viewport.remove(5);
        assert!(!viewport.contains(5));
        assert_eq!(viewport.active(), vec![2]);
        assert_eq!(viewport.known_count(), 1);
    }

    #[test]
    fn test_inbound_capacity() {
        let mut session = session();
        session.receive(&vec![0; INBOUND_CAPACITY]).unwrap();
        assert!(matches!(
            session.receive(&[1]),
            Err(ProtocolError::InboundOverflow(5001))
        ));
    }

    #[test]
    fn test_handshake_then_login() {
        let mut session = session();
        session.receive(&[14, 3]).unwrap();
        assert!(session.read_handshake().unwrap());
        assert_eq!(session.stage, Stage::AwaitLoginBlock);
        assert_eq!(session.name_hash(), 3);

        let bytes = encode_login(&credentials());
        session.receive(&bytes[..10]).unwrap();
        assert_eq!(session.read_login(&PlainBlock).unwrap(), None);
        session.receive(&bytes[10..]).unwrap();
        let request = session.read_login(&PlainBlock).unwrap().unwrap();
        session.establish(&request, 2, 10);

        assert_eq!(session.stage, Stage::Welcome);
        assert_eq!(session.pending_input(), 0);
        let output = session.take_output().unwrap();
        assert_eq!(output.len(), 17 + 3);
        assert_eq!(&output[17..], &[2, 2, 0]);
        assert_eq!(session.profile.as_ref().unwrap().username, "alice");
    }

    #[test]
    fn test_frames_need_login() {
        let mut session = session();
        assert!(session.next_frame().is_err());
        assert!(session.writer().is_err());
    }

    #[test]
    fn test_reject_during_handshake_uses_long_form() {
        let mut session = session();
        session.reject(status::SERVER_FULL, Instant::now());
        assert_eq!(session.stage, Stage::Closing);
        assert_eq!(session.take_output().unwrap(), vec![0, 0, 0, 0, 0, 0, 0, 0, 7]);
        assert!(!session.can_reap(Instant::now(), Duration::from_secs(10)));
        session.finish_flush();
        assert!(session.can_reap(Instant::now(), Duration::from_secs(10)));
    }

    #[test]
    fn test_reject_during_login_is_one_byte() {
        let mut session = session();
        session.receive(&[14, 0]).unwrap();
        session.read_handshake().unwrap();
        session.take_output();
        session.finish_flush();
        session.reject(status::GAME_UPDATED, Instant::now());
        assert_eq!(session.take_output().unwrap(), vec![6]);
    }

    #[test]
    fn test_output_is_handed_out_once() {
        let mut session = session();
        session.receive(&[14, 0]).unwrap();
        session.read_handshake().unwrap();
        assert!(session.take_output().is_some());
        assert!(session.take_output().is_none());
        assert!(!session.is_drained());
        session.finish_flush();
        assert!(session.is_drained());
    }

    #[test]
    fn test_timeouts_depend_on_stage() {
        let start = Instant::now();
        let mut session = Session::new(1, "127.0.0.1:1".parse().unwrap(), start);
        let later = start + Duration::from_secs(6);
        assert!(session.timed_out(later, Duration::from_secs(5), Duration::from_secs(60)));
        session.stage = Stage::ApplyInput;
        assert!(!session.timed_out(later, Duration::from_secs(5), Duration::from_secs(60)));
        session.touch_ping(later);
        assert!(!session.timed_out(
            later + Duration::from_secs(59),
            Duration::from_secs(5),
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn test_tracks_unlock_once() {
        let mut session = session();
        let request = crate::login::read_login(&encode_login(&credentials()), &PlainBlock)
            .unwrap()
            .unwrap()
            .0;
        session.establish(&request, 0, 100);
        assert!(session.unlock_track(62));
        assert!(!session.unlock_track(62));
    }
}
