//! Background writer for session output.
//!
//! The tick only appends to per-session buffers. The flusher hands each
//! buffer to its socket on a fixed interval, with every write bounded by a
//! timeout so a stalled peer cannot hold up the others.

use crate::error::SessionError;
use crate::network::Hub;
use log::{debug, error, trace};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Output of one session on its way to the socket.
pub struct Write {
    pub slot: usize,
    pub session_id: u64,
    pub bytes: Vec<u8>,
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
}

#[derive(Debug)]
enum Outcome {
    Written,
    Failed(std::io::Error),
    TimedOut,
}

pub async fn run(hub: Arc<Mutex<Hub>>, every: Duration, write_timeout: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        flush_once(&hub, write_timeout).await;
    }
}

/// Writes all pending output once. Returns the number of sessions written.
pub async fn flush_once(hub: &Mutex<Hub>, write_timeout: Duration) -> usize {
    let writes = hub.lock().await.take_writes();
    if writes.is_empty() {
        return 0;
    }

    let mut tasks = JoinSet::new();
    let mut pending = HashSet::new();
    for write in writes {
        pending.insert((write.slot, write.session_id));
        tasks.spawn(async move {
            let written = timeout(write_timeout, async {
                let mut writer = write.writer.lock().await;
                writer.write_all(&write.bytes).await
            })
            .await;
            let outcome = match written {
                Ok(Ok(())) => Outcome::Written,
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::TimedOut,
            };
            (write.slot, write.session_id, outcome)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => error!("Flush task failed: {}", e),
        }
    }

    let mut hub = hub.lock().await;
    settle(&mut hub, pending, outcomes)
}

/// Applies write outcomes to the world. Sessions whose task never reported
/// back are still marked in flight, so they are closed.
fn settle(hub: &mut Hub, mut pending: HashSet<(usize, u64)>, outcomes: Vec<(usize, u64, Outcome)>) -> usize {
    let mut written = 0;
    for (slot, session_id, outcome) in outcomes {
        pending.remove(&(slot, session_id));
        match outcome {
            Outcome::Written => {
                trace!("Flushed slot {}", slot);
                hub.world.finish_flush(slot, session_id);
                written += 1;
            }
            Outcome::Failed(e) => {
                debug!("Write to slot {} failed: {}", slot, e);
                hub.world.fail_connection(slot, session_id, SessionError::Io(e));
            }
            Outcome::TimedOut => {
                hub.world
                    .fail_connection(slot, session_id, SessionError::Timeout)
            }
        }
    }
    for (slot, session_id) in pending {
        error!("Closing slot {} after its write was lost", slot);
        hub.world.fail_connection(slot, session_id, SessionError::Closed);
    }
    hub.reap();
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ProtocolError;
    use crate::spatial::Position;
    use crate::world::World;
    use std::time::Instant;

    /// A hub holding two sessions with output marked in flight.
    fn hub_in_flight() -> (Hub, Vec<(usize, u64)>) {
        let config = ServerConfig {
            spawn: Position::new(3200, 3200, 0),
            max_clients: 4,
            max_npcs: 4,
            ..ServerConfig::default()
        };
        let mut world = World::from_config(config).unwrap();
        let now = Instant::now();
        let mut sessions = Vec::new();
        for _ in 0..2 {
            let (slot, id) = world.admit("127.0.0.1:40000".parse().unwrap(), now).unwrap();
            world.disconnect(slot, ProtocolError::BadMagic(0).into(), now);
            sessions.push((slot, id));
        }
        assert_eq!(world.drain_output().len(), 2);
        (Hub::new(world), sessions)
    }

    #[test]
    fn test_written_output_clears_in_flight() {
        let (mut hub, sessions) = hub_in_flight();
        let (slot, id) = sessions[0];
        let pending = HashSet::from([(slot, id)]);
        let written = settle(&mut hub, pending, vec![(slot, id, Outcome::Written)]);
        assert_eq!(written, 1);
        assert!(hub.world.session(slot).unwrap().is_drained());
    }

    #[test]
    fn test_lost_write_closes_session() {
        let (mut hub, sessions) = hub_in_flight();
        let pending: HashSet<_> = sessions.iter().copied().collect();
        let (kept, kept_id) = sessions[0];
        let (lost, _) = sessions[1];
        let written = settle(&mut hub, pending, vec![(kept, kept_id, Outcome::Written)]);

        assert_eq!(written, 1);
        assert!(hub.world.session(kept).is_some());
        assert!(hub.world.session(lost).is_none());
        assert_eq!(hub.world.client_count(), 1);
    }

    #[test]
    fn test_timed_out_write_closes_session() {
        let (mut hub, sessions) = hub_in_flight();
        let (slot, id) = sessions[0];
        let pending = HashSet::from([(slot, id)]);
        assert_eq!(settle(&mut hub, pending, vec![(slot, id, Outcome::TimedOut)]), 0);
        assert!(hub.world.session(slot).is_none());
    }
}
