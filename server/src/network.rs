//! Server network layer handling TCP connections and game loop coordination

use crate::error::SessionError;
use crate::flusher;
use crate::login::handshake_reply;
use crate::world::World;
use log::{debug, error, info, warn};
use shared::protocol::status;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Bytes read between two ticks are queued here before the tick applies them.
const EVENT_QUEUE: usize = 4096;
const READ_CHUNK: usize = 4096;

/// Messages sent from connection readers to the game loop
#[derive(Debug)]
pub enum NetworkEvent {
    Data {
        slot: usize,
        session_id: u64,
        bytes: Vec<u8>,
    },
    Closed {
        slot: usize,
        session_id: u64,
        error: Option<std::io::Error>,
    },
}

/// The socket side of one admitted connection.
pub struct Link {
    pub session_id: u64,
    pub writer: Arc<Mutex<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The world together with the sockets of its sessions, shared between the
/// game loop and the flusher.
pub struct Hub {
    pub world: World,
    links: HashMap<usize, Link>,
}

impl Hub {
    pub fn new(world: World) -> Self {
        Self {
            world,
            links: HashMap::new(),
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Applies a reader event to the world.
    pub fn apply(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Data {
                slot,
                session_id,
                bytes,
            } => self.world.receive(slot, session_id, &bytes),
            NetworkEvent::Closed {
                slot,
                session_id,
                error,
            } => {
                let err = error.map_or(SessionError::Closed, SessionError::Io);
                self.world.fail_connection(slot, session_id, err);
            }
        }
    }

    /// Pending output paired with the writer it goes to.
    pub fn take_writes(&mut self) -> Vec<flusher::Write> {
        let mut writes = Vec::new();
        for (slot, session_id, bytes) in self.world.drain_output() {
            match self.links.get(&slot).filter(|link| link.session_id == session_id) {
                Some(link) => writes.push(flusher::Write {
                    slot,
                    session_id,
                    bytes,
                    writer: Arc::clone(&link.writer),
                }),
                None => self.world.fail_connection(slot, session_id, SessionError::Closed),
            }
        }
        writes
    }

    /// Drops the sockets of sessions the world has removed.
    pub fn reap(&mut self) {
        for removed in self.world.take_removed() {
            let matches = self
                .links
                .get(&removed.slot)
                .is_some_and(|link| link.session_id == removed.session_id);
            if matches {
                self.links.remove(&removed.slot);
                debug!("Dropped connection for slot {}", removed.slot);
            }
        }
    }
}

/// Main server coordinating networking and game simulation
pub struct Server {
    listener: TcpListener,
    hub: Arc<Mutex<Hub>>,
    tick_duration: Duration,
    flush_interval: Duration,
    write_timeout: Duration,

    // Communication channel from connection readers
    events_tx: mpsc::Sender<NetworkEvent>,
    events_rx: mpsc::Receiver<NetworkEvent>,
}

impl Server {
    pub async fn bind(addr: &str, world: World) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let config = world.config();
        let tick_duration = config.tick_duration();
        let flush_interval = config.flush_interval();
        let write_timeout = config.write_timeout();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        Ok(Server {
            listener,
            hub: Arc::new(Mutex::new(Hub::new(world))),
            tick_duration,
            flush_interval,
            write_timeout,
            events_tx,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Mutex<Hub>> {
        Arc::clone(&self.hub)
    }

    /// Takes a slot for a new connection and starts its reader, or turns it
    /// away with a server-full status.
    async fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set nodelay for {}: {}", addr, e);
        }
        let mut hub = self.hub.lock().await;
        let admitted = hub.world.admit(addr, Instant::now());
        let (slot, session_id) = match admitted {
            Ok(ids) => ids,
            Err(e) => {
                drop(hub);
                warn!("Turning away {}: {}", addr, e);
                tokio::spawn(turn_away(stream, self.write_timeout));
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(reader, slot, session_id, self.events_tx.clone()));
        hub.links.insert(
            slot,
            Link {
                session_id,
                writer: Arc::new(Mutex::new(writer)),
                reader,
            },
        );
    }

    /// Applies queued reader events, runs one world tick and drops the
    /// sockets of removed sessions.
    async fn tick(&mut self) {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }

        let started = Instant::now();
        let mut hub = self.hub.lock().await;
        for event in events {
            hub.apply(event);
        }
        hub.world.tick(started);
        hub.reap();

        let elapsed = started.elapsed();
        if elapsed > self.tick_duration {
            warn!(
                "Tick {} took {:?}, longer than the {:?} tick",
                hub.world.tick_count(),
                elapsed,
                self.tick_duration
            );
        }
    }

    /// Main server loop: accepts connections and runs the tick on schedule
    /// while the flusher writes output in the background.
    pub async fn run(mut self) -> Result<(), std::io::Error> {
        let flusher = tokio::spawn(flusher::run(
            self.hub(),
            self.flush_interval,
            self.write_timeout,
        ));

        let mut ticker = interval(self.tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started with {:?} ticks", self.tick_duration);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.accept(stream, addr).await,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = ticker.tick() => self.tick().await,
            }

            if flusher.is_finished() {
                error!("Flusher stopped, shutting down");
                return Ok(());
            }
        }
    }
}

/// Forwards everything read from a connection to the game loop.
async fn read_loop(
    mut reader: OwnedReadHalf,
    slot: usize,
    session_id: u64,
    events: mpsc::Sender<NetworkEvent>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let event = match reader.read(&mut chunk).await {
            Ok(0) => NetworkEvent::Closed {
                slot,
                session_id,
                error: None,
            },
            Ok(read) => NetworkEvent::Data {
                slot,
                session_id,
                bytes: chunk[..read].to_vec(),
            },
            Err(e) => NetworkEvent::Closed {
                slot,
                session_id,
                error: Some(e),
            },
        };
        let closed = matches!(event, NetworkEvent::Closed { .. });
        if events.send(event).await.is_err() || closed {
            break;
        }
    }
}

/// Reads the handshake of a connection that has no slot and answers it with
/// the server-full status.
async fn turn_away(mut stream: TcpStream, limit: Duration) {
    let result = timeout(limit, async {
        let mut handshake = [0u8; 2];
        stream.read_exact(&mut handshake).await?;
        stream
            .write_all(&handshake_reply(status::SERVER_FULL, None))
            .await?;
        stream.shutdown().await
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to send server-full status: {}", e),
        Err(_) => debug!("Timed out sending server-full status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::spatial::Position;

    fn world(max_clients: usize) -> World {
        let config = ServerConfig {
            max_clients,
            max_npcs: 1,
            tick_ms: 20,
            flush_ms: 5,
            spawn: Position::new(3200, 3200, 0),
            ..ServerConfig::default()
        };
        World::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn test_full_server_turns_away() {
        let server = Server::bind("127.0.0.1:0", world(1)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let hub = server.hub();
        tokio::spawn(server.run());

        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.lock().await.link_count(), 1);

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&[14, 0]).await.unwrap();
        let mut reply = [0u8; 9];
        second.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0, 0, 0, 0, 0, 0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn test_peer_close_frees_slot() {
        let server = Server::bind("127.0.0.1:0", world(4)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let hub = server.hub();
        tokio::spawn(server.run());

        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.lock().await.world.client_count(), 1);

        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let hub = hub.lock().await;
        assert_eq!(hub.world.client_count(), 0);
        assert_eq!(hub.link_count(), 0);
    }
}
