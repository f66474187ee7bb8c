//! # Tick Server Library
//!
//! This library provides an authoritative, tick-based multiplayer server
//! speaking a binary TCP protocol. Clients log in through a handshake,
//! send walk, chat and command packets, and receive one player update
//! packet per tick describing everyone they can see.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! The world advances in fixed ticks. Positions, movement and view state are
//! decided on the server only; clients render what the update packets say.
//!
//! ### Session Lifecycle
//! Every connection moves through the same stages:
//! - Handshake and login, answered with a status byte
//! - A welcome stage that places the player in the world
//! - Input, reindex, broadcast and commit once per tick
//! - Rejection or removal, which frees the slot a tick later
//!
//! ### Incremental Visibility
//! Each session keeps the ordered list of players its client renders.
//! Update packets only describe changes to that list, so both sides stay
//! in step as long as every packet is delivered in order.
//!
//! ## Architecture Design
//!
//! ### Single Owner of World State
//! All world state lives in one [`world::World`] value. The tick takes it
//! by `&mut` and runs its phases in order, so no phase observes another
//! half done.
//!
//! ### Socket Tasks at the Edges
//! One reader task per connection forwards raw bytes to a bounded queue the
//! tick drains. A separate flusher writes the output the tick produced,
//! each write bounded by a timeout.
//!
//! ### Failure Isolation
//! Anything a single connection does wrong becomes an
//! [`error::SessionError`] that disconnects that connection only.
//!
//! ## Module Organization
//!
//! ### Session Modules (`session`, `login`, `client_manager`)
//! Connection state, the login exchange and slot allocation.
//!
//! ### World Modules (`world`, `spatial`, `motion`, `music`)
//! Entities, the chunk index, walking queues and region music.
//!
//! ### Update Modules (`game`, `sync`, `updates`, `packets`)
//! The tick pipeline and everything it writes to clients.
//!
//! ### I/O Modules (`network`, `flusher`, `config`)
//! Sockets, the background writer and configuration.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::world::World;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let addr = config.bind_addr();
//!     let world = World::from_config(config)?;
//!
//!     // Accepts connections and runs a tick every 600ms until an error
//!     let server = Server::bind(&addr, world).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod error;
pub mod flusher;
pub mod game;
pub mod login;
pub mod motion;
pub mod music;
pub mod network;
pub mod packets;
pub mod session;
pub mod slots;
pub mod spatial;
pub mod sync;
pub mod updates;
pub mod world;
