//! # Bot Client Library
//!
//! A headless client for the tick server. It speaks the full client side of
//! the protocol and keeps a decoded view of the players around it, which
//! makes it useful both as a load generator and as the reference decoder in
//! tests.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Everything that touches bytes on the wire:
//! - Handshake and login with an unenciphered login block
//! - Opcode obfuscation with the session's ISAAC ciphers
//! - Walk, chat, command, ping and logout packets
//! - Reassembly of server frames split across reads
//!
//! ### Game Module (`game`)
//! The client-side world view:
//! - Map anchor and local player position
//! - Rendered player list, kept in server order
//! - Update block parsing (names, chat, animations)
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::network::{Bot, Credentials};
//! use tokio::net::TcpStream;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:43594").await?;
//! let mut bot = Bot::login(stream, &Credentials::new("bot1", "secret")).await?;
//! bot.wait_updates(1).await?;
//! println!("standing at {:?}", bot.view.position());
//! # Ok(())
//! # }
//! ```

pub mod game;
pub mod network;
