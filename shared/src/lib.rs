//! Wire-level building blocks shared by the server and the client bot.
//!
//! - [`buffer`]: byte and bit cursors with the protocol's integer transforms
//! - [`isaac`]: the keystream that obfuscates opcodes
//! - [`list`]: arena-backed intrusive lists
//! - [`protocol`]: constants, the opcode size table and frame codecs

pub mod buffer;
pub mod isaac;
pub mod list;
pub mod protocol;

pub use buffer::{Buffer, CodecError};
pub use isaac::IsaacCipher;
pub use list::{NodeArena, NodeId};
pub use protocol::{Direction, Frame, FrameDecoder, FrameError, PacketSize};
