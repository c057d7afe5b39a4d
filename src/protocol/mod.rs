//! Protocol module - Defines the Z21 LAN wire protocol
//!
//! Every datagram carries one or more frames in a simple binary format:
//! - 2 bytes frame length (little-endian, includes this 4-byte header)
//! - 2 bytes command header (little-endian)
//! - Variable length payload
//!
//! Frames with the `LAN_X_BUS` header tunnel an X-BUS sub-message:
//! - 1 byte X-header (command)
//! - 1 byte DB0 (sub-command)
//! - Variable length data bytes
//! - 1 byte XOR checksum over all preceding bytes

mod codec;
pub mod headers;
mod message;
mod xbus;

pub use codec::*;
pub use message::*;
pub use xbus::*;

/// Default UDP port of a Z21 command station
pub const DEFAULT_PORT: u16 = 21105;

/// Highest DCC locomotive address
pub const MAX_LOCO_ADDRESS: u16 = 9999;

/// Highest turnout function address
pub const MAX_TURNOUT_ADDRESS: u16 = 2047;
