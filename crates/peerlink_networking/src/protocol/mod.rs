//! # Wire Protocol
//!
//! Packet envelope and its binary encoding.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Magic (2) │ Ver (1) │ Mode (1) │ Id (4) │ AckOf (4) │ TTL (4)│
//! │ FirstSent (8) │ LastSent (8)                                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Body (absent for acks)                                       │
//! │ Kind (1) │ Sender (4) │ kind fields, length-prefixed         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Variable-length fields carry a `u16`
//! length prefix (`u8` count for peer lists).

mod codec;
mod packet;

pub use codec::{decode, encode, PacketReader, PacketWriter};
pub use packet::{wall_clock_ms, DeliveryMode, Packet, PacketId, HEADER_SIZE};
