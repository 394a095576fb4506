//! # PEERLINK Shared
//!
//! Types every peer in a session must agree on.
//!
//! ## CRITICAL RULE
//!
//! This crate must NEVER perform I/O. Sockets, threads and timers belong in
//! `peerlink_networking`; anything here is plain data.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod constants;
pub mod entity;
pub mod ids;
pub mod message;

pub use constants::{
    DEFAULT_PORT, DEFAULT_RELIABLE_TTL_MS, MAX_PACKET_SIZE, MASTER_PEER_ID, PEER_TIMEOUT_MS,
    PROTOCOL_VERSION, RETRANSMIT_INTERVAL_MS,
};
pub use entity::EntitySnapshot;
pub use ids::{EntityId, PeerId};
pub use message::{Message, MessageBody, MessageKind, PeerEntry};
