//! # Session & Protocol Constants
//!
//! Defaults shared by every peer.
//!
//! **CRITICAL:** The wire constants are baked into every binary.
//! Peers built with different values cannot talk to each other.

use crate::ids::PeerId;

// =============================================================================
// WIRE FORMAT
// =============================================================================

/// Magic number opening every datagram ("PL" little-endian).
pub const PACKET_MAGIC: u16 = 0x4C50;

/// Wire format revision. Datagrams with any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum packet size (MTU-safe).
pub const MAX_PACKET_SIZE: usize = 1200;

/// Maximum length of a chat line or kick reason, in bytes.
pub const MAX_TEXT_LEN: usize = 512;

/// Maximum number of entries in one peer list.
pub const MAX_PEER_LIST_LEN: usize = 32;

// =============================================================================
// SESSION DEFAULTS
// =============================================================================

/// Default port a hosting peer binds.
pub const DEFAULT_PORT: u16 = 7777;

/// Id the hosting peer gives itself.
pub const MASTER_PEER_ID: PeerId = PeerId(0);

/// Time-to-live of a reliable packet before it is given up on.
pub const DEFAULT_RELIABLE_TTL_MS: u64 = 5_000;

/// Interval between retransmissions of an unacknowledged packet.
pub const RETRANSMIT_INTERVAL_MS: u64 = 500;

/// Silence after which a peer is evicted.
pub const PEER_TIMEOUT_MS: u64 = 15_000;

/// Silence after which a peer is pinged.
pub const PING_IDLE_MS: u64 = 5_000;

/// Minimum gap between two pings to the same peer.
pub const PING_INTERVAL_MS: u64 = 5_000;

/// How long a received packet id is remembered for deduplication.
pub const DEDUP_RETENTION_MS: u64 = 5_000;

/// How often the dedup table is pruned.
pub const DEDUP_PRUNE_INTERVAL_MS: u64 = 5_000;
