//! Packet envelope.

use peerlink_shared::Message;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sender-local packet sequence number.
pub type PacketId = u32;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 32;

/// How a packet is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Sent once, never acknowledged.
    BestEffort = 0,
    /// Retransmitted until acknowledged or expired.
    AtLeastOnce = 1,
    /// Acknowledges an at-least-once packet. Carries no message.
    Ack = 2,
}

impl DeliveryMode {
    /// Looks up a mode by its wire tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::BestEffort),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::Ack),
            _ => None,
        }
    }

    /// Returns true if packets in this mode carry a message.
    #[inline]
    #[must_use]
    pub const fn has_body(self) -> bool {
        !matches!(self, Self::Ack)
    }
}

/// A packet on the wire.
///
/// Timestamps are the sender's wall clock in milliseconds since the UNIX
/// epoch. They are informational only; all timing decisions use the local
/// monotonic clock.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    id: PacketId,
    mode: DeliveryMode,
    ack_of: PacketId,
    ttl_ms: u32,
    first_sent_ms: u64,
    last_sent_ms: u64,
    message: Option<Message>,
}

impl Packet {
    /// Creates a best-effort packet.
    #[must_use]
    pub fn best_effort(id: PacketId, message: Message, now_ms: u64) -> Self {
        Self {
            id,
            mode: DeliveryMode::BestEffort,
            ack_of: 0,
            ttl_ms: 0,
            first_sent_ms: now_ms,
            last_sent_ms: now_ms,
            message: Some(message),
        }
    }

    /// Creates an at-least-once packet that expires after `ttl_ms`.
    #[must_use]
    pub fn reliable(id: PacketId, message: Message, ttl_ms: u32, now_ms: u64) -> Self {
        Self {
            id,
            mode: DeliveryMode::AtLeastOnce,
            ack_of: 0,
            ttl_ms,
            first_sent_ms: now_ms,
            last_sent_ms: now_ms,
            message: Some(message),
        }
    }

    /// Creates an acknowledgement of packet `ack_of`.
    #[must_use]
    pub const fn ack(id: PacketId, ack_of: PacketId, now_ms: u64) -> Self {
        Self {
            id,
            mode: DeliveryMode::Ack,
            ack_of,
            ttl_ms: 0,
            first_sent_ms: now_ms,
            last_sent_ms: now_ms,
            message: None,
        }
    }

    /// Rebuilds a packet from decoded header fields.
    ///
    /// The codec validates mode/body consistency before calling this.
    pub(crate) fn from_parts(
        id: PacketId,
        mode: DeliveryMode,
        ack_of: PacketId,
        ttl_ms: u32,
        sent_ms: (u64, u64),
        message: Option<Message>,
    ) -> Self {
        Self {
            id,
            mode,
            ack_of,
            ttl_ms,
            first_sent_ms: sent_ms.0,
            last_sent_ms: sent_ms.1,
            message,
        }
    }

    /// Records a retransmission at `now_ms`.
    pub fn mark_resent(&mut self, now_ms: u64) {
        self.last_sent_ms = now_ms.max(self.first_sent_ms);
    }

    /// Packet id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> PacketId {
        self.id
    }

    /// Delivery mode.
    #[inline]
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Acknowledged packet id (acks only, zero otherwise).
    #[inline]
    #[must_use]
    pub const fn ack_of(&self) -> PacketId {
        self.ack_of
    }

    /// Time-to-live in milliseconds (at-least-once only, zero otherwise).
    #[inline]
    #[must_use]
    pub const fn ttl_ms(&self) -> u32 {
        self.ttl_ms
    }

    /// Wall-clock time of the first transmission.
    #[inline]
    #[must_use]
    pub const fn first_sent_ms(&self) -> u64 {
        self.first_sent_ms
    }

    /// Wall-clock time of the latest transmission.
    #[inline]
    #[must_use]
    pub const fn last_sent_ms(&self) -> u64 {
        self.last_sent_ms
    }

    /// Carried message, if any.
    #[inline]
    #[must_use]
    pub const fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// Consumes the packet, returning its message.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        self.message
    }
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
#[must_use]
pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}
