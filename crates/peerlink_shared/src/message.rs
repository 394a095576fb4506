//! # Session Messages
//!
//! The closed set of application-level messages exchanged by peers.
//!
//! A [`Message`] pairs the id of the peer that produced it with a
//! [`MessageBody`]. Both are immutable once constructed; the session stamps
//! the sender when it builds an outgoing message.

use crate::entity::EntitySnapshot;
use crate::ids::{EntityId, PeerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Message kind identifier.
///
/// The discriminant is the kind tag on the wire.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Joiner announces itself.
    Hello = 0,
    /// Master assigns the joiner its id.
    PeerId = 1,
    /// Master lists every known peer.
    PeerList = 2,
    /// Liveness probe.
    Ping = 3,
    /// Liveness probe answer.
    Pong = 4,
    /// A peer was evicted for silence.
    PeerTimedOut = 5,
    /// Receiver has been removed from the session.
    Kicked = 6,
    /// Text line.
    Chat = 7,
    /// A shared entity was created.
    CreateEntity = 8,
    /// A shared entity was destroyed.
    DestroyEntity = 9,
    /// Kinematic state of an entity.
    EntityState = 10,
    /// Application-defined entity event.
    EntityEvent = 11,
    /// Request to take ownership of an entity.
    EntityRequestOwner = 12,
    /// Ownership of an entity moved.
    EntityOwnerChanged = 13,
}

impl MessageKind {
    /// Every kind, in tag order.
    pub const ALL: [Self; 14] = [
        Self::Hello,
        Self::PeerId,
        Self::PeerList,
        Self::Ping,
        Self::Pong,
        Self::PeerTimedOut,
        Self::Kicked,
        Self::Chat,
        Self::CreateEntity,
        Self::DestroyEntity,
        Self::EntityState,
        Self::EntityEvent,
        Self::EntityRequestOwner,
        Self::EntityOwnerChanged,
    ];

    /// Looks up a kind by its wire tag.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    /// Wire tag of this kind.
    #[inline]
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// One entry of a PEER_LIST.
///
/// The master lists itself with no address; the joiner already knows it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    /// Peer id.
    pub id: PeerId,
    /// Address the master sees the peer at.
    pub addr: Option<SocketAddr>,
}

/// Kind-specific message payload.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    /// Join request, or mesh introduction from a freshly joined peer.
    Hello,
    /// Id allocated to the joiner.
    PeerId {
        /// The joiner's new id.
        assigned: PeerId,
    },
    /// Current session membership.
    PeerList {
        /// Known peers, master included.
        peers: Vec<PeerEntry>,
    },
    /// Liveness probe.
    Ping,
    /// Liveness probe answer.
    Pong,
    /// `peer` went silent and was evicted.
    PeerTimedOut {
        /// The evicted peer.
        peer: PeerId,
    },
    /// The receiver is no longer part of the session.
    Kicked {
        /// Human-readable reason.
        reason: String,
    },
    /// Chat line.
    Chat {
        /// UTF-8 text.
        text: String,
    },
    /// Entity creation.
    CreateEntity {
        /// New entity.
        entity: EntityId,
        /// Application-defined entity type.
        entity_kind: u16,
        /// Initial owner.
        owner: PeerId,
        /// Whether ownership migrates when the owner leaves.
        transferable: bool,
        /// Initial state.
        snapshot: EntitySnapshot,
    },
    /// Entity removal.
    DestroyEntity {
        /// Removed entity.
        entity: EntityId,
    },
    /// Entity state broadcast by its owner.
    EntityState {
        /// Entity.
        entity: EntityId,
        /// Current state.
        snapshot: EntitySnapshot,
    },
    /// Entity event broadcast by its owner.
    EntityEvent {
        /// Entity.
        entity: EntityId,
        /// Application-defined event code.
        event: u16,
        /// Opaque event payload.
        payload: Vec<u8>,
    },
    /// Sender wants ownership of `entity`.
    EntityRequestOwner {
        /// Requested entity.
        entity: EntityId,
    },
    /// Ownership of `entity` moved to `new_owner`.
    EntityOwnerChanged {
        /// Entity.
        entity: EntityId,
        /// Owner from now on.
        new_owner: PeerId,
    },
}

impl MessageBody {
    /// Returns the kind of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Hello => MessageKind::Hello,
            Self::PeerId { .. } => MessageKind::PeerId,
            Self::PeerList { .. } => MessageKind::PeerList,
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::PeerTimedOut { .. } => MessageKind::PeerTimedOut,
            Self::Kicked { .. } => MessageKind::Kicked,
            Self::Chat { .. } => MessageKind::Chat,
            Self::CreateEntity { .. } => MessageKind::CreateEntity,
            Self::DestroyEntity { .. } => MessageKind::DestroyEntity,
            Self::EntityState { .. } => MessageKind::EntityState,
            Self::EntityEvent { .. } => MessageKind::EntityEvent,
            Self::EntityRequestOwner { .. } => MessageKind::EntityRequestOwner,
            Self::EntityOwnerChanged { .. } => MessageKind::EntityOwnerChanged,
        }
    }

    /// Returns the entity this body refers to, if any.
    #[must_use]
    pub const fn entity(&self) -> Option<EntityId> {
        match self {
            Self::CreateEntity { entity, .. }
            | Self::DestroyEntity { entity }
            | Self::EntityState { entity, .. }
            | Self::EntityEvent { entity, .. }
            | Self::EntityRequestOwner { entity }
            | Self::EntityOwnerChanged { entity, .. } => Some(*entity),
            Self::Hello
            | Self::PeerId { .. }
            | Self::PeerList { .. }
            | Self::Ping
            | Self::Pong
            | Self::PeerTimedOut { .. }
            | Self::Kicked { .. }
            | Self::Chat { .. } => None,
        }
    }
}

/// A message and the peer that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    sender: PeerId,
    body: MessageBody,
}

impl Message {
    /// Creates a message stamped with `sender`.
    #[must_use]
    pub const fn new(sender: PeerId, body: MessageBody) -> Self {
        Self { sender, body }
    }

    /// Peer that produced the message.
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> PeerId {
        self.sender
    }

    /// Payload.
    #[inline]
    #[must_use]
    pub const fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Kind of the payload.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Consumes the message, returning its payload.
    #[must_use]
    pub fn into_body(self) -> MessageBody {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_dense() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(usize::from(kind.tag()), index);
            assert_eq!(MessageKind::from_tag(kind.tag()), Some(*kind));
        }
        assert_eq!(MessageKind::from_tag(14), None);
    }

    #[test]
    fn test_body_kind() {
        let body = MessageBody::EntityOwnerChanged {
            entity: EntityId(3),
            new_owner: PeerId(1),
        };
        assert_eq!(body.kind(), MessageKind::EntityOwnerChanged);
        assert_eq!(body.entity(), Some(EntityId(3)));
        assert_eq!(MessageBody::Ping.entity(), None);
    }

    #[test]
    fn test_message_keeps_sender() {
        let message = Message::new(
            PeerId(2),
            MessageBody::Chat {
                text: "hi".to_string(),
            },
        );
        assert_eq!(message.sender(), PeerId(2));
        assert_eq!(message.kind(), MessageKind::Chat);
    }
}
