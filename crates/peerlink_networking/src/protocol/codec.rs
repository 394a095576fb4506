//! # Packet Codec
//!
//! Encodes a [`Packet`] into a datagram and back.
//!
//! ## Design
//!
//! - Explicit field-by-field layout, no reflection or derived formats
//! - Every read is bounds-checked; corrupt input is an error, never a panic
//! - Exhaustive match over message kinds on both sides

use super::packet::{DeliveryMode, Packet, HEADER_SIZE};
use crate::error::{CodecError, CodecResult};
use peerlink_shared::constants::{MAX_PEER_LIST_LEN, MAX_TEXT_LEN, PACKET_MAGIC};
use peerlink_shared::{
    EntityId, EntitySnapshot, Message, MessageBody, MessageKind, PeerEntry, PeerId,
    MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const ADDR_NONE: u8 = 0;
const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

/// Packet writer with a hard datagram size limit.
pub struct PacketWriter {
    buffer: Vec<u8>,
    limit: usize,
}

impl PacketWriter {
    /// Creates a writer limited to [`MAX_PACKET_SIZE`] bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_PACKET_SIZE)
    }

    /// Creates a writer limited to `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(limit.min(MAX_PACKET_SIZE)),
            limit,
        }
    }

    /// Returns the number of bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if no bytes have been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        if self.buffer.len() + bytes.len() > self.limit {
            return Err(CodecError::Oversized { limit: self.limit });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Writes a single byte.
    #[inline]
    pub fn write_u8(&mut self, value: u8) -> CodecResult<()> {
        self.write_bytes(&[value])
    }

    /// Writes a u16 in little-endian format.
    #[inline]
    pub fn write_u16(&mut self, value: u16) -> CodecResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a u32 in little-endian format.
    #[inline]
    pub fn write_u32(&mut self, value: u32) -> CodecResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a u64 in little-endian format.
    #[inline]
    pub fn write_u64(&mut self, value: u64) -> CodecResult<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a `u16` length prefix followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8], limit: usize) -> CodecResult<()> {
        if bytes.len() > limit {
            return Err(CodecError::FieldTooLong {
                len: bytes.len(),
                limit,
            });
        }
        let len = u16::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong {
            len: bytes.len(),
            limit: usize::from(u16::MAX),
        })?;
        self.write_u16(len)?;
        self.write_bytes(bytes)
    }

    /// Writes a length-prefixed UTF-8 string.
    #[inline]
    pub fn write_str(&mut self, text: &str) -> CodecResult<()> {
        self.write_blob(text.as_bytes(), MAX_TEXT_LEN)
    }

    /// Writes an entity snapshot as ten little-endian `f32`s.
    pub fn write_snapshot(&mut self, snapshot: &EntitySnapshot) -> CodecResult<()> {
        for component in snapshot.to_components() {
            self.write_bytes(&component.to_le_bytes())?;
        }
        Ok(())
    }

    /// Writes an optional socket address with its family tag.
    pub fn write_addr(&mut self, addr: Option<SocketAddr>) -> CodecResult<()> {
        match addr {
            None => self.write_u8(ADDR_NONE),
            Some(SocketAddr::V4(v4)) => {
                self.write_u8(ADDR_V4)?;
                self.write_bytes(&v4.ip().octets())?;
                self.write_u16(v4.port())
            }
            Some(SocketAddr::V6(v6)) => {
                self.write_u8(ADDR_V6)?;
                self.write_bytes(&v6.ip().octets())?;
                self.write_u16(v6.port())
            }
        }
    }

    /// Writes a message: kind tag, sender, then kind fields.
    pub fn write_message(&mut self, message: &Message) -> CodecResult<()> {
        self.write_u8(message.kind().tag())?;
        self.write_u32(message.sender().0)?;

        match message.body() {
            MessageBody::Hello | MessageBody::Ping | MessageBody::Pong => Ok(()),
            MessageBody::PeerId { assigned } => self.write_u32(assigned.0),
            MessageBody::PeerList { peers } => {
                if peers.len() > MAX_PEER_LIST_LEN {
                    return Err(CodecError::FieldTooLong {
                        len: peers.len(),
                        limit: MAX_PEER_LIST_LEN,
                    });
                }
                self.write_u8(peers.len() as u8)?;
                for entry in peers {
                    self.write_u32(entry.id.0)?;
                    self.write_addr(entry.addr)?;
                }
                Ok(())
            }
            MessageBody::PeerTimedOut { peer } => self.write_u32(peer.0),
            MessageBody::Kicked { reason } => self.write_str(reason),
            MessageBody::Chat { text } => self.write_str(text),
            MessageBody::CreateEntity {
                entity,
                entity_kind,
                owner,
                transferable,
                snapshot,
            } => {
                self.write_u32(entity.0)?;
                self.write_u16(*entity_kind)?;
                self.write_u32(owner.0)?;
                self.write_u8(u8::from(*transferable))?;
                self.write_snapshot(snapshot)
            }
            MessageBody::DestroyEntity { entity } | MessageBody::EntityRequestOwner { entity } => {
                self.write_u32(entity.0)
            }
            MessageBody::EntityState { entity, snapshot } => {
                self.write_u32(entity.0)?;
                self.write_snapshot(snapshot)
            }
            MessageBody::EntityEvent {
                entity,
                event,
                payload,
            } => {
                self.write_u32(entity.0)?;
                self.write_u16(*event)?;
                self.write_blob(payload, MAX_PACKET_SIZE)
            }
            MessageBody::EntityOwnerChanged { entity, new_owner } => {
                self.write_u32(entity.0)?;
                self.write_u32(new_owner.0)
            }
        }
    }
}

impl Default for PacketWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds-checked reader over a received datagram.
pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over `data`.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Returns the number of unread bytes.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Reads `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::Truncated(self.position))?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Reads a single byte.
    #[inline]
    pub fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a little-endian u16.
    #[inline]
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Reads a little-endian u32.
    #[inline]
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian u64.
    #[inline]
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Reads a `u16`-prefixed byte string.
    pub fn read_blob(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_u16()?;
        self.read_bytes(usize::from(len))
    }

    /// Reads a `u16`-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let bytes = self.read_blob()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads an entity snapshot.
    pub fn read_snapshot(&mut self) -> CodecResult<EntitySnapshot> {
        let mut components = [0.0f32; EntitySnapshot::COMPONENTS];
        for component in &mut components {
            *component = f32::from_le_bytes(self.read_array()?);
        }
        Ok(EntitySnapshot::from_components(components))
    }

    /// Reads an optional socket address.
    pub fn read_addr(&mut self) -> CodecResult<Option<SocketAddr>> {
        let ip = match self.read_u8()? {
            ADDR_NONE => return Ok(None),
            ADDR_V4 => IpAddr::V4(Ipv4Addr::from(self.read_array::<4>()?)),
            ADDR_V6 => IpAddr::V6(Ipv6Addr::from(self.read_array::<16>()?)),
            other => return Err(CodecError::UnknownAddressTag(other)),
        };
        let port = self.read_u16()?;
        Ok(Some(SocketAddr::new(ip, port)))
    }

    fn read_peer(&mut self) -> CodecResult<PeerId> {
        self.read_u32().map(PeerId)
    }

    fn read_entity(&mut self) -> CodecResult<EntityId> {
        self.read_u32().map(EntityId)
    }

    /// Reads a message: kind tag, sender, then kind fields.
    pub fn read_message(&mut self) -> CodecResult<Message> {
        let tag = self.read_u8()?;
        let kind = MessageKind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
        let sender = self.read_peer()?;

        let body = match kind {
            MessageKind::Hello => MessageBody::Hello,
            MessageKind::Ping => MessageBody::Ping,
            MessageKind::Pong => MessageBody::Pong,
            MessageKind::PeerId => MessageBody::PeerId {
                assigned: self.read_peer()?,
            },
            MessageKind::PeerList => {
                let count = usize::from(self.read_u8()?);
                if count > MAX_PEER_LIST_LEN {
                    return Err(CodecError::FieldTooLong {
                        len: count,
                        limit: MAX_PEER_LIST_LEN,
                    });
                }
                let mut peers = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = self.read_peer()?;
                    let addr = self.read_addr()?;
                    peers.push(PeerEntry { id, addr });
                }
                MessageBody::PeerList { peers }
            }
            MessageKind::PeerTimedOut => MessageBody::PeerTimedOut {
                peer: self.read_peer()?,
            },
            MessageKind::Kicked => MessageBody::Kicked {
                reason: self.read_string()?,
            },
            MessageKind::Chat => MessageBody::Chat {
                text: self.read_string()?,
            },
            MessageKind::CreateEntity => MessageBody::CreateEntity {
                entity: self.read_entity()?,
                entity_kind: self.read_u16()?,
                owner: self.read_peer()?,
                transferable: self.read_u8()? != 0,
                snapshot: self.read_snapshot()?,
            },
            MessageKind::DestroyEntity => MessageBody::DestroyEntity {
                entity: self.read_entity()?,
            },
            MessageKind::EntityState => MessageBody::EntityState {
                entity: self.read_entity()?,
                snapshot: self.read_snapshot()?,
            },
            MessageKind::EntityEvent => MessageBody::EntityEvent {
                entity: self.read_entity()?,
                event: self.read_u16()?,
                payload: self.read_blob()?.to_vec(),
            },
            MessageKind::EntityRequestOwner => MessageBody::EntityRequestOwner {
                entity: self.read_entity()?,
            },
            MessageKind::EntityOwnerChanged => MessageBody::EntityOwnerChanged {
                entity: self.read_entity()?,
                new_owner: self.read_peer()?,
            },
        };

        Ok(Message::new(sender, body))
    }
}

/// Encodes a packet into a datagram.
///
/// # Errors
///
/// Returns [`CodecError::Oversized`] if the result would exceed
/// [`MAX_PACKET_SIZE`], or [`CodecError::FieldTooLong`] for oversized text,
/// payloads or peer lists.
pub fn encode(packet: &Packet) -> CodecResult<Vec<u8>> {
    let mut writer = PacketWriter::new();
    writer.write_u16(PACKET_MAGIC)?;
    writer.write_u8(PROTOCOL_VERSION)?;
    writer.write_u8(packet.mode() as u8)?;
    writer.write_u32(packet.id())?;
    writer.write_u32(packet.ack_of())?;
    writer.write_u32(packet.ttl_ms())?;
    writer.write_u64(packet.first_sent_ms())?;
    writer.write_u64(packet.last_sent_ms())?;
    debug_assert_eq!(writer.len(), HEADER_SIZE);

    match (packet.mode().has_body(), packet.message()) {
        (true, Some(message)) => writer.write_message(message)?,
        (false, None) => {}
        _ => {
            return Err(CodecError::BodyMismatch {
                mode: packet.mode() as u8,
            })
        }
    }

    Ok(writer.into_bytes())
}

/// Decodes a datagram into a packet.
///
/// # Errors
///
/// Any malformed input yields a [`CodecError`]; the caller drops the datagram.
pub fn decode(bytes: &[u8]) -> CodecResult<Packet> {
    let mut reader = PacketReader::new(bytes);

    let magic = reader.read_u16()?;
    if magic != PACKET_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let version = reader.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mode_tag = reader.read_u8()?;
    let mode = DeliveryMode::from_tag(mode_tag).ok_or(CodecError::UnknownMode(mode_tag))?;
    let id = reader.read_u32()?;
    let ack_of = reader.read_u32()?;
    let ttl_ms = reader.read_u32()?;
    let first_sent_ms = reader.read_u64()?;
    let last_sent_ms = reader.read_u64()?;

    let message = if mode.has_body() {
        if reader.remaining() == 0 {
            return Err(CodecError::BodyMismatch { mode: mode_tag });
        }
        Some(reader.read_message()?)
    } else {
        None
    };

    if reader.remaining() > 0 {
        if mode.has_body() {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        return Err(CodecError::BodyMismatch { mode: mode_tag });
    }

    Ok(Packet::from_parts(
        id,
        mode,
        ack_of,
        ttl_ms,
        (first_sent_ms, last_sent_ms),
        message,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(sender: u32, text: &str) -> Message {
        Message::new(
            PeerId(sender),
            MessageBody::Chat {
                text: text.to_string(),
            },
        )
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::reliable(0x0102_0304, chat(1, ""), 5_000, 77);
        let bytes = encode(&packet).unwrap();

        assert_eq!(&bytes[0..2], &PACKET_MAGIC.to_le_bytes());
        assert_eq!(bytes[2], PROTOCOL_VERSION);
        assert_eq!(bytes[3], DeliveryMode::AtLeastOnce as u8);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &5_000u32.to_le_bytes());
        assert_eq!(bytes[HEADER_SIZE], MessageKind::Chat.tag());
    }

    #[test]
    fn test_ack_is_header_only() {
        let bytes = encode(&Packet::ack(9, 4, 0)).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.mode(), DeliveryMode::Ack);
        assert_eq!(decoded.ack_of(), 4);
    }

    #[test]
    fn test_peer_list_with_self_reference() {
        let peers = vec![
            PeerEntry {
                id: PeerId(0),
                addr: None,
            },
            PeerEntry {
                id: PeerId(1),
                addr: Some("10.0.0.2:4000".parse().unwrap()),
            },
            PeerEntry {
                id: PeerId(2),
                addr: Some("[::1]:5000".parse().unwrap()),
            },
        ];
        let message = Message::new(PeerId(0), MessageBody::PeerList { peers: peers.clone() });
        let packet = Packet::reliable(1, message, 5_000, 0);

        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        match decoded.message().map(Message::body) {
            Some(MessageBody::PeerList { peers: got }) => assert_eq!(got, &peers),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_entity_event_payload() {
        let message = Message::new(
            PeerId(3),
            MessageBody::EntityEvent {
                entity: EntityId(12),
                event: 7,
                payload: vec![1, 2, 3, 255],
            },
        );
        let packet = Packet::best_effort(5, message.clone(), 0);
        let decoded = decode(&encode(&packet).unwrap()).unwrap();
        assert_eq!(decoded.message(), Some(&message));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = encode(&Packet::ack(1, 1, 0)).unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(decode(&bytes), Err(CodecError::BadMagic(_))));
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = encode(&Packet::best_effort(1, chat(0, "hello"), 0)).unwrap();
        for cut in [0, 1, HEADER_SIZE - 1, bytes.len() - 1] {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut bytes = encode(&Packet::best_effort(1, chat(0, ""), 0)).unwrap();
        bytes[HEADER_SIZE] = 200;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownKind(200)));
    }

    #[test]
    fn test_rejects_ack_with_body() {
        let mut bytes = encode(&Packet::best_effort(1, chat(0, "x"), 0)).unwrap();
        bytes[3] = DeliveryMode::Ack as u8;
        assert!(matches!(decode(&bytes), Err(CodecError::BodyMismatch { .. })));
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        let mut bytes = encode(&Packet::best_effort(1, chat(0, "ab"), 0)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 0xFF;
        assert_eq!(decode(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_rejects_oversized_text() {
        let long = "x".repeat(MAX_TEXT_LEN + 1);
        let result = encode(&Packet::best_effort(1, chat(0, &long), 0));
        assert!(matches!(result, Err(CodecError::FieldTooLong { .. })));
    }

    #[test]
    fn test_rejects_oversized_packet() {
        let message = Message::new(
            PeerId(0),
            MessageBody::EntityEvent {
                entity: EntityId(1),
                event: 0,
                payload: vec![0; MAX_PACKET_SIZE],
            },
        );
        let result = encode(&Packet::best_effort(1, message, 0));
        assert!(matches!(result, Err(CodecError::Oversized { .. })));
    }
}
