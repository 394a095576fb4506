//! Built-in message handling: join handshake, membership and entity records.
//!
//! Runs before application handlers. Returning false from
//! [`Session::handle_builtin`] keeps the message away from them.

use super::{Session, SessionState};
use crate::peer::Peer;
use peerlink_shared::{EntityId, Message, MessageBody, PeerEntry, PeerId};
use std::net::SocketAddr;
use std::time::Instant;

impl Session {
    /// Applies the session's own reaction to `message`.
    ///
    /// Returns true if the message should be dispatched to its handler.
    pub(super) fn handle_builtin(&mut self, message: &Message, from: SocketAddr, now: Instant) -> bool {
        let sender = message.sender();
        match message.body() {
            MessageBody::Hello => self.on_hello(sender, from, now),
            MessageBody::PeerId { assigned } => self.on_peer_id(sender, *assigned, now),
            MessageBody::PeerList { peers } => self.on_peer_list(peers.clone(), now),
            MessageBody::Ping => {
                if let Err(e) = self.core.send_raw(from, MessageBody::Pong, false, now) {
                    tracing::warn!("PONG to {} failed: {}", from, e);
                }
            }
            MessageBody::PeerTimedOut { peer } => self.on_peer_timed_out(sender, *peer, now),
            MessageBody::Kicked { reason } => {
                tracing::info!("Kicked by {}: {}", sender, reason);
                self.callbacks.on_disconnect(&format!("Kicked: {reason}"));
                self.teardown();
                return false;
            }
            MessageBody::Pong | MessageBody::Chat { .. } => {}
            MessageBody::CreateEntity {
                entity,
                owner,
                transferable,
                ..
            } => {
                self.core.ownership.register(*entity, *owner, *transferable);
            }
            MessageBody::DestroyEntity { entity } => {
                if !self.sent_by_owner(*entity, sender) {
                    return false;
                }
                self.core.ownership.forget(*entity);
            }
            MessageBody::EntityState { entity, .. } | MessageBody::EntityEvent { entity, .. } => {
                if !self.sent_by_owner(*entity, sender) {
                    tracing::debug!("Dropped {:?} for {} from non-owner {}", message.kind(), entity, sender);
                    return false;
                }
            }
            MessageBody::EntityRequestOwner { entity } => self.on_ownership_request(*entity, sender, now),
            MessageBody::EntityOwnerChanged { entity, new_owner } => {
                let local = self.core.local_id;
                if !self.core.ownership.apply_owner_change(*entity, *new_owner, local) {
                    tracing::debug!("Owner change for unknown {}", entity);
                }
            }
        }
        self.core.state != SessionState::Disconnected
    }

    fn sent_by_owner(&self, entity: EntityId, sender: PeerId) -> bool {
        self.core.ownership.owner_of(entity) == Some(sender)
    }

    // =========================================================================
    // JOIN HANDSHAKE
    // =========================================================================

    fn on_hello(&mut self, sender: PeerId, from: SocketAddr, now: Instant) {
        if sender.is_unassigned() {
            if self.core.is_master() && self.core.state == SessionState::Connected {
                self.admit(from, now);
            }
            return;
        }

        if self.core.directory.contains(sender) || sender == self.core.local_id {
            return;
        }
        self.core.directory.insert(Peer::new(sender, from, now));
        tracing::info!("{} introduced itself from {}", sender, from);
    }

    /// Master side of a join: assign an id and describe the mesh.
    fn admit(&mut self, from: SocketAddr, now: Instant) {
        if self.core.directory.find_by_addr(from).is_some() {
            tracing::debug!("Ignoring repeated HELLO from {}", from);
            return;
        }

        let assigned = self.core.allocate_peer_id();
        let peers: Vec<PeerEntry> = self
            .core
            .directory
            .iter()
            .map(|peer| PeerEntry {
                id: peer.id,
                addr: Some(peer.addr),
            })
            .chain(std::iter::once(PeerEntry {
                id: self.core.local_id,
                addr: None,
            }))
            .collect();
        self.core.directory.insert(Peer::new(assigned, from, now));
        tracing::info!("Admitted {} from {}", assigned, from);

        if let Err(e) = self.core.send_raw(from, MessageBody::PeerId { assigned }, true, now) {
            tracing::warn!("PEER_ID to {} failed: {}", from, e);
        }
        if let Err(e) = self.core.send_raw(from, MessageBody::PeerList { peers }, true, now) {
            tracing::warn!("PEER_LIST to {} failed: {}", from, e);
        }
    }

    fn on_peer_id(&mut self, sender: PeerId, assigned: PeerId, now: Instant) {
        if self.core.state != SessionState::AwaitingConnection || !self.core.local_id.is_unassigned() {
            return;
        }

        self.core.local_id = assigned;
        if sender != self.core.master_id {
            self.core.directory.rekey(self.core.master_id, sender);
            self.core.master_id = sender;
        }
        tracing::info!("Assigned {} by master {}", assigned, sender);

        if let Some(peers) = self.core.stashed_peer_list.take() {
            self.on_peer_list(peers, now);
        }
    }

    fn on_peer_list(&mut self, peers: Vec<PeerEntry>, now: Instant) {
        if self.core.state != SessionState::AwaitingConnection {
            return;
        }
        if self.core.local_id.is_unassigned() {
            tracing::debug!("PEER_LIST arrived before PEER_ID; holding it");
            self.core.stashed_peer_list = Some(peers);
            return;
        }

        for entry in peers {
            if entry.id == self.core.master_id || entry.id == self.core.local_id {
                continue;
            }
            let Some(addr) = entry.addr else {
                continue;
            };
            self.core.directory.insert(Peer::new(entry.id, addr, now));
            if let Err(e) = self.core.send_raw(addr, MessageBody::Hello, true, now) {
                tracing::warn!("HELLO to {} failed: {}", entry.id, e);
            }
        }

        self.core.state = SessionState::Connected;
        tracing::info!(
            "Joined session as {} ({} other peers)",
            self.core.local_id,
            self.core.directory.len()
        );
        self.callbacks.on_success();
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    fn on_peer_timed_out(&mut self, sender: PeerId, peer: PeerId, now: Instant) {
        if peer == self.core.local_id {
            return;
        }
        let Some(departed) = self.core.directory.remove(peer) else {
            return;
        };

        let notice = MessageBody::Kicked {
            reason: String::from("Timed out"),
        };
        if let Err(e) = self.core.send_raw(departed.addr, notice, false, now) {
            tracing::debug!("KICKED to {} failed: {}", peer, e);
        }

        let reason = if sender == peer { "Disconnected" } else { "Timed out" };
        tracing::info!("{} left the session: {}", peer, reason);
        self.callbacks.on_peer_disconnect(peer, reason);
        self.after_peer_removed(peer);
    }

    /// Re-elects the master if needed and migrates the departed peer's entities.
    pub(super) fn after_peer_removed(&mut self, departed: PeerId) {
        if self.core.state != SessionState::Connected {
            return;
        }

        if departed == self.core.master_id {
            let old = self.core.master_id;
            let new = self.core.lowest_live_id();
            self.core.master_id = new;
            if new == self.core.local_id {
                let floor = self.core.directory.max_id().map_or(new, |max| max.max(new));
                self.core.next_peer_id = floor.next();
            }
            tracing::info!("Master {} left; {} is the new master", old, new);
            self.callbacks.on_new_master(old, new);
        }

        let successor = self.core.lowest_live_id();
        let report = self
            .core
            .ownership
            .migrate(departed, successor, self.core.local_id);
        if !report.reassigned.is_empty() || !report.destroyed.is_empty() {
            tracing::info!(
                "Migrated entities of {}: {} reassigned to {}, {} destroyed",
                departed,
                report.reassigned.len(),
                successor,
                report.destroyed.len()
            );
            self.callbacks.on_ownership_migrated(departed, &report);
        }
    }

    // =========================================================================
    // OWNERSHIP
    // =========================================================================

    fn on_ownership_request(&mut self, entity: EntityId, requester: PeerId, now: Instant) {
        let local = self.core.local_id;
        if !self.core.ownership.grant(entity, requester, local) {
            tracing::debug!("Ignoring ownership request for {} from {}", entity, requester);
            return;
        }

        tracing::debug!("Granted {} to {}", entity, requester);
        let change = MessageBody::EntityOwnerChanged {
            entity,
            new_owner: requester,
        };
        if let Err(e) = self.core.broadcast(&change, true, now) {
            tracing::warn!("Owner change broadcast for {} failed: {}", entity, e);
        }
    }
}
