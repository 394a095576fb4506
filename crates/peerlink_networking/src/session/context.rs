//! Session state shared between built-in handling and application handlers.

use super::SessionState;
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::ownership::OwnershipTable;
use crate::peer::PeerDirectory;
use crate::protocol::PacketId;
use crate::receive::ReceiveEngine;
use crate::reliable::{OutcomeCallback, ReliableSender, SendOutcome};
use peerlink_shared::{EntityId, Message, MessageBody, PeerId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Notices raised by send completion callbacks, handled on the next update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The join HELLO to the master expired unacknowledged.
    HelloExpired,
    /// An ownership request never reached the owner.
    OwnershipSendFailed { entity: EntityId, request: u64 },
}

/// Socket-bound half of a live session.
pub(crate) struct Link {
    pub(crate) sender: ReliableSender,
    pub(crate) receiver: ReceiveEngine,
}

/// Everything a session owns except its handler table and callbacks.
pub(crate) struct SessionCore {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) link: Option<Link>,
    pub(crate) local_id: PeerId,
    pub(crate) master_id: PeerId,
    pub(crate) next_peer_id: PeerId,
    pub(crate) directory: PeerDirectory,
    pub(crate) ownership: OwnershipTable,
    /// PEER_LIST that overtook PEER_ID during the join.
    pub(crate) stashed_peer_list: Option<Vec<peerlink_shared::PeerEntry>>,
    pub(crate) signals: Rc<RefCell<VecDeque<Signal>>>,
}

impl SessionCore {
    pub(crate) fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            link: None,
            local_id: PeerId::UNASSIGNED,
            master_id: PeerId::UNASSIGNED,
            next_peer_id: PeerId(1),
            directory: PeerDirectory::new(),
            ownership: OwnershipTable::new(),
            stashed_peer_list: None,
            signals: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub(crate) fn is_master(&self) -> bool {
        self.state != SessionState::Disconnected && self.local_id == self.master_id
    }

    pub(crate) fn require_connected(&self) -> SessionResult<()> {
        if self.state == SessionState::Connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Builds a signal-raising completion callback that fires on expiry.
    pub(crate) fn on_expiry(&self, signal: Signal) -> OutcomeCallback {
        let signals = Rc::clone(&self.signals);
        Box::new(move |outcome| {
            if let SendOutcome::Expired { .. } = outcome {
                signals.borrow_mut().push_back(signal);
            }
        })
    }

    /// Sends `body` stamped with the local id, regardless of session state.
    pub(crate) fn send_raw(
        &mut self,
        addr: SocketAddr,
        body: MessageBody,
        reliable: bool,
        now: Instant,
    ) -> SessionResult<PacketId> {
        let message = Message::new(self.local_id, body);
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        link.sender.send(addr, message, reliable, now)
    }

    /// Reliable send with explicit TTL and completion callback.
    pub(crate) fn send_raw_with(
        &mut self,
        addr: SocketAddr,
        body: MessageBody,
        ttl: Duration,
        on_outcome: OutcomeCallback,
        now: Instant,
    ) -> SessionResult<PacketId> {
        let message = Message::new(self.local_id, body);
        let link = self.link.as_mut().ok_or(SessionError::NotConnected)?;
        link.sender.send_with(addr, message, ttl, on_outcome, now)
    }

    /// Sends `body` to one known peer.
    pub(crate) fn send_to_peer(
        &mut self,
        body: MessageBody,
        peer: PeerId,
        reliable: bool,
        now: Instant,
    ) -> SessionResult<()> {
        self.require_connected()?;
        let addr = self
            .directory
            .get(peer)
            .map(|p| p.addr)
            .ok_or(SessionError::UnknownPeer(peer))?;
        self.send_raw(addr, body, reliable, now).map(|_| ())
    }

    /// Sends `body` to every known peer, skipping peers whose send fails.
    ///
    /// Fails only if the message itself cannot be encoded.
    pub(crate) fn broadcast(&mut self, body: &MessageBody, reliable: bool, now: Instant) -> SessionResult<()> {
        let targets: Vec<(PeerId, SocketAddr)> = self.directory.iter().map(|p| (p.id, p.addr)).collect();
        for (id, addr) in targets {
            match self.send_raw(addr, body.clone(), reliable, now) {
                Ok(_) => {}
                Err(SessionError::Transport(e)) => {
                    tracing::warn!("Send of {:?} to {} failed: {}", body.kind(), id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Public broadcast: requires a connected session.
    pub(crate) fn send_to_all(&mut self, body: MessageBody, reliable: bool, now: Instant) -> SessionResult<()> {
        self.require_connected()?;
        self.broadcast(&body, reliable, now)
    }

    /// Lowest id among the surviving peers and the local peer.
    pub(crate) fn lowest_live_id(&self) -> PeerId {
        self.directory
            .ids()
            .into_iter()
            .chain(std::iter::once(self.local_id))
            .filter(|id| !id.is_unassigned())
            .min()
            .unwrap_or(self.local_id)
    }

    /// Picks the next free peer id (master only).
    pub(crate) fn allocate_peer_id(&mut self) -> PeerId {
        let mut candidate = self.next_peer_id;
        while candidate.is_unassigned() || candidate == self.local_id || self.directory.contains(candidate) {
            candidate = candidate.next();
        }
        self.next_peer_id = candidate.next();
        candidate
    }
}

/// The narrow send interface handed to message handlers.
///
/// Implemented by [`crate::Session`] and by [`SessionContext`], so code that
/// only needs to talk to peers can be written once for both.
pub trait MessageSink {
    /// Sends `body` to every known peer.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] outside a connected session, or a codec
    /// error if the message cannot be encoded.
    fn send_to_all(&mut self, body: MessageBody, reliable: bool) -> SessionResult<()>;

    /// Sends `body` to `peer`.
    ///
    /// # Errors
    ///
    /// As [`MessageSink::send_to_all`], plus [`SessionError::UnknownPeer`].
    fn send_to_peer(&mut self, body: MessageBody, peer: PeerId, reliable: bool) -> SessionResult<()>;

    /// Id of the local peer.
    fn local_peer_id(&self) -> PeerId;
}

/// View of the session given to a message handler while it runs.
pub struct SessionContext<'a> {
    core: &'a mut SessionCore,
    now: Instant,
}

impl<'a> SessionContext<'a> {
    pub(crate) fn new(core: &'a mut SessionCore, now: Instant) -> Self {
        Self { core, now }
    }

    /// Id of the current master.
    #[must_use]
    pub fn master_peer_id(&self) -> PeerId {
        self.core.master_id
    }

    /// Returns true if the local peer is master.
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.core.is_master()
    }

    /// Ids of all known remote peers.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.core.directory.ids()
    }

    /// Current owner of `entity`, if known.
    #[must_use]
    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.core.ownership.owner_of(entity)
    }
}

impl MessageSink for SessionContext<'_> {
    fn send_to_all(&mut self, body: MessageBody, reliable: bool) -> SessionResult<()> {
        self.core.send_to_all(body, reliable, self.now)
    }

    fn send_to_peer(&mut self, body: MessageBody, peer: PeerId, reliable: bool) -> SessionResult<()> {
        self.core.send_to_peer(body, peer, reliable, self.now)
    }

    fn local_peer_id(&self) -> PeerId {
        self.core.local_id
    }
}
