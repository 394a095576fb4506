//! # Session
//!
//! Top-level coordinator: join handshake, membership, liveness, dispatch and
//! entity ownership for one participating process.
//!
//! ## State Machine
//!
//! ```text
//!                create_session
//! DISCONNECTED ──────────────────────────────► CONNECTED
//!      │                                           ▲
//!      │ connect_to_session        PEER_ID +       │
//!      └──────► AWAITING_CONNECTION ───────────────┘
//!                      │            PEER_LIST
//!                      └── HELLO expired / master silent ──► DISCONNECTED
//! ```
//!
//! ## Threading
//!
//! [`Session::update`] must be called regularly from one thread. It never
//! blocks. The only other thread is the receive loop, which talks to the
//! session through a queue and the ack tracker.
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_networking::{NoopCallbacks, Session, SessionConfig};
//! use peerlink_shared::{MessageBody, MessageKind};
//!
//! let mut session = Session::new(SessionConfig::default());
//! session.register_handler(MessageKind::Chat, |message, _ctx| {
//!     println!("{}: {:?}", message.sender(), message.body());
//! });
//! session.create_session(7777, NoopCallbacks)?;
//! loop {
//!     session.update();
//! }
//! ```

mod callbacks;
mod context;
mod handshake;
mod liveness;

pub use self::callbacks::{NoopCallbacks, SessionCallbacks, SessionEvent};
pub use self::context::{MessageSink, SessionContext};

use self::context::{Link, SessionCore, Signal};
use crate::config::SessionConfig;
use crate::error::{ConfigError, SessionError, SessionResult};
use crate::ownership::{OwnershipTicket, RequestPlan};
use crate::peer::Peer;
use crate::receive::{Inbound, ReceiveEngine, ReceiveSettings};
use crate::reliable::{OutcomeCallback, ReliableSender};
use crate::transport::{TransportStats, UdpTransport};
use peerlink_shared::{EntityId, EntitySnapshot, Message, MessageBody, MessageKind, PeerId, MASTER_PEER_ID};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Handler invoked for every received message of one kind.
pub type MessageHandler = Box<dyn FnMut(&Message, &mut SessionContext<'_>)>;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No socket, no peers.
    Disconnected,
    /// HELLO sent to the master; waiting for PEER_ID and PEER_LIST.
    AwaitingConnection,
    /// Member of a session.
    Connected,
}

/// One participant in a peer-to-peer session.
pub struct Session {
    core: SessionCore,
    handlers: HashMap<MessageKind, MessageHandler>,
    callbacks: Box<dyn SessionCallbacks>,
}

impl Session {
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            core: SessionCore::new(config),
            handlers: HashMap::new(),
            callbacks: Box::new(NoopCallbacks),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Hosts a new session on `port`; the local peer becomes master with id 0.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyInitialized`] unless disconnected,
    /// [`SessionError::Config`] for an out-of-range configuration, or
    /// [`SessionError::Transport`] if the port cannot be bound.
    pub fn create_session(&mut self, port: u16, callbacks: impl SessionCallbacks + 'static) -> SessionResult<()> {
        self.ensure_disconnected()?;
        let bind = SocketAddr::new(self.core.config.bind_address, port);
        self.open_link(bind)?;
        self.callbacks = Box::new(callbacks);

        self.core.local_id = MASTER_PEER_ID;
        self.core.master_id = MASTER_PEER_ID;
        self.core.next_peer_id = MASTER_PEER_ID.next();
        self.core.state = SessionState::Connected;

        tracing::info!("Hosting session on {} as {}", self.local_addr_or_bind(bind), MASTER_PEER_ID);
        Ok(())
    }

    /// Joins the session hosted at `master`.
    ///
    /// Returns once HELLO is sent; completion is reported through
    /// [`SessionCallbacks::on_success`] or [`SessionCallbacks::on_failure`].
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyInitialized`] unless disconnected,
    /// [`SessionError::Config`] for an out-of-range configuration, or a
    /// transport error if no local socket can be bound.
    pub fn connect_to_session(
        &mut self,
        master: SocketAddr,
        callbacks: impl SessionCallbacks + 'static,
    ) -> SessionResult<()> {
        self.ensure_disconnected()?;
        let bind = SocketAddr::new(self.core.config.bind_address, 0);
        self.open_link(bind)?;
        self.callbacks = Box::new(callbacks);

        let now = Instant::now();
        self.core.local_id = PeerId::UNASSIGNED;
        self.core.master_id = MASTER_PEER_ID;
        self.core.directory.insert(Peer::new(MASTER_PEER_ID, master, now));
        self.core.state = SessionState::AwaitingConnection;

        let ttl = self.core.config.reliable_ttl();
        let on_expiry = self.core.on_expiry(Signal::HelloExpired);
        if let Err(e) = self.core.send_raw_with(master, MessageBody::Hello, ttl, on_expiry, now) {
            self.teardown();
            return Err(e);
        }

        tracing::info!("Joining session at {}", master);
        Ok(())
    }

    /// Leaves the session.
    ///
    /// Connected peers first tell everyone they are gone, then
    /// [`SessionCallbacks::on_disconnect`] fires. Does nothing when already
    /// disconnected.
    pub fn disconnect(&mut self) {
        match self.core.state {
            SessionState::Disconnected => return,
            SessionState::Connected => {
                let farewell = MessageBody::PeerTimedOut {
                    peer: self.core.local_id,
                };
                if let Err(e) = self.core.broadcast(&farewell, false, Instant::now()) {
                    tracing::warn!("Farewell broadcast failed: {}", e);
                }
                self.callbacks.on_disconnect("Disconnected");
            }
            SessionState::AwaitingConnection => {}
        }
        self.teardown();
    }

    fn ensure_disconnected(&self) -> SessionResult<()> {
        if self.core.state == SessionState::Disconnected {
            Ok(())
        } else {
            Err(SessionError::AlreadyInitialized)
        }
    }

    fn open_link(&mut self, bind: SocketAddr) -> SessionResult<()> {
        let config = &self.core.config;
        config.validate().map_err(|e| match e {
            ConfigError::Invalid(reason) => SessionError::Config(reason),
            other => SessionError::Config(other.to_string()),
        })?;
        let transport = UdpTransport::bind(bind, config.recv_poll_interval())?;
        let sender = ReliableSender::new(transport.clone(), config.retransmit_interval(), config.reliable_ttl());
        let receiver = ReceiveEngine::spawn(
            transport,
            sender.tracker(),
            sender.ids(),
            ReceiveSettings::from_config(config),
        )?;
        self.core.link = Some(Link { sender, receiver });
        Ok(())
    }

    fn local_addr_or_bind(&self, bind: SocketAddr) -> SocketAddr {
        self.local_addr().unwrap_or(bind)
    }

    /// Drops the socket and every piece of session state.
    pub(crate) fn teardown(&mut self) {
        let core = &mut self.core;
        if let Some(mut link) = core.link.take() {
            link.sender.clear();
            link.receiver.stop();
        }
        core.state = SessionState::Disconnected;
        core.directory.clear();
        core.ownership.clear();
        core.stashed_peer_list = None;
        core.signals.borrow_mut().clear();
        core.local_id = PeerId::UNASSIGNED;
        core.master_id = PeerId::UNASSIGNED;
        tracing::debug!("Session torn down");
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Runs one tick: retransmits, delivers received messages, expires
    /// ownership requests and sweeps peer liveness.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// [`Session::update`] with an explicit clock reading.
    pub fn update_at(&mut self, now: Instant) {
        if self.core.state == SessionState::Disconnected {
            return;
        }

        if let Some(link) = self.core.link.as_mut() {
            link.sender.tick(now);
        }
        self.process_signals();

        while self.core.state != SessionState::Disconnected {
            let Some(item) = self.core.link.as_mut().and_then(|link| link.receiver.poll(now)) else {
                break;
            };
            self.handle_inbound(item, now);
        }

        for entity in self.core.ownership.expire(now) {
            tracing::debug!("Ownership request for {} timed out", entity);
        }

        if self.core.state != SessionState::Disconnected {
            self.sweep(now);
        }
    }

    fn process_signals(&mut self) {
        loop {
            let Some(signal) = self.core.signals.borrow_mut().pop_front() else {
                break;
            };
            match signal {
                Signal::HelloExpired => {
                    if self.core.state == SessionState::AwaitingConnection {
                        tracing::warn!("Session master never acknowledged HELLO");
                        self.callbacks.on_failure("Could not reach session master");
                        self.teardown();
                    }
                }
                Signal::OwnershipSendFailed { entity, request } => {
                    if self.core.ownership.fail_send(entity, request) {
                        tracing::debug!("Ownership request for {} was never delivered", entity);
                    }
                }
            }
        }
    }

    fn handle_inbound(&mut self, item: Inbound, now: Instant) {
        match item {
            Inbound::LinkFailed { reason } => {
                tracing::warn!("Receive loop failed: {}", reason);
                self.callbacks.on_disconnect(&format!("Transport failure: {reason}"));
                self.teardown();
            }
            Inbound::Activity { from } => {
                self.core.directory.heartbeat_addr(from, now);
            }
            Inbound::Message { message, from } => {
                if !self.core.directory.heartbeat(message.sender(), now) {
                    self.core.directory.heartbeat_addr(from, now);
                }
                if self.handle_builtin(&message, from, now) {
                    self.dispatch(&message, now);
                }
            }
        }
    }

    fn dispatch(&mut self, message: &Message, now: Instant) {
        if let Some(handler) = self.handlers.get_mut(&message.kind()) {
            let mut context = SessionContext::new(&mut self.core, now);
            handler(message, &mut context);
        }
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// Registers `handler` for `kind`, replacing any previous one.
    ///
    /// Handlers run after built-in processing of the message.
    pub fn register_handler<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: FnMut(&Message, &mut SessionContext<'_>) + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Removes the handler for `kind`. Returns false if none was registered.
    pub fn unregister_handler(&mut self, kind: MessageKind) -> bool {
        self.handlers.remove(&kind).is_some()
    }

    // =========================================================================
    // MESSAGING
    // =========================================================================

    /// Sends `body` reliably to `peer` with a completion callback.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`], [`SessionError::UnknownPeer`], or a
    /// codec error.
    pub fn send_to_peer_with(
        &mut self,
        body: MessageBody,
        peer: PeerId,
        ttl: Duration,
        on_outcome: OutcomeCallback,
    ) -> SessionResult<()> {
        self.core.require_connected()?;
        let addr = self
            .core
            .directory
            .get(peer)
            .map(|p| p.addr)
            .ok_or(SessionError::UnknownPeer(peer))?;
        self.core
            .send_raw_with(addr, body, ttl, on_outcome, Instant::now())
            .map(|_| ())
    }

    // =========================================================================
    // ENTITIES
    // =========================================================================

    /// Creates an entity owned by the local peer and announces it reliably.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`] or a codec error.
    pub fn spawn_entity(
        &mut self,
        entity: EntityId,
        entity_kind: u16,
        transferable: bool,
        snapshot: EntitySnapshot,
    ) -> SessionResult<()> {
        self.core.require_connected()?;
        let owner = self.core.local_id;
        self.core.ownership.register(entity, owner, transferable);
        let body = MessageBody::CreateEntity {
            entity,
            entity_kind,
            owner,
            transferable,
            snapshot,
        };
        self.core.send_to_all(body, true, Instant::now())
    }

    /// Destroys a locally owned entity and announces it reliably.
    ///
    /// Pending ownership requests for it resolve as cancelled.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownEntity`], [`SessionError::NotOwner`] or
    /// [`SessionError::NotConnected`].
    pub fn destroy_entity(&mut self, entity: EntityId) -> SessionResult<()> {
        self.require_local_owner(entity)?;
        self.core.ownership.forget(entity);
        self.core
            .send_to_all(MessageBody::DestroyEntity { entity }, true, Instant::now())
    }

    /// Broadcasts the state of a locally owned entity, best-effort.
    ///
    /// # Errors
    ///
    /// As [`Session::destroy_entity`].
    pub fn broadcast_entity_state(&mut self, entity: EntityId, snapshot: EntitySnapshot) -> SessionResult<()> {
        self.require_local_owner(entity)?;
        self.core
            .send_to_all(MessageBody::EntityState { entity, snapshot }, false, Instant::now())
    }

    /// Broadcasts an event of a locally owned entity, reliably.
    ///
    /// # Errors
    ///
    /// As [`Session::destroy_entity`], plus codec errors for large payloads.
    pub fn broadcast_entity_event(&mut self, entity: EntityId, event: u16, payload: Vec<u8>) -> SessionResult<()> {
        self.require_local_owner(entity)?;
        let body = MessageBody::EntityEvent {
            entity,
            event,
            payload,
        };
        self.core.send_to_all(body, true, Instant::now())
    }

    fn require_local_owner(&self, entity: EntityId) -> SessionResult<()> {
        self.core.require_connected()?;
        match self.core.ownership.owner_of(entity) {
            None => Err(SessionError::UnknownEntity(entity)),
            Some(owner) if owner != self.core.local_id => Err(SessionError::NotOwner(entity)),
            Some(_) => Ok(()),
        }
    }

    /// Current owner of `entity`, if known.
    #[must_use]
    pub fn owner_of(&self, entity: EntityId) -> Option<PeerId> {
        self.core.ownership.owner_of(entity)
    }

    /// Asks the owner of `entity` to hand it over.
    ///
    /// Already owning it resolves the ticket immediately without any network
    /// traffic. A non-zero `timeout` fails the ticket with "Timed out" if
    /// ownership has not arrived by then.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotConnected`], [`SessionError::UnknownEntity`], or
    /// [`SessionError::UnknownPeer`] if the recorded owner is not a known peer.
    pub fn request_ownership(&mut self, entity: EntityId, timeout: Duration) -> SessionResult<OwnershipTicket> {
        self.request_ownership_at(entity, timeout, Instant::now())
    }

    /// [`Session::request_ownership`] with an explicit clock reading.
    ///
    /// # Errors
    ///
    /// As [`Session::request_ownership`].
    pub fn request_ownership_at(
        &mut self,
        entity: EntityId,
        timeout: Duration,
        now: Instant,
    ) -> SessionResult<OwnershipTicket> {
        self.core.require_connected()?;
        let deadline = (!timeout.is_zero()).then_some(timeout);
        let plan = self
            .core
            .ownership
            .begin_request(entity, self.core.local_id, now, deadline)?;

        let (ticket, owner, request) = match plan {
            RequestPlan::Granted(ticket) => return Ok(ticket),
            RequestPlan::Ask {
                ticket,
                owner,
                request,
            } => (ticket, owner, request),
        };

        let Some(addr) = self.core.directory.get(owner).map(|p| p.addr) else {
            self.core.ownership.cancel(entity);
            return Err(SessionError::UnknownPeer(owner));
        };
        let ttl = self.core.config.reliable_ttl();
        let on_expiry = self.core.on_expiry(Signal::OwnershipSendFailed { entity, request });
        let body = MessageBody::EntityRequestOwner { entity };
        if let Err(e) = self.core.send_raw_with(addr, body, ttl, on_expiry, now) {
            self.core.ownership.cancel(entity);
            return Err(e);
        }

        tracing::debug!("Requested ownership of {} from {}", entity, owner);
        Ok(ticket)
    }

    /// Abandons the pending ownership request for `entity`.
    pub fn cancel_ownership_request(&mut self, entity: EntityId) -> bool {
        self.core.ownership.cancel(entity)
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state
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

    /// Number of known remote peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.core.directory.len()
    }

    /// Ids of known remote peers, ascending.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.core.directory.ids()
    }

    /// Network address of a known peer.
    #[must_use]
    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.core.directory.get(peer).map(|p| p.addr)
    }

    /// Local socket address while a socket is open.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .link
            .as_ref()
            .map(|link| link.sender.transport().local_addr())
    }

    /// Socket statistics while a socket is open.
    #[must_use]
    pub fn transport_stats(&self) -> Option<TransportStats> {
        self.core.link.as_ref().map(|link| link.sender.transport().stats())
    }

    /// Number of reliable packets awaiting acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.core.link.as_ref().map_or(0, |link| link.sender.in_flight())
    }

    /// Changes the artificial delay applied to received datagrams.
    pub fn set_read_delay(&mut self, delay: Duration) {
        self.core.config.read_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Some(link) = self.core.link.as_ref() {
            link.receiver.set_read_delay(delay);
        }
    }

    /// Configuration this session runs with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }
}

impl MessageSink for Session {
    fn send_to_all(&mut self, body: MessageBody, reliable: bool) -> SessionResult<()> {
        self.core.send_to_all(body, reliable, Instant::now())
    }

    fn send_to_peer(&mut self, body: MessageBody, peer: PeerId, reliable: bool) -> SessionResult<()> {
        self.core.send_to_peer(body, peer, reliable, Instant::now())
    }

    fn local_peer_id(&self) -> PeerId {
        self.core.local_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.core.state != SessionState::Disconnected {
            self.teardown();
        }
    }
}
