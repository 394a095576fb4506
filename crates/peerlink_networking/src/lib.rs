//! # PEERLINK Networking
//!
//! Peer-to-peer session layer over UDP for small real-time groups.
//!
//! ## Architecture
//!
//! - **Protocol**: Self-describing binary packets (< 1200 bytes MTU)
//! - **Reliability**: Per-packet acks, fixed-interval retransmit until TTL
//! - **Receive**: Dedicated thread with per-sender dedup and delayed acks
//! - **Session**: Master-assisted join, full mesh, heartbeat eviction
//! - **Ownership**: Every shared entity has exactly one owner at a time
//!
//! ## Topology
//!
//! ```text
//!            ┌────────────┐
//!            │ MASTER (0) │  allocates ids, sends PEER_LIST
//!            └─────┬──────┘
//!          HELLO   │   PEER_ID + PEER_LIST
//!      ┌───────────┴───────────┐
//!  ┌───▼────┐             ┌────▼───┐
//!  │ PEER 1 │◄───HELLO───►│ PEER 2 │
//!  └────────┘             └────────┘
//! ```
//!
//! After joining, every peer talks to every other peer directly. The master
//! only matters for admission.
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerlink_networking::{MessageSink, Session, SessionConfig, SessionEvent};
//! use peerlink_shared::MessageBody;
//!
//! let (events, rx) = crossbeam_channel::unbounded::<SessionEvent>();
//! let mut session = Session::new(SessionConfig::default());
//! session.connect_to_session("192.168.1.10:7777".parse()?, events)?;
//!
//! loop {
//!     session.update();
//!     for event in rx.try_iter() {
//!         if event == SessionEvent::Connected {
//!             session.send_to_all(MessageBody::Chat { text: "hi".into() }, true)?;
//!         }
//!     }
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod ownership;
pub mod peer;
pub mod protocol;
pub mod receive;
pub mod reliable;
pub mod session;
pub mod tick;
pub mod transport;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{CodecError, ConfigError, SessionError, SessionResult};
pub use ownership::{MigrationReport, OwnershipFailure, OwnershipOutcome, OwnershipTicket};
pub use protocol::{DeliveryMode, Packet, PacketId};
pub use reliable::{OutcomeCallback, SendOutcome};
pub use session::{
    MessageHandler, MessageSink, NoopCallbacks, Session, SessionCallbacks, SessionContext, SessionEvent,
    SessionState,
};
pub use tick::TickPacer;
pub use transport::{TransportStats, UdpTransport};

pub use peerlink_shared::{
    EntityId, EntitySnapshot, Message, MessageBody, MessageKind, PeerEntry, PeerId,
};
