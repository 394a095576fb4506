//! Session lifecycle notifications.

use crate::ownership::MigrationReport;
use crossbeam_channel::Sender;
use peerlink_shared::PeerId;

/// Receives session lifecycle notifications.
///
/// All methods run on the thread calling [`crate::Session::update`] and
/// default to doing nothing.
pub trait SessionCallbacks {
    /// Join completed; the session is connected.
    fn on_success(&mut self) {}

    /// Join failed; the session is disconnected again.
    fn on_failure(&mut self, _reason: &str) {}

    /// The local peer left the session, by request, kick or transport failure.
    fn on_disconnect(&mut self, _reason: &str) {}

    /// A remote peer left the session.
    fn on_peer_disconnect(&mut self, _peer: PeerId, _reason: &str) {}

    /// The master left and `new` took over.
    fn on_new_master(&mut self, _old: PeerId, _new: PeerId) {}

    /// Entities of a departed peer were reassigned or destroyed.
    fn on_ownership_migrated(&mut self, _departed: PeerId, _report: &MigrationReport) {}
}

/// Callbacks that ignore everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallbacks;

impl SessionCallbacks for NoopCallbacks {}

/// Session lifecycle notification as a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// See [`SessionCallbacks::on_success`].
    Connected,
    /// See [`SessionCallbacks::on_failure`].
    JoinFailed(String),
    /// See [`SessionCallbacks::on_disconnect`].
    Disconnected(String),
    /// See [`SessionCallbacks::on_peer_disconnect`].
    PeerLeft {
        /// Departed peer.
        peer: PeerId,
        /// Why it left.
        reason: String,
    },
    /// See [`SessionCallbacks::on_new_master`].
    NewMaster {
        /// Previous master.
        old: PeerId,
        /// Current master.
        new: PeerId,
    },
    /// See [`SessionCallbacks::on_ownership_migrated`].
    OwnershipMigrated {
        /// Departed peer.
        departed: PeerId,
        /// What happened to its entities.
        report: MigrationReport,
    },
}

/// Forwards every notification into a channel.
impl SessionCallbacks for Sender<SessionEvent> {
    fn on_success(&mut self) {
        let _ = self.send(SessionEvent::Connected);
    }

    fn on_failure(&mut self, reason: &str) {
        let _ = self.send(SessionEvent::JoinFailed(reason.to_owned()));
    }

    fn on_disconnect(&mut self, reason: &str) {
        let _ = self.send(SessionEvent::Disconnected(reason.to_owned()));
    }

    fn on_peer_disconnect(&mut self, peer: PeerId, reason: &str) {
        let _ = self.send(SessionEvent::PeerLeft {
            peer,
            reason: reason.to_owned(),
        });
    }

    fn on_new_master(&mut self, old: PeerId, new: PeerId) {
        let _ = self.send(SessionEvent::NewMaster { old, new });
    }

    fn on_ownership_migrated(&mut self, departed: PeerId, report: &MigrationReport) {
        let _ = self.send(SessionEvent::OwnershipMigrated {
            departed,
            report: report.clone(),
        });
    }
}
