//! Per-update liveness sweep: pings idle peers and evicts silent ones.

use super::{Session, SessionState};
use crate::peer::LivenessPolicy;
use peerlink_shared::MessageBody;
use std::time::Instant;

impl Session {
    fn liveness_policy(&self) -> LivenessPolicy {
        let config = &self.core.config;
        LivenessPolicy {
            timeout: config.peer_timeout(),
            ping_idle: config.ping_idle(),
            ping_interval: config.ping_interval(),
        }
    }

    pub(super) fn sweep(&mut self, now: Instant) {
        let policy = self.liveness_policy();
        let report = self.core.directory.sweep(now, policy);

        let master_lost = report.timed_out.iter().any(|peer| peer.id == self.core.master_id);
        if self.core.state == SessionState::AwaitingConnection && master_lost {
            tracing::warn!("Session master went silent during join");
            self.callbacks.on_failure("Session master stopped responding");
            self.teardown();
            return;
        }

        for (id, addr) in report.to_ping {
            tracing::trace!("Pinging idle {}", id);
            if let Err(e) = self.core.send_raw(addr, MessageBody::Ping, false, now) {
                tracing::warn!("PING to {} failed: {}", id, e);
            }
        }

        for peer in report.timed_out {
            tracing::info!("{} timed out", peer.id);
            self.callbacks.on_peer_disconnect(peer.id, "Timed out");
            let notice = MessageBody::PeerTimedOut { peer: peer.id };
            if let Err(e) = self.core.broadcast(&notice, true, now) {
                tracing::warn!("PEER_TIMED_OUT broadcast for {} failed: {}", peer.id, e);
            }
            self.after_peer_removed(peer.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::peer::Peer;
    use crate::session::SessionEvent;
    use crossbeam_channel::unbounded;
    use peerlink_shared::PeerId;
    use std::net::SocketAddr;
    use std::time::Duration;

    #[test]
    fn test_silent_peer_is_evicted_once() {
        let (tx, events) = unbounded();
        let mut session = Session::new(SessionConfig::loopback());
        session.create_session(0, tx).unwrap();

        let start = Instant::now();
        let addr = SocketAddr::from(([127, 0, 0, 1], 40100));
        session.core.directory.insert(Peer::new(PeerId(1), addr, start));

        session.sweep(start + Duration::from_millis(14_000));
        assert_eq!(session.peer_count(), 1);

        session.sweep(start + Duration::from_millis(15_001));
        session.sweep(start + Duration::from_millis(16_000));
        assert_eq!(session.peer_count(), 0);

        let left: Vec<SessionEvent> = events
            .try_iter()
            .filter(|e| matches!(e, SessionEvent::PeerLeft { .. }))
            .collect();
        assert_eq!(
            left,
            vec![SessionEvent::PeerLeft {
                peer: PeerId(1),
                reason: String::from("Timed out"),
            }]
        );
    }

    #[test]
    fn test_idle_peer_is_pinged_at_most_once_per_interval() {
        let mut session = Session::new(SessionConfig::loopback());
        session.create_session(0, super::super::NoopCallbacks).unwrap();

        let start = Instant::now();
        let addr = SocketAddr::from(([127, 0, 0, 1], 40101));
        session.core.directory.insert(Peer::new(PeerId(1), addr, start));

        session.sweep(start + Duration::from_millis(5_100));
        let first = session.core.directory.get(PeerId(1)).and_then(|p| p.last_ping_sent);
        assert_eq!(first, Some(start + Duration::from_millis(5_100)));

        session.sweep(start + Duration::from_millis(6_000));
        let second = session.core.directory.get(PeerId(1)).and_then(|p| p.last_ping_sent);
        assert_eq!(second, first);
    }

    #[test]
    fn test_silent_master_fails_join() {
        let (tx, events) = unbounded();
        let mut session = Session::new(SessionConfig::loopback());
        let master = SocketAddr::from(([127, 0, 0, 1], 40110));
        session.connect_to_session(master, tx).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingConnection);

        session.sweep(Instant::now() + Duration::from_millis(15_001));

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SessionEvent::JoinFailed(String::from("Session master stopped responding"))]
        );
    }
}
