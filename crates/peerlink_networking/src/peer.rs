//! # Peer Directory
//!
//! Known remote peers and their liveness.
//!
//! ## Design
//!
//! - Ordered by id so successor choice and iteration are deterministic
//! - Two records are the same endpoint iff address and port match
//! - The sweep only reports; the session decides what eviction means

use peerlink_shared::PeerId;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Session-scoped id.
    pub id: PeerId,
    /// Network endpoint.
    pub addr: SocketAddr,
    /// Last time anything arrived from this peer.
    pub last_heartbeat: Instant,
    /// Last time we pinged this peer.
    pub last_ping_sent: Option<Instant>,
}

impl Peer {
    /// Creates a peer last heard from at `now`.
    #[must_use]
    pub const fn new(id: PeerId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_heartbeat: now,
            last_ping_sent: None,
        }
    }

    /// Returns true if no heartbeat arrived for longer than `timeout`.
    #[inline]
    #[must_use]
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > timeout
    }

    /// Returns true if the peer is idle and was not pinged recently.
    #[must_use]
    pub fn needs_ping(&self, now: Instant, idle: Duration, interval: Duration) -> bool {
        let idle_long_enough = now.saturating_duration_since(self.last_heartbeat) > idle;
        let ping_due = self
            .last_ping_sent
            .map_or(true, |sent| now.saturating_duration_since(sent) > interval);
        idle_long_enough && ping_due
    }
}

/// Liveness thresholds for [`PeerDirectory::sweep`].
#[derive(Clone, Copy, Debug)]
pub struct LivenessPolicy {
    /// Silence after which a peer is evicted.
    pub timeout: Duration,
    /// Silence after which a peer is pinged.
    pub ping_idle: Duration,
    /// Minimum gap between pings.
    pub ping_interval: Duration,
}

/// What one liveness sweep found.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers removed for silence.
    pub timed_out: Vec<Peer>,
    /// Peers to ping now; their ping time has been recorded.
    pub to_ping: Vec<(PeerId, SocketAddr)>,
}

/// Directory of known peers.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<PeerId, Peer>,
}

impl PeerDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a peer.
    pub fn insert(&mut self, peer: Peer) {
        self.peers.insert(peer.id, peer);
    }

    /// Removes a peer.
    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Returns true if `id` is known.
    #[must_use]
    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Looks up a peer by network endpoint.
    #[must_use]
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.peers.values().find(|peer| peer.addr == addr)
    }

    /// Moves the record under `old` to `new`. Returns false if `old` is unknown.
    pub fn rekey(&mut self, old: PeerId, new: PeerId) -> bool {
        let Some(mut peer) = self.peers.remove(&old) else {
            return false;
        };
        peer.id = new;
        self.peers.insert(new, peer);
        true
    }

    /// Records activity from peer `id`.
    pub fn heartbeat(&mut self, id: PeerId, now: Instant) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.last_heartbeat = peer.last_heartbeat.max(now);
                true
            }
            None => false,
        }
    }

    /// Records activity from whichever peer lives at `addr`.
    pub fn heartbeat_addr(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.values_mut().find(|peer| peer.addr == addr) {
            Some(peer) => {
                peer.last_heartbeat = peer.last_heartbeat.max(now);
                true
            }
            None => false,
        }
    }

    /// Evicts silent peers and schedules pings for idle ones.
    pub fn sweep(&mut self, now: Instant, policy: LivenessPolicy) -> SweepReport {
        let mut report = SweepReport::default();

        let expired: Vec<PeerId> = self
            .peers
            .values()
            .filter(|peer| peer.is_timed_out(now, policy.timeout))
            .map(|peer| peer.id)
            .collect();
        for id in expired {
            if let Some(peer) = self.peers.remove(&id) {
                report.timed_out.push(peer);
            }
        }

        for peer in self.peers.values_mut() {
            if peer.needs_ping(now, policy.ping_idle, policy.ping_interval) {
                peer.last_ping_sent = Some(now);
                report.to_ping.push((peer.id, peer.addr));
            }
        }

        report
    }

    /// Peer ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Iterates peers in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Largest known id.
    #[must_use]
    pub fn max_id(&self) -> Option<PeerId> {
        self.peers.keys().next_back().copied()
    }

    /// Number of peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Returns true if no peers are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Forgets every peer.
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LivenessPolicy {
        LivenessPolicy {
            timeout: Duration::from_millis(15_000),
            ping_idle: Duration::from_millis(5_000),
            ping_interval: Duration::from_millis(5_000),
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_rekey_moves_record() {
        let now = Instant::now();
        let mut directory = PeerDirectory::new();
        directory.insert(Peer::new(PeerId(0), addr(7777), now));

        assert!(directory.rekey(PeerId(0), PeerId(5)));
        assert!(!directory.contains(PeerId(0)));
        assert_eq!(directory.get(PeerId(5)).map(|p| p.addr), Some(addr(7777)));
        assert!(!directory.rekey(PeerId(9), PeerId(1)));
    }

    #[test]
    fn test_find_by_addr() {
        let now = Instant::now();
        let mut directory = PeerDirectory::new();
        directory.insert(Peer::new(PeerId(1), addr(4000), now));
        directory.insert(Peer::new(PeerId(2), addr(4001), now));

        assert_eq!(directory.find_by_addr(addr(4001)).map(|p| p.id), Some(PeerId(2)));
        assert!(directory.find_by_addr(addr(4002)).is_none());
    }

    #[test]
    fn test_sweep_pings_idle_then_evicts() {
        let start = Instant::now();
        let mut directory = PeerDirectory::new();
        directory.insert(Peer::new(PeerId(1), addr(4000), start));

        let at = |ms| start + Duration::from_millis(ms);

        assert_eq!(directory.sweep(at(4_000), policy()), SweepReport::default());

        let report = directory.sweep(at(5_001), policy());
        assert_eq!(report.to_ping, vec![(PeerId(1), addr(4000))]);

        // Pinged recently: no second ping yet.
        assert!(directory.sweep(at(9_000), policy()).to_ping.is_empty());
        assert_eq!(directory.sweep(at(10_002), policy()).to_ping.len(), 1);

        let report = directory.sweep(at(15_001), policy());
        assert_eq!(report.timed_out.len(), 1);
        assert_eq!(report.timed_out[0].id, PeerId(1));
        assert!(directory.is_empty());

        assert!(directory.sweep(at(16_000), policy()).timed_out.is_empty());
    }

    #[test]
    fn test_heartbeat_resets_timeout() {
        let start = Instant::now();
        let mut directory = PeerDirectory::new();
        directory.insert(Peer::new(PeerId(1), addr(4000), start));

        assert!(directory.heartbeat(PeerId(1), start + Duration::from_millis(10_000)));
        assert!(directory.heartbeat_addr(addr(4000), start + Duration::from_millis(12_000)));
        let report = directory.sweep(start + Duration::from_millis(20_000), policy());
        assert!(report.timed_out.is_empty());
        assert!(!directory.heartbeat(PeerId(9), start));
    }

    #[test]
    fn test_ids_sorted() {
        let now = Instant::now();
        let mut directory = PeerDirectory::new();
        for id in [3, 1, 2] {
            directory.insert(Peer::new(PeerId(id), addr(4000 + id as u16), now));
        }
        assert_eq!(directory.ids(), vec![PeerId(1), PeerId(2), PeerId(3)]);
        assert_eq!(directory.max_id(), Some(PeerId(3)));
    }
}
