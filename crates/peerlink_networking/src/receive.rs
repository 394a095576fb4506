//! # Receive Engine
//!
//! Dedicated thread that drains the socket, acknowledges, deduplicates and
//! hands messages to the update thread.
//!
//! ## Design
//!
//! ```text
//!  socket ──► decode ──► ACK ────────► AckTracker::on_ack
//!                    ├─► AT_LEAST_ONCE ─► ack back ─┐
//!                    │                   dedup ─────┼─► queue ──► poll()
//!                    └─► BEST_EFFORT ───────────────┘
//! ```
//!
//! - The dedup table is owned by the receive thread; nothing else touches it
//! - Duplicates are acked again but never re-delivered
//! - The artificial read delay postpones delivery, outgoing acks and ack
//!   resolution alike
//! - Ids are remembered for max(retention, packet TTL); pruning pops them
//!   from a per-sender expiry heap, so it costs O(expired) rather than
//!   O(table)

use crate::config::SessionConfig;
use crate::protocol::{decode, encode, wall_clock_ms, DeliveryMode, Packet, PacketId};
use crate::reliable::{AckTracker, PacketIdAllocator};
use crate::transport::{is_transient, UdpTransport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use peerlink_shared::{Message, MAX_PACKET_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Consecutive hard receive failures after which the loop gives up.
pub const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 16;

/// Something the receive loop hands to the update thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// A newly seen message.
    Message {
        /// Decoded message.
        message: Message,
        /// Datagram source.
        from: SocketAddr,
    },
    /// An ack arrived from `from`; proves the peer is alive.
    Activity {
        /// Datagram source.
        from: SocketAddr,
    },
    /// The socket failed repeatedly and the loop stopped.
    LinkFailed {
        /// Last error seen.
        reason: String,
    },
}

struct Queued {
    item: Inbound,
    ready_at: Instant,
}

/// Packet ids recently received, per sender address.
///
/// An id is kept for the retention window or the packet's own TTL,
/// whichever is longer, so a sender still retransmitting can never get the
/// same packet delivered twice.
pub struct DedupTable {
    senders: HashMap<SocketAddr, SenderWindow>,
    retention: Duration,
}

#[derive(Default)]
struct SenderWindow {
    seen: HashSet<PacketId>,
    /// Min-heap on expiry.
    expiries: BinaryHeap<Reverse<(Instant, PacketId)>>,
}

impl DedupTable {
    /// Creates a table remembering ids for at least `retention`.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            retention,
        }
    }

    /// Records `id` from `from`, sent with time-to-live `ttl`.
    ///
    /// Returns true if it had not been seen.
    pub fn observe(&mut self, from: SocketAddr, id: PacketId, ttl: Duration, now: Instant) -> bool {
        let window = self.senders.entry(from).or_default();
        if !window.seen.insert(id) {
            return false;
        }
        let expires_at = now + self.retention.max(ttl);
        window.expiries.push(Reverse((expires_at, id)));
        true
    }

    /// Forgets ids whose window has passed. Returns how many.
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for window in self.senders.values_mut() {
            while let Some(&Reverse((expires_at, id))) = window.expiries.peek() {
                if expires_at >= now {
                    break;
                }
                window.expiries.pop();
                window.seen.remove(&id);
                removed += 1;
            }
        }
        self.senders.retain(|_, window| !window.expiries.is_empty());
        removed
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.values().map(|w| w.expiries.len()).sum()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// Drops inbound datagrams at random.
struct FaultInjector {
    packet_loss_percent: u8,
    rng: StdRng,
}

impl FaultInjector {
    fn new(packet_loss_percent: u8, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            packet_loss_percent,
            rng,
        }
    }

    fn should_drop(&mut self) -> bool {
        self.packet_loss_percent > 0 && self.rng.gen_range(0..100u8) < self.packet_loss_percent
    }
}

/// Receive loop tunables.
#[derive(Clone, Copy, Debug)]
pub struct ReceiveSettings {
    /// Artificial delay for every received datagram.
    pub read_delay: Duration,
    /// Dedup retention window.
    pub dedup_retention: Duration,
    /// Dedup prune interval.
    pub prune_interval: Duration,
    /// Share of inbound datagrams dropped on purpose.
    pub packet_loss_percent: u8,
    /// Seed for the drop generator.
    pub fault_seed: Option<u64>,
}

impl ReceiveSettings {
    /// Extracts the receive settings of a session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            read_delay: config.read_delay(),
            dedup_retention: config.dedup_retention(),
            prune_interval: config.dedup_prune_interval(),
            packet_loss_percent: config.packet_loss_percent,
            fault_seed: config.fault_seed,
        }
    }
}

enum Deferred {
    SendAck { dest: SocketAddr, ack_of: PacketId },
    ResolveAck(PacketId),
}

struct ReceiveLoop {
    transport: UdpTransport,
    tracker: Arc<AckTracker>,
    ids: PacketIdAllocator,
    out: Sender<Queued>,
    dedup: DedupTable,
    deferred: VecDeque<(Instant, Deferred)>,
    read_delay_ms: Arc<AtomicU64>,
    faults: FaultInjector,
    prune_interval: Duration,
    last_prune: Instant,
}

impl ReceiveLoop {
    fn run(mut self, running: &AtomicBool) {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        let mut consecutive_errors = 0u32;

        while running.load(Ordering::Acquire) {
            match self.transport.recv_from(&mut buffer) {
                Ok(Some((len, from))) => {
                    consecutive_errors = 0;
                    self.handle_datagram(&buffer[..len], from, Instant::now());
                }
                Ok(None) => {}
                Err(e) if is_transient(&e) => {
                    tracing::debug!("Ignoring transient receive error: {}", e);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!("Receive failed ({}/{}): {}", consecutive_errors, MAX_CONSECUTIVE_RECV_ERRORS, e);
                    if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                        let _ = self.out.send(Queued {
                            item: Inbound::LinkFailed {
                                reason: e.to_string(),
                            },
                            ready_at: Instant::now(),
                        });
                        break;
                    }
                }
            }

            let now = Instant::now();
            self.flush_deferred(now);
            if now.saturating_duration_since(self.last_prune) >= self.prune_interval {
                let removed = self.dedup.prune(now);
                if removed > 0 {
                    tracing::trace!("Pruned {} dedup entries", removed);
                }
                self.last_prune = now;
            }
        }

        tracing::debug!("Receive loop on {} stopped", self.transport.local_addr());
    }

    fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms.load(Ordering::Relaxed))
    }

    fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) {
        if self.faults.should_drop() {
            tracing::trace!("Fault injection dropped datagram from {}", from);
            return;
        }

        let packet = match decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropping undecodable datagram from {}: {}", from, e);
                return;
            }
        };

        let ready_at = now + self.read_delay();
        match packet.mode() {
            DeliveryMode::Ack => {
                self.defer(ready_at, Deferred::ResolveAck(packet.ack_of()));
                self.emit(Inbound::Activity { from }, ready_at);
            }
            DeliveryMode::AtLeastOnce => {
                let id = packet.id();
                self.defer(ready_at, Deferred::SendAck { dest: from, ack_of: id });
                let ttl = Duration::from_millis(u64::from(packet.ttl_ms()));
                if !self.dedup.observe(from, id, ttl, now) {
                    tracing::trace!("Duplicate packet {} from {}", id, from);
                    return;
                }
                if let Some(message) = packet.into_message() {
                    self.emit(Inbound::Message { message, from }, ready_at);
                }
            }
            DeliveryMode::BestEffort => {
                if let Some(message) = packet.into_message() {
                    self.emit(Inbound::Message { message, from }, ready_at);
                }
            }
        }
    }

    fn emit(&self, item: Inbound, ready_at: Instant) {
        // A closed queue means the session is shutting down.
        let _ = self.out.send(Queued { item, ready_at });
    }

    /// Queues work keeping `deferred` sorted by due time, so lowering the
    /// read delay never holds new acks behind older, later ones.
    fn defer(&mut self, due: Instant, work: Deferred) {
        let at = self.deferred.partition_point(|(queued, _)| *queued <= due);
        self.deferred.insert(at, (due, work));
    }

    fn flush_deferred(&mut self, now: Instant) {
        while self.deferred.front().is_some_and(|(due, _)| *due <= now) {
            let Some((_, work)) = self.deferred.pop_front() else {
                break;
            };
            match work {
                Deferred::SendAck { dest, ack_of } => self.send_ack(dest, ack_of),
                Deferred::ResolveAck(id) => {
                    self.tracker.on_ack(id, now);
                }
            }
        }
    }

    fn send_ack(&self, dest: SocketAddr, ack_of: PacketId) {
        let packet = Packet::ack(self.ids.next_id(), ack_of, wall_clock_ms());
        match encode(&packet) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send_to(&bytes, dest) {
                    tracing::warn!("Ack of packet {} to {} failed: {}", ack_of, dest, e);
                }
            }
            Err(e) => tracing::warn!("Encoding ack failed: {}", e),
        }
    }
}

/// Handle to a running receive loop.
///
/// Dropping the handle stops the loop and joins its thread.
pub struct ReceiveEngine {
    rx: Receiver<Queued>,
    held: Option<Queued>,
    running: Arc<AtomicBool>,
    read_delay_ms: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveEngine {
    /// Starts the receive loop on its own thread.
    ///
    /// # Errors
    ///
    /// Fails if the thread cannot be spawned.
    pub fn spawn(
        transport: UdpTransport,
        tracker: Arc<AckTracker>,
        ids: PacketIdAllocator,
        settings: ReceiveSettings,
    ) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let read_delay_ms = Arc::new(AtomicU64::new(
            u64::try_from(settings.read_delay.as_millis()).unwrap_or(u64::MAX),
        ));

        let receive_loop = ReceiveLoop {
            transport,
            tracker,
            ids,
            out: tx,
            dedup: DedupTable::new(settings.dedup_retention),
            deferred: VecDeque::new(),
            read_delay_ms: Arc::clone(&read_delay_ms),
            faults: FaultInjector::new(settings.packet_loss_percent, settings.fault_seed),
            prune_interval: settings.prune_interval,
            last_prune: Instant::now(),
        };

        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("peerlink-recv".into())
            .spawn(move || receive_loop.run(&flag))?;

        Ok(Self {
            rx,
            held: None,
            running,
            read_delay_ms,
            handle: Some(handle),
        })
    }

    /// Pops the next item whose read delay has elapsed by `now`.
    ///
    /// Never blocks. Items come out in arrival order.
    pub fn poll(&mut self, now: Instant) -> Option<Inbound> {
        let next = match self.held.take() {
            Some(queued) => queued,
            None => self.rx.try_recv().ok()?,
        };
        if next.ready_at > now {
            self.held = Some(next);
            return None;
        }
        Some(next.item)
    }

    /// Changes the artificial read delay for datagrams received from now on.
    ///
    /// Acks follow the new delay at once. Messages keep arrival order, so
    /// after a decrease they still wait behind items queued under the old
    /// delay.
    pub fn set_read_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.read_delay_ms.store(ms, Ordering::Relaxed);
    }

    /// Returns true while the loop thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for its thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Receive thread panicked");
            }
        }
    }
}

impl Drop for ReceiveEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliable::ReliableSender;
    use peerlink_shared::{MessageBody, PeerId};

    fn transport() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(200)).unwrap()
    }

    fn test_loop(read_delay_ms: u64) -> (ReceiveLoop, Receiver<Queued>, ReliableSender) {
        let local = transport();
        let sender = ReliableSender::new(local.clone(), Duration::from_millis(500), Duration::from_secs(5));
        let (tx, rx) = unbounded();
        let receive_loop = ReceiveLoop {
            transport: local,
            tracker: sender.tracker(),
            ids: sender.ids(),
            out: tx,
            dedup: DedupTable::new(Duration::from_secs(5)),
            deferred: VecDeque::new(),
            read_delay_ms: Arc::new(AtomicU64::new(read_delay_ms)),
            faults: FaultInjector::new(0, Some(1)),
            prune_interval: Duration::from_secs(5),
            last_prune: Instant::now(),
        };
        (receive_loop, rx, sender)
    }

    fn reliable_bytes(id: PacketId, text: &str) -> Vec<u8> {
        let message = Message::new(PeerId(1), MessageBody::Chat { text: text.into() });
        encode(&Packet::reliable(id, message, 5_000, 0)).unwrap()
    }

    fn drain_acks(peer: &UdpTransport) -> Vec<PacketId> {
        let mut acks = Vec::new();
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        while let Ok(Some((len, _))) = peer.recv_from(&mut buffer) {
            let packet = decode(&buffer[..len]).unwrap();
            assert_eq!(packet.mode(), DeliveryMode::Ack);
            acks.push(packet.ack_of());
        }
        acks
    }

    #[test]
    fn test_duplicate_delivered_once_acked_twice() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        let peer = transport();
        let from = peer.local_addr();
        let now = Instant::now();

        let bytes = reliable_bytes(7, "once");
        receive_loop.handle_datagram(&bytes, from, now);
        receive_loop.handle_datagram(&bytes, from, now);
        receive_loop.flush_deferred(now);

        let delivered: Vec<_> = rx.try_iter().collect();
        assert_eq!(delivered.len(), 1);
        assert_eq!(drain_acks(&peer), vec![7, 7]);
    }

    #[test]
    fn test_out_of_order_ids_both_delivered() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let now = Instant::now();

        receive_loop.handle_datagram(&reliable_bytes(5, "five"), from, now);
        receive_loop.handle_datagram(&reliable_bytes(4, "four"), from, now);
        receive_loop.handle_datagram(&reliable_bytes(5, "five"), from, now);

        let texts: Vec<String> = rx
            .try_iter()
            .filter_map(|queued| match queued.item {
                Inbound::Message { message, .. } => match message.into_body() {
                    MessageBody::Chat { text } => Some(text),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["five".to_string(), "four".to_string()]);
    }

    #[test]
    fn test_same_id_from_different_senders() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        let now = Instant::now();
        let bytes = reliable_bytes(1, "x");

        receive_loop.handle_datagram(&bytes, "127.0.0.1:9".parse().unwrap(), now);
        receive_loop.handle_datagram(&bytes, "127.0.0.1:10".parse().unwrap(), now);

        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn test_best_effort_not_deduplicated() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let message = Message::new(PeerId(1), MessageBody::Ping);
        let bytes = encode(&Packet::best_effort(3, message, 0)).unwrap();

        receive_loop.handle_datagram(&bytes, from, Instant::now());
        receive_loop.handle_datagram(&bytes, from, Instant::now());

        assert_eq!(rx.try_iter().count(), 2);
        assert!(receive_loop.deferred.is_empty());
        assert!(receive_loop.dedup.is_empty());
    }

    #[test]
    fn test_garbage_is_dropped() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        receive_loop.handle_datagram(b"not a packet", "127.0.0.1:9".parse().unwrap(), Instant::now());
        assert_eq!(rx.try_iter().count(), 0);
        assert!(receive_loop.deferred.is_empty());
    }

    #[test]
    fn test_incoming_ack_resolves_tracked_packet() {
        let (mut receive_loop, rx, mut sender) = test_loop(0);
        let peer = transport();
        let now = Instant::now();
        let id = sender
            .send(peer.local_addr(), Message::new(PeerId(0), MessageBody::Ping), true, now)
            .unwrap();
        assert_eq!(sender.in_flight(), 1);

        let ack = encode(&Packet::ack(1, id, 0)).unwrap();
        receive_loop.handle_datagram(&ack, peer.local_addr(), now);
        receive_loop.flush_deferred(now);

        assert_eq!(sender.in_flight(), 0);
        assert!(matches!(
            rx.try_recv().map(|q| q.item),
            Ok(Inbound::Activity { .. })
        ));
    }

    #[test]
    fn test_read_delay_postpones_ack() {
        let (mut receive_loop, _rx, _sender) = test_loop(200);
        let peer = transport();
        let now = Instant::now();

        receive_loop.handle_datagram(&reliable_bytes(9, "late"), peer.local_addr(), now);
        receive_loop.flush_deferred(now + Duration::from_millis(100));
        assert_eq!(receive_loop.deferred.len(), 1);

        receive_loop.flush_deferred(now + Duration::from_millis(200));
        assert!(receive_loop.deferred.is_empty());
        assert_eq!(drain_acks(&peer), vec![9]);
    }

    #[test]
    fn test_dedup_prune_is_incremental() {
        let mut table = DedupTable::new(Duration::from_millis(5_000));
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let start = Instant::now();

        let ttl = Duration::from_millis(2_000);
        table.observe(from, 1, ttl, start);
        table.observe(from, 2, ttl, start + Duration::from_millis(3_000));
        assert_eq!(table.len(), 2);

        assert_eq!(table.prune(start + Duration::from_millis(6_000)), 1);
        assert_eq!(table.len(), 1);
        // Id 1 is forgotten and counts as new again.
        assert!(table.observe(from, 1, ttl, start + Duration::from_millis(6_000)));
        assert!(!table.observe(from, 2, ttl, start + Duration::from_millis(6_000)));

        assert_eq!(table.prune(start + Duration::from_millis(20_000)), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_dedup_keeps_ids_for_long_ttl() {
        let mut table = DedupTable::new(Duration::from_millis(5_000));
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let start = Instant::now();

        table.observe(from, 1, Duration::from_millis(20_000), start);
        table.observe(from, 2, Duration::from_millis(1_000), start);

        assert_eq!(table.prune(start + Duration::from_millis(6_000)), 1);
        assert!(!table.observe(from, 1, Duration::from_millis(20_000), start + Duration::from_millis(6_000)));
        assert_eq!(table.prune(start + Duration::from_millis(20_001)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_long_ttl_retransmit_not_redelivered_after_prune() {
        let (mut receive_loop, rx, _sender) = test_loop(0);
        let peer = transport();
        let from = peer.local_addr();
        let start = Instant::now();

        let message = Message::new(PeerId(1), MessageBody::Chat { text: "slow".into() });
        let bytes = encode(&Packet::reliable(42, message, 20_000, 0)).unwrap();
        receive_loop.handle_datagram(&bytes, from, start);

        let later = start + Duration::from_millis(6_000);
        receive_loop.dedup.prune(later);
        receive_loop.handle_datagram(&bytes, from, later);
        receive_loop.flush_deferred(later);

        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(drain_acks(&peer), vec![42, 42]);
    }

    #[test]
    fn test_lowered_read_delay_does_not_hold_acks() {
        let (mut receive_loop, _rx, _sender) = test_loop(200);
        let peer = transport();
        let from = peer.local_addr();
        let now = Instant::now();

        receive_loop.handle_datagram(&reliable_bytes(1, "slow"), from, now);
        receive_loop.read_delay_ms.store(0, Ordering::Relaxed);
        receive_loop.handle_datagram(&reliable_bytes(2, "fast"), from, now);

        receive_loop.flush_deferred(now);
        assert_eq!(drain_acks(&peer), vec![2]);
        assert_eq!(receive_loop.deferred.len(), 1);

        receive_loop.flush_deferred(now + Duration::from_millis(200));
        assert_eq!(drain_acks(&peer), vec![1]);
    }

    #[test]
    fn test_engine_poll_honours_read_delay() {
        let local = transport();
        let sender = ReliableSender::new(local.clone(), Duration::from_millis(500), Duration::from_secs(5));
        let settings = ReceiveSettings {
            read_delay: Duration::from_millis(150),
            dedup_retention: Duration::from_secs(5),
            prune_interval: Duration::from_secs(5),
            packet_loss_percent: 0,
            fault_seed: None,
        };
        let mut engine = ReceiveEngine::spawn(local.clone(), sender.tracker(), sender.ids(), settings).unwrap();

        let peer = transport();
        let message = Message::new(PeerId(2), MessageBody::Ping);
        let sent_at = Instant::now();
        peer.send_to(&encode(&Packet::best_effort(1, message.clone(), 0)).unwrap(), local.local_addr())
            .unwrap();

        let deadline = sent_at + Duration::from_secs(3);
        let received = loop {
            let now = Instant::now();
            if let Some(item) = engine.poll(now) {
                break Some((item, now));
            }
            if now > deadline {
                break None;
            }
            thread::sleep(Duration::from_millis(5));
        };

        let (item, at) = received.expect("message delivered");
        assert!(at.duration_since(sent_at) >= Duration::from_millis(150));
        assert_eq!(
            item,
            Inbound::Message {
                message,
                from: peer.local_addr()
            }
        );
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_fault_injector_full_loss() {
        let mut faults = FaultInjector::new(100, Some(3));
        assert!((0..50).all(|_| faults.should_drop()));
        let mut clean = FaultInjector::new(0, Some(3));
        assert!((0..50).all(|_| !clean.should_drop()));
    }
}
