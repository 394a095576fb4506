//! # Reliable Send Engine
//!
//! At-least-once delivery on top of UDP.
//!
//! ## Design
//!
//! - Every at-least-once packet is tracked until acked or expired
//! - Fixed retransmit interval, bounded only by the packet's TTL
//! - The tracked set is shared with the receive loop, which resolves acks;
//!   completion callbacks only ever run on the `tick()` caller's thread
//!
//! ```text
//! send ──► tracked ──tick──► RETRIED ... ──► EXPIRED
//!             │
//!             └─ ack (receive loop) ──► acked queue ──tick──► ACKED
//! ```

use crate::error::SessionResult;
use crate::protocol::{encode, wall_clock_ms, Packet, PacketId};
use crate::transport::UdpTransport;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use peerlink_shared::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a reliable send, reported to its completion callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Acknowledged after `round_trip`. Terminal.
    Acked {
        /// Time from first transmission to ack.
        round_trip: Duration,
    },
    /// Retransmitted, `elapsed` after the first transmission.
    Retried {
        /// Time since first transmission.
        elapsed: Duration,
    },
    /// Given up on after `elapsed`. Terminal.
    Expired {
        /// Time since first transmission.
        elapsed: Duration,
    },
}

impl SendOutcome {
    /// Returns true for outcomes that end tracking.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Retried { .. })
    }
}

/// Completion callback for a reliable send.
pub type OutcomeCallback = Box<dyn FnMut(SendOutcome)>;

/// Sender-wide packet id counter.
///
/// Shared by data packets and acks so every id is unique per sender.
#[derive(Clone, Default)]
pub struct PacketIdAllocator(Arc<AtomicU32>);

impl PacketIdAllocator {
    /// Returns the next id.
    pub fn next_id(&self) -> PacketId {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

struct TrackedPacket {
    packet: Packet,
    dest: SocketAddr,
    first_sent: Instant,
    last_sent: Instant,
    ttl: Duration,
}

/// Set of unacknowledged packets, shared with the receive loop.
pub struct AckTracker {
    tracked: Mutex<HashMap<PacketId, TrackedPacket>>,
    acked_tx: Sender<(PacketId, Duration)>,
    acked_rx: Receiver<(PacketId, Duration)>,
}

impl AckTracker {
    fn new() -> Self {
        let (acked_tx, acked_rx) = unbounded();
        Self {
            tracked: Mutex::new(HashMap::new()),
            acked_tx,
            acked_rx,
        }
    }

    /// Resolves packet `id` as acknowledged at `now`.
    ///
    /// Returns false if the packet was not tracked (already acked, expired,
    /// or never reliable). Calling it twice is harmless.
    pub fn on_ack(&self, id: PacketId, now: Instant) -> bool {
        let Some(entry) = self.tracked.lock().remove(&id) else {
            return false;
        };
        let round_trip = now.saturating_duration_since(entry.first_sent);
        // The receiver lives as long as the tracker.
        let _ = self.acked_tx.send((id, round_trip));
        true
    }

    /// Number of packets awaiting an ack.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Returns true if nothing awaits an ack.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracked.lock().is_empty()
    }

    fn clear(&self) {
        self.tracked.lock().clear();
        while self.acked_rx.try_recv().is_ok() {}
    }
}

/// Reliable send engine.
///
/// Owned by the update thread. Call [`ReliableSender::tick`] once per update.
pub struct ReliableSender {
    transport: UdpTransport,
    tracker: Arc<AckTracker>,
    ids: PacketIdAllocator,
    callbacks: HashMap<PacketId, OutcomeCallback>,
    retransmit_interval: Duration,
    default_ttl: Duration,
}

impl ReliableSender {
    /// Creates an engine sending on `transport`.
    #[must_use]
    pub fn new(transport: UdpTransport, retransmit_interval: Duration, default_ttl: Duration) -> Self {
        Self {
            transport,
            tracker: Arc::new(AckTracker::new()),
            ids: PacketIdAllocator::default(),
            callbacks: HashMap::new(),
            retransmit_interval,
            default_ttl,
        }
    }

    /// Handle for resolving acks from another thread.
    #[must_use]
    pub fn tracker(&self) -> Arc<AckTracker> {
        Arc::clone(&self.tracker)
    }

    /// Handle to the packet id counter.
    #[must_use]
    pub fn ids(&self) -> PacketIdAllocator {
        self.ids.clone()
    }

    /// Transport this engine sends on.
    #[must_use]
    pub const fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    /// Number of reliable packets still in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Sends `message` to `dest`, reliably with the default TTL or best-effort.
    ///
    /// # Errors
    ///
    /// Fails if the message cannot be encoded, or for best-effort sends if
    /// the socket rejects the datagram. Reliable sends that fail to go out
    /// stay tracked and are retried.
    pub fn send(
        &mut self,
        dest: SocketAddr,
        message: Message,
        reliable: bool,
        now: Instant,
    ) -> SessionResult<PacketId> {
        if reliable {
            return self.track_and_send(dest, message, self.default_ttl, None, now);
        }

        let id = self.ids.next_id();
        let bytes = encode(&Packet::best_effort(id, message, wall_clock_ms()))?;
        self.transport.send_to(&bytes, dest)?;
        Ok(id)
    }

    /// Sends `message` reliably with an explicit TTL and completion callback.
    ///
    /// # Errors
    ///
    /// Fails only if the message cannot be encoded; the callback is then
    /// never invoked.
    pub fn send_with(
        &mut self,
        dest: SocketAddr,
        message: Message,
        ttl: Duration,
        on_outcome: OutcomeCallback,
        now: Instant,
    ) -> SessionResult<PacketId> {
        self.track_and_send(dest, message, ttl, Some(on_outcome), now)
    }

    fn track_and_send(
        &mut self,
        dest: SocketAddr,
        message: Message,
        ttl: Duration,
        on_outcome: Option<OutcomeCallback>,
        now: Instant,
    ) -> SessionResult<PacketId> {
        let id = self.ids.next_id();
        let ttl_ms = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
        let packet = Packet::reliable(id, message, ttl_ms, wall_clock_ms());
        let bytes = encode(&packet)?;

        if let Some(callback) = on_outcome {
            self.callbacks.insert(id, callback);
        }
        // Track before transmitting so a fast ack always finds the entry.
        self.tracker.tracked.lock().insert(
            id,
            TrackedPacket {
                packet,
                dest,
                first_sent: now,
                last_sent: now,
                ttl,
            },
        );

        if let Err(e) = self.transport.send_to(&bytes, dest) {
            tracing::warn!("Reliable send of packet {} to {} failed: {}", id, dest, e);
        }
        Ok(id)
    }

    /// Fires ack outcomes, retransmits due packets and expires stale ones.
    pub fn tick(&mut self, now: Instant) {
        while let Ok((id, round_trip)) = self.tracker.acked_rx.try_recv() {
            if let Some(mut callback) = self.callbacks.remove(&id) {
                callback(SendOutcome::Acked { round_trip });
            }
        }

        let mut outcomes = Vec::new();
        let mut resends = Vec::new();
        {
            let mut tracked = self.tracker.tracked.lock();
            tracked.retain(|id, entry| {
                let elapsed = now.saturating_duration_since(entry.first_sent);
                if elapsed >= entry.ttl {
                    outcomes.push((*id, SendOutcome::Expired { elapsed }));
                    return false;
                }
                if now.saturating_duration_since(entry.last_sent) >= self.retransmit_interval {
                    entry.last_sent = now;
                    entry.packet.mark_resent(wall_clock_ms());
                    match encode(&entry.packet) {
                        Ok(bytes) => resends.push((*id, bytes, entry.dest)),
                        Err(e) => tracing::warn!("Re-encoding packet {} failed: {}", id, e),
                    }
                    outcomes.push((*id, SendOutcome::Retried { elapsed }));
                }
                true
            });
        }

        for (id, bytes, dest) in resends {
            tracing::trace!("Retransmitting packet {} to {}", id, dest);
            if let Err(e) = self.transport.send_to(&bytes, dest) {
                tracing::warn!("Retransmit of packet {} to {} failed: {}", id, dest, e);
            }
        }

        for (id, outcome) in outcomes {
            if outcome.is_terminal() {
                tracing::debug!("Packet {} expired unacknowledged", id);
                if let Some(mut callback) = self.callbacks.remove(&id) {
                    callback(outcome);
                }
            } else if let Some(callback) = self.callbacks.get_mut(&id) {
                callback(outcome);
            }
        }
    }

    /// Stops tracking everything without firing callbacks.
    pub fn clear(&mut self) {
        self.tracker.clear();
        self.callbacks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_shared::{MessageBody, PeerId};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sender() -> (ReliableSender, UdpTransport) {
        let timeout = Duration::from_millis(100);
        let local = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), timeout).unwrap();
        let sink = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), timeout).unwrap();
        let engine = ReliableSender::new(local, Duration::from_millis(500), Duration::from_millis(5_000));
        (engine, sink)
    }

    fn ping() -> Message {
        Message::new(PeerId(0), MessageBody::Ping)
    }

    fn recorder() -> (Rc<RefCell<Vec<SendOutcome>>>, OutcomeCallback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, Box::new(move |outcome| sink.borrow_mut().push(outcome)))
    }

    #[test]
    fn test_ids_increase() {
        let (mut engine, sink) = sender();
        let now = Instant::now();
        let a = engine.send(sink.local_addr(), ping(), false, now).unwrap();
        let b = engine.send(sink.local_addr(), ping(), true, now).unwrap();
        assert!(b > a);
        assert_eq!(engine.in_flight(), 1);
    }

    #[test]
    fn test_retry_until_expiry() {
        let (mut engine, sink) = sender();
        let (log, callback) = recorder();
        let start = Instant::now();
        engine
            .send_with(sink.local_addr(), ping(), Duration::from_millis(2_000), callback, start)
            .unwrap();

        for ms in [250, 500, 750, 1_000, 1_500, 2_000, 2_500, 3_000] {
            engine.tick(start + Duration::from_millis(ms));
        }

        let ms = |v| Duration::from_millis(v);
        assert_eq!(
            *log.borrow(),
            vec![
                SendOutcome::Retried { elapsed: ms(500) },
                SendOutcome::Retried { elapsed: ms(1_000) },
                SendOutcome::Retried { elapsed: ms(1_500) },
                SendOutcome::Expired { elapsed: ms(2_000) },
            ]
        );
        assert_eq!(engine.in_flight(), 0);
        // Initial send plus three retransmissions.
        assert_eq!(engine.transport().stats().packets_sent, 4);
    }

    #[test]
    fn test_ack_fires_once() {
        let (mut engine, sink) = sender();
        let (log, callback) = recorder();
        let start = Instant::now();
        let id = engine
            .send_with(sink.local_addr(), ping(), Duration::from_millis(5_000), callback, start)
            .unwrap();

        let tracker = engine.tracker();
        assert!(tracker.on_ack(id, start + Duration::from_millis(40)));
        assert!(!tracker.on_ack(id, start + Duration::from_millis(41)));

        engine.tick(start + Duration::from_millis(50));
        engine.tick(start + Duration::from_millis(600));

        assert_eq!(
            *log.borrow(),
            vec![SendOutcome::Acked {
                round_trip: Duration::from_millis(40)
            }]
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let (engine, _sink) = sender();
        assert!(!engine.tracker().on_ack(999, Instant::now()));
    }

    #[test]
    fn test_clear_drops_callbacks() {
        let (mut engine, sink) = sender();
        let (log, callback) = recorder();
        let start = Instant::now();
        engine
            .send_with(sink.local_addr(), ping(), Duration::from_millis(1_000), callback, start)
            .unwrap();

        engine.clear();
        engine.tick(start + Duration::from_millis(5_000));

        assert!(log.borrow().is_empty());
        assert_eq!(engine.in_flight(), 0);
    }
}
