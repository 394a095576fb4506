//! # Transport Layer
//!
//! Thin UDP socket wrapper shared by the update thread and the receive loop.
//!
//! ## Design
//!
//! - One socket per session, cloned handles share it
//! - Blocking reads with a short timeout so the receive loop can observe shutdown
//! - Lock-free packet statistics

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// UDP socket handle.
///
/// Cloning is cheap; all clones send from and receive on the same socket.
#[derive(Clone)]
pub struct UdpTransport {
    /// The underlying socket.
    socket: Arc<UdpSocket>,
    /// Local address.
    local_addr: SocketAddr,
    /// Statistics.
    counters: Arc<TransportCounters>,
}

#[derive(Default)]
struct TransportCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

/// Transport statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Packets sent.
    pub packets_sent: u64,
    /// Packets received.
    pub packets_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Send errors.
    pub send_errors: u64,
    /// Receive errors.
    pub recv_errors: u64,
}

impl UdpTransport {
    /// Binds a socket on `addr`; reads block for at most `read_timeout`.
    ///
    /// # Errors
    ///
    /// Fails if the address is in use or the timeout is zero.
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(read_timeout))?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            counters: Arc::new(TransportCounters::default()),
        })
    }

    /// Returns the local address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends a datagram to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the socket error; the failure is also counted.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(data, addr) {
            Ok(n) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Receives one datagram into `buffer`.
    ///
    /// Returns `Ok(None)` when the read timed out with nothing to read.
    ///
    /// # Errors
    ///
    /// Returns any other socket error; the failure is also counted.
    pub fn recv_from(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buffer) {
            Ok((len, addr)) => {
                self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                Ok(Some((len, addr)))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Returns statistics.
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// Returns true for receive errors that say nothing about our own socket.
///
/// Some platforms surface an ICMP "port unreachable" from an earlier send as
/// a reset on the next read.
#[must_use]
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn test_loopback_send_recv() {
        let a = loopback();
        let b = loopback();

        a.send_to(b"hello", b.local_addr()).unwrap();

        let mut buffer = [0u8; 64];
        let (len, from) = b.recv_from(&mut buffer).unwrap().expect("datagram");
        assert_eq!(&buffer[..len], b"hello");
        assert_eq!(from, a.local_addr());

        assert_eq!(a.stats().packets_sent, 1);
        assert_eq!(a.stats().bytes_sent, 5);
        assert_eq!(b.stats().packets_received, 1);
    }

    #[test]
    fn test_recv_timeout_is_not_an_error() {
        let a = loopback();
        let mut buffer = [0u8; 16];
        assert!(a.recv_from(&mut buffer).unwrap().is_none());
        assert_eq!(a.stats().recv_errors, 0);
    }

    #[test]
    fn test_clones_share_socket() {
        let a = loopback();
        let clone = a.clone();
        assert_eq!(a.local_addr(), clone.local_addr());

        let b = loopback();
        clone.send_to(b"x", b.local_addr()).unwrap();
        assert_eq!(a.stats().packets_sent, 1);
    }
}
