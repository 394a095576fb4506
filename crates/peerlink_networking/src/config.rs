//! # Session Configuration
//!
//! Tunables for one session, loaded once at startup.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! bind_address = "127.0.0.1"
//! read_delay_ms = 150
//! packet_loss_percent = 10
//! ```

use crate::error::ConfigError;
use peerlink_shared::constants::{
    DEDUP_PRUNE_INTERVAL_MS, DEDUP_RETENTION_MS, PING_IDLE_MS, PING_INTERVAL_MS,
};
use peerlink_shared::{DEFAULT_RELIABLE_TTL_MS, PEER_TIMEOUT_MS, RETRANSMIT_INTERVAL_MS};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Session configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Interface the session socket binds to.
    pub bind_address: IpAddr,
    /// Default time-to-live of reliable sends.
    pub reliable_ttl_ms: u64,
    /// Interval between retransmissions of an unacknowledged packet.
    pub retransmit_interval_ms: u64,
    /// Silence after which a peer is evicted.
    pub peer_timeout_ms: u64,
    /// Silence after which a peer is pinged.
    pub ping_idle_ms: u64,
    /// Minimum gap between pings to one peer.
    pub ping_interval_ms: u64,
    /// How long received packet ids are remembered.
    pub dedup_retention_ms: u64,
    /// How often the dedup table is pruned.
    pub dedup_prune_interval_ms: u64,
    /// Socket read timeout; bounds how long shutdown waits for the receive loop.
    pub recv_poll_interval_ms: u64,
    /// Artificial delay applied to every received datagram.
    pub read_delay_ms: u64,
    /// Share of inbound datagrams dropped on purpose (0-100).
    pub packet_loss_percent: u8,
    /// Seed for the packet-loss generator; random when absent.
    pub fault_seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reliable_ttl_ms: DEFAULT_RELIABLE_TTL_MS,
            retransmit_interval_ms: RETRANSMIT_INTERVAL_MS,
            peer_timeout_ms: PEER_TIMEOUT_MS,
            ping_idle_ms: PING_IDLE_MS,
            ping_interval_ms: PING_INTERVAL_MS,
            dedup_retention_ms: DEDUP_RETENTION_MS,
            dedup_prune_interval_ms: DEDUP_PRUNE_INTERVAL_MS,
            recv_poll_interval_ms: 50,
            read_delay_ms: 0,
            packet_loss_percent: 0,
            fault_seed: None,
        }
    }
}

impl SessionConfig {
    /// Configuration bound to the loopback interface, for local tests.
    #[must_use]
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// See [`SessionConfig::from_toml_str`]; unreadable files yield
    /// [`ConfigError::Io`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("reliable_ttl_ms", self.reliable_ttl_ms),
            ("retransmit_interval_ms", self.retransmit_interval_ms),
            ("peer_timeout_ms", self.peer_timeout_ms),
            ("dedup_retention_ms", self.dedup_retention_ms),
            ("dedup_prune_interval_ms", self.dedup_prune_interval_ms),
            ("recv_poll_interval_ms", self.recv_poll_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if u32::try_from(self.reliable_ttl_ms).is_err() {
            return Err(ConfigError::Invalid("reliable_ttl_ms does not fit in 32 bits".into()));
        }
        if self.packet_loss_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "packet_loss_percent {} exceeds 100",
                self.packet_loss_percent
            )));
        }
        Ok(())
    }

    /// Default reliable time-to-live.
    #[must_use]
    pub const fn reliable_ttl(&self) -> Duration {
        Duration::from_millis(self.reliable_ttl_ms)
    }

    /// Retransmission interval.
    #[must_use]
    pub const fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    /// Peer eviction timeout.
    #[must_use]
    pub const fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    /// Idle time before a ping.
    #[must_use]
    pub const fn ping_idle(&self) -> Duration {
        Duration::from_millis(self.ping_idle_ms)
    }

    /// Minimum gap between pings.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Dedup retention window.
    #[must_use]
    pub const fn dedup_retention(&self) -> Duration {
        Duration::from_millis(self.dedup_retention_ms)
    }

    /// Dedup prune interval.
    #[must_use]
    pub const fn dedup_prune_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_prune_interval_ms)
    }

    /// Socket read timeout.
    #[must_use]
    pub const fn recv_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_interval_ms)
    }

    /// Artificial read delay.
    #[must_use]
    pub const fn read_delay(&self) -> Duration {
        Duration::from_millis(self.read_delay_ms)
    }
}
