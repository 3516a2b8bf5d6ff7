//! Node configuration.

use crate::error::ConfigError;
use crate::session::RotationPolicy;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default frame size limit: 2 MiB
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Default datagram payload limit, leaving room for network headers
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

/// Smallest workable datagram payload (header plus one sealed byte)
const MIN_PACKET_SIZE: usize = 128;

/// Largest UDP payload
const MAX_UDP_PAYLOAD: usize = 65507;

/// Node configuration.
///
/// Only the two seeds are required; everything else carries a working
/// default. The node binds to loopback unless `host` says otherwise.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Per-node seed: identity and internal crypto context. At least 32
    /// bytes.
    pub node_seed: Vec<u8>,
    /// Pre-shared seed for handshake authentication, distributed
    /// out-of-band. At least 32 bytes.
    pub shared_seed: Vec<u8>,
    /// Bind address for both transports
    pub host: IpAddr,
    /// Datagram port; 0 means OS-assigned
    pub port: u16,
    /// WebSocket listener port; `None` disables the message transport
    pub message_port: Option<u16>,
    /// Upper bound on a single frame
    pub max_frame_size: usize,
    /// Upper bound on a single datagram
    pub max_packet_size: usize,
    /// Idle time after which an Active session is closed
    pub session_idle_timeout: Duration,
    /// Keepalive emission interval for quiet sessions
    pub keepalive_interval: Duration,
    /// Deadline for a complete handshake exchange
    pub handshake_timeout: Duration,
    /// Session key rotation thresholds; all-None disables rotation
    pub rotation: RotationPolicy,
    /// Reorder window per stream, in segments
    pub reorder_buffer_limit: u64,
    /// Initial flow-control credits per stream, in segments
    pub flow_credits_initial: usize,
    /// Emit an ACK after this many delivered segments
    pub ack_segment_interval: u64,
    /// Flush pending ACKs at least this often
    pub ack_flush_interval: Duration,
    /// Capacity of the application-visible event queue
    pub inbound_queue_capacity: usize,
    /// Whether inbound HELLO frames are accepted at start
    pub accept_inbound: bool,
}

impl NodeConfig {
    /// Configuration with defaults for everything but the seeds
    #[must_use]
    pub fn new(node_seed: impl Into<Vec<u8>>, shared_seed: impl Into<Vec<u8>>) -> Self {
        Self {
            node_seed: node_seed.into(),
            shared_seed: shared_seed.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            message_port: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            session_idle_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            rotation: RotationPolicy::DISABLED,
            reorder_buffer_limit: 64,
            flow_credits_initial: 1024,
            ack_segment_interval: 16,
            ack_flush_interval: Duration::from_millis(200),
            inbound_queue_capacity: 1024,
            accept_inbound: true,
        }
    }

    /// Datagram bind address
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Message-transport bind address, when enabled
    #[must_use]
    pub fn message_listen_addr(&self) -> Option<SocketAddr> {
        self.message_port.map(|port| SocketAddr::new(self.host, port))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found; construction aborts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_seed.len() < 32 {
            return Err(ConfigError::SeedTooShort {
                which: "node_seed",
                actual: self.node_seed.len(),
            });
        }
        if self.shared_seed.len() < 32 {
            return Err(ConfigError::SeedTooShort {
                which: "shared_seed",
                actual: self.shared_seed.len(),
            });
        }
        if !(MIN_PACKET_SIZE..=MAX_UDP_PAYLOAD).contains(&self.max_packet_size) {
            return Err(ConfigError::PacketSizeOutOfRange {
                size: self.max_packet_size,
                min: MIN_PACKET_SIZE,
                max: MAX_UDP_PAYLOAD,
            });
        }
        if self.max_frame_size < self.max_packet_size {
            return Err(ConfigError::FrameSmallerThanPacket {
                frame: self.max_frame_size,
                packet: self.max_packet_size,
            });
        }
        if self.reorder_buffer_limit == 0 {
            return Err(ConfigError::ZeroLimit("reorder_buffer_limit"));
        }
        if self.flow_credits_initial == 0 {
            return Err(ConfigError::ZeroLimit("flow_credits_initial"));
        }
        if self.ack_segment_interval == 0 {
            return Err(ConfigError::ZeroLimit("ack_segment_interval"));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(ConfigError::ZeroLimit("inbound_queue_capacity"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 32]);
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.listen_addr().port(), 0);
        assert!(config.message_listen_addr().is_none());
        assert_eq!(config.max_frame_size, 2 * 1024 * 1024);
        assert_eq!(config.max_packet_size, 1472);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(!config.rotation.is_enabled());
        assert_eq!(config.reorder_buffer_limit, 64);
        assert_eq!(config.flow_credits_initial, 1024);
        assert!(config.accept_inbound);
    }

    #[test]
    fn test_short_seeds_rejected() {
        let config = NodeConfig::new(vec![0xAA; 31], vec![0x42; 32]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SeedTooShort { which: "node_seed", actual: 31 })
        ));

        let config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 16]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SeedTooShort { which: "shared_seed", actual: 16 })
        ));
    }

    #[test]
    fn test_packet_size_bounds() {
        let mut config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 32]);
        config.max_packet_size = 64;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PacketSizeOutOfRange { .. })
        ));

        config.max_packet_size = 70000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PacketSizeOutOfRange { .. })
        ));
    }

    #[test]
    fn test_frame_smaller_than_packet_rejected() {
        let mut config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 32]);
        config.max_frame_size = 512;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FrameSmallerThanPacket { .. })
        ));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = NodeConfig::new(vec![0xAA; 32], vec![0x42; 32]);
        config.flow_credits_initial = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit("flow_credits_initial"))
        ));
    }
}
