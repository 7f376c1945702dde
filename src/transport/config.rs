//! Socket configuration.
//!
//! A [`SocketConfig`] is built once, validated eagerly and never changes
//! while the socket is open.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::core::{
    CONNECTION_TIMEOUT, ConfigError, DEFAULT_MTU, DEFAULT_RECEIVER_BUFFER_SIZE,
    DEFAULT_SENDER_BUFFER_SIZE, HEARTBEAT_INTERVAL, HEARTBEATS_BEFORE_LOST, INITIAL_RTO, MIN_MTU,
    TICK_INTERVAL,
};

use super::frame::sizes;

/// Largest datagram the socket will build (fits the 16-bit length field).
pub const MAX_MTU: usize = 65_507;

/// Socket configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketConfig {
    /// Accept inbound connections (listen mode).
    pub accept_connections: bool,

    /// Local address to bind to.
    pub address: IpAddr,

    /// Local port to bind to. Zero picks an ephemeral port.
    pub port: u16,

    /// Outbound datagrams per second for the whole socket. Zero is unlimited.
    pub rate_limit: u32,

    /// Probability in `[0, 1]` of discarding each outbound datagram.
    pub fabricated_packet_drop_rate: f64,

    /// Largest datagram size.
    pub mtu: usize,

    /// Heartbeat interval on an idle connection.
    pub heartbeat_interval: Duration,

    /// Silent heartbeat intervals before a connection is reported lost.
    pub heartbeats_before_lost: f64,

    /// Silence after which a connection is closed, and connect gives up.
    pub connection_timeout: Duration,

    /// Batching interval for outgoing messages and acknowledgements.
    pub tick_interval: Duration,

    /// Capacity of each connection's sender buffer in payload bytes.
    pub sender_buffer_size: usize,

    /// Capacity of each connection's reorder buffer in payload bytes.
    pub receiver_buffer_size: usize,

    /// Most connections the socket accepts at once.
    pub max_connections: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            accept_connections: false,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            rate_limit: 0,
            fabricated_packet_drop_rate: 0.0,
            mtu: DEFAULT_MTU,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeats_before_lost: HEARTBEATS_BEFORE_LOST,
            connection_timeout: CONNECTION_TIMEOUT,
            tick_interval: TICK_INTERVAL,
            sender_buffer_size: DEFAULT_SENDER_BUFFER_SIZE,
            receiver_buffer_size: DEFAULT_RECEIVER_BUFFER_SIZE,
            max_connections: 1024,
        }
    }
}

impl SocketConfig {
    /// Start a builder with default values.
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::new()
    }

    /// Parse wrapper-style options.
    ///
    /// Recognised keys are `acceptConnections`, `port`, `rateLimit` and
    /// `fabricatedPacketDropRate` (snake_case spellings are accepted too).
    /// Unknown keys and unparsable or out-of-range values fail.
    pub fn from_options<'a, I>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            let invalid = || ConfigError::InvalidValue {
                option: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "acceptConnections" | "accept_connections" => {
                    config.accept_connections = value.parse().map_err(|_| invalid())?;
                }
                "port" => config.port = value.parse().map_err(|_| invalid())?,
                "rateLimit" | "rate_limit" => {
                    config.rate_limit = value.parse().map_err(|_| invalid())?;
                }
                "fabricatedPacketDropRate" | "fabricated_packet_drop_rate" => {
                    config.fabricated_packet_drop_rate = value.parse().map_err(|_| invalid())?;
                }
                other => return Err(ConfigError::UnknownOption(other.to_string())),
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.fabricated_packet_drop_rate) {
            return Err(ConfigError::OutOfRange {
                option: "fabricatedPacketDropRate",
                reason: "must be within [0, 1]",
            });
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::OutOfRange {
                option: "mtu",
                reason: "must be within [576, 65507]",
            });
        }
        if self.heartbeat_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                option: "heartbeatInterval",
                reason: "intervals must be non-zero",
            });
        }
        if !(self.heartbeats_before_lost >= 1.0 && self.heartbeats_before_lost.is_finite()) {
            return Err(ConfigError::OutOfRange {
                option: "heartbeatsBeforeLost",
                reason: "must be at least 1",
            });
        }
        if self.connection_timeout <= self.lost_after() {
            return Err(ConfigError::OutOfRange {
                option: "connectionTimeout",
                reason: "must exceed the liveness window",
            });
        }
        if self.sender_buffer_size < self.max_payload() {
            return Err(ConfigError::OutOfRange {
                option: "senderBufferSize",
                reason: "must hold at least one full datagram",
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                option: "maxConnections",
                reason: "must be non-zero",
            });
        }
        Ok(())
    }

    /// Silence after which a connection is reported lost.
    pub fn lost_after(&self) -> Duration {
        self.heartbeat_interval.mul_f64(self.heartbeats_before_lost)
    }

    /// Largest payload of a single message.
    pub fn max_payload(&self) -> usize {
        self.mtu - sizes::PACKET_HEADER_SIZE - sizes::MAX_MESSAGE_HEADER_SIZE
    }

    /// Per-connection parameters derived from this config.
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            mtu: self.mtu,
            heartbeat_interval: self.heartbeat_interval,
            lost_after: self.lost_after(),
            connection_timeout: self.connection_timeout,
            tick_interval: self.tick_interval,
            initial_rto: INITIAL_RTO,
            sender_buffer_size: self.sender_buffer_size,
            receiver_buffer_size: self.receiver_buffer_size,
        }
    }
}

/// Parameters a single connection runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Largest datagram size.
    pub mtu: usize,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Liveness window.
    pub lost_after: Duration,
    /// Silence before the connection is closed.
    pub connection_timeout: Duration,
    /// Batching interval.
    pub tick_interval: Duration,
    /// Retransmission timeout before the first RTT sample.
    pub initial_rto: Duration,
    /// Sender buffer capacity.
    pub sender_buffer_size: usize,
    /// Receiver buffer capacity.
    pub receiver_buffer_size: usize,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        SocketConfig::default().connection_params()
    }
}

impl ConnectionParams {
    /// Largest payload of a single message.
    pub fn max_payload(&self) -> usize {
        self.mtu - sizes::PACKET_HEADER_SIZE - sizes::MAX_MESSAGE_HEADER_SIZE
    }
}

/// Builder for [`SocketConfig`].
#[derive(Debug, Default)]
pub struct SocketConfigBuilder {
    config: SocketConfig,
}

impl SocketConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept inbound connections.
    pub fn accept_connections(mut self, accept: bool) -> Self {
        self.config.accept_connections = accept;
        self
    }

    /// Set the bind address.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.config.address = address;
        self
    }

    /// Set the bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the outbound datagram rate limit (per second, 0 = unlimited).
    pub fn rate_limit(mut self, rate: u32) -> Self {
        self.config.rate_limit = rate;
        self
    }

    /// Set the fabricated packet drop probability.
    pub fn fabricated_packet_drop_rate(mut self, rate: f64) -> Self {
        self.config.fabricated_packet_drop_rate = rate;
        self
    }

    /// Set the maximum datagram size.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the heartbeat interval.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Set how many silent heartbeat intervals make a connection lost.
    pub fn heartbeats_before_lost(mut self, count: f64) -> Self {
        self.config.heartbeats_before_lost = count;
        self
    }

    /// Set the connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    /// Set the batching interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set the sender buffer capacity.
    pub fn sender_buffer_size(mut self, size: usize) -> Self {
        self.config.sender_buffer_size = size;
        self
    }

    /// Set the receiver buffer capacity.
    pub fn receiver_buffer_size(mut self, size: usize) -> Self {
        self.config.receiver_buffer_size = size;
        self
    }

    /// Set the maximum number of concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SocketConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SocketConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.accept_connections);
        assert_eq!(config.mtu, DEFAULT_MTU);
        // 2.5 heartbeats of 3.33 s
        let lost = config.lost_after();
        assert!(lost > Duration::from_millis(8300) && lost < Duration::from_millis(8400));
    }

    #[test]
    fn test_builder() {
        let config = SocketConfig::builder()
            .accept_connections(true)
            .port(5000)
            .rate_limit(200)
            .fabricated_packet_drop_rate(0.25)
            .build()
            .unwrap();
        assert!(config.accept_connections);
        assert_eq!(config.port, 5000);
        assert_eq!(config.rate_limit, 200);
        assert_eq!(config.fabricated_packet_drop_rate, 0.25);
    }

    #[test]
    fn test_builder_rejects_drop_rate() {
        let err = SocketConfig::builder()
            .fabricated_packet_drop_rate(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                option: "fabricatedPacketDropRate",
                ..
            }
        ));
        assert!(SocketConfig::builder()
            .fabricated_packet_drop_rate(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_small_mtu() {
        assert!(SocketConfig::builder().mtu(100).build().is_err());
    }

    #[test]
    fn test_builder_rejects_timeout_inside_liveness_window() {
        let result = SocketConfig::builder()
            .heartbeat_interval(Duration::from_secs(10))
            .connection_timeout(Duration::from_secs(20))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_options() {
        let config = SocketConfig::from_options([
            ("acceptConnections", "true"),
            ("port", "4000"),
            ("rateLimit", "50"),
            ("fabricatedPacketDropRate", "0.1"),
        ])
        .unwrap();
        assert!(config.accept_connections);
        assert_eq!(config.port, 4000);
        assert_eq!(config.rate_limit, 50);
        assert_eq!(config.fabricated_packet_drop_rate, 0.1);
    }

    #[test]
    fn test_from_options_rejects_unknown() {
        assert_eq!(
            SocketConfig::from_options([("colour", "blue")]),
            Err(ConfigError::UnknownOption("colour".into()))
        );
    }

    #[test]
    fn test_from_options_rejects_bad_values() {
        assert!(matches!(
            SocketConfig::from_options([("port", "70000")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            SocketConfig::from_options([("fabricatedPacketDropRate", "-0.5")]),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_max_payload() {
        let config = SocketConfig::default();
        assert_eq!(config.max_payload(), DEFAULT_MTU - 9 - 8);
        assert_eq!(config.connection_params().max_payload(), config.max_payload());
    }
}
