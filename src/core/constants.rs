//! Protocol constants for EMI.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Timing values are the defaults used by [`SocketConfig`](crate::transport::SocketConfig).

use std::time::Duration;

// =============================================================================
// CHANNEL QUALIFIER
// =============================================================================

/// Number of bits the channel type is shifted by inside a qualifier byte.
pub const CHANNEL_TYPE_SHIFT: u8 = 6;

/// Mask of the channel number bits (bits 0-4).
pub const CHANNEL_NUMBER_MASK: u8 = 0x1F;

/// Reserved qualifier bit. A qualifier with this bit set is invalid.
pub const CHANNEL_RESERVED_BIT: u8 = 0x20;

/// Largest channel type value (two bits).
pub const MAX_CHANNEL_TYPE: u8 = 3;

/// Largest channel number (five bits).
pub const MAX_CHANNEL_NUMBER: u8 = 31;

// =============================================================================
// PACKET FLAGS
// =============================================================================

/// Packet carries no messages and only proves liveness.
pub const PACKET_FLAG_HEARTBEAT: u8 = 0x01;

/// Datagram is a rendezvous message for (or from) a mediator.
pub const PACKET_FLAG_RENDEZVOUS: u8 = 0x80;

// =============================================================================
// MESSAGE FLAGS
// =============================================================================

/// Handshake authenticated with a shared secret (peer-to-peer).
pub const MESSAGE_FLAG_PRX: u8 = 0x10;

/// Reset: close request, or half of an accept/close-ack.
pub const MESSAGE_FLAG_RST: u8 = 0x08;

/// Synchronize: connection initiation.
pub const MESSAGE_FLAG_SYN: u8 = 0x04;

/// Message carries a cumulative acknowledgement.
pub const MESSAGE_FLAG_ACK: u8 = 0x02;

/// Selective acknowledgement. Not supported; messages carrying it are rejected.
pub const MESSAGE_FLAG_SACK: u8 = 0x01;

// =============================================================================
// SIZES
// =============================================================================

/// Default maximum datagram size.
pub const DEFAULT_MTU: usize = 1200;

/// Smallest MTU a socket can be configured with (IPv4 minimum reassembly size).
pub const MIN_MTU: usize = 576;

/// Default sender buffer capacity in payload bytes.
pub const DEFAULT_SENDER_BUFFER_SIZE: usize = 8192;

/// Default receiver (reorder) buffer capacity in payload bytes.
pub const DEFAULT_RECEIVER_BUFFER_SIZE: usize = 2048;

/// Server-side secret size for cookie MACs.
pub const SERVER_SECRET_SIZE: usize = 32;

/// Shared secret size handed to P2P peers.
pub const SHARED_SECRET_SIZE: usize = 32;

/// Random session nonce carried in each cookie.
pub const COOKIE_NONCE_SIZE: usize = 8;

/// BLAKE2s-256 MAC output size.
pub const MAC_SIZE: usize = 32;

// =============================================================================
// TIMING
// =============================================================================

/// Heartbeat interval (0.3 Hz).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_micros(3_333_333);

/// Heartbeat intervals without traffic before a connection is considered lost.
pub const HEARTBEATS_BEFORE_LOST: f64 = 2.5;

/// Time without traffic after which a connection is closed.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Batching interval for outgoing messages and acknowledgements (10 Hz).
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Initial retransmission timeout.
pub const INITIAL_RTO: Duration = Duration::from_millis(1000);

/// Minimum retransmission timeout.
pub const MIN_RTO: Duration = Duration::from_millis(250);

/// Maximum retransmission timeout.
pub const MAX_RTO: Duration = Duration::from_secs(20);

/// Granularity of the cookie validity window.
pub const COOKIE_RESOLUTION: Duration = Duration::from_secs(300);

/// Upper bound on rendezvous retry interval.
pub const MAX_RENDEZVOUS_INTERVAL: Duration = Duration::from_secs(4);

// =============================================================================
// CONGESTION CONTROL
// =============================================================================

/// Smallest congestion window in bytes.
pub const MIN_CONGESTION_WINDOW: usize = 4 * DEFAULT_MTU;

/// Largest congestion window in bytes. Reaching it ends slow start.
pub const MAX_CONGESTION_WINDOW: usize = 256 * 1024;

/// Floor for the sending rate after decreases, in bytes per second.
pub const MIN_SENDING_RATE: f64 = DEFAULT_MTU as f64;

/// Divisor applied to the sending rate on each decrease in a loss period.
pub const SENDING_RATE_DECREASE: f64 = 1.125;

/// Decreases allowed per loss period after the first one (1.125^6 is about 2).
pub const MAX_RATE_DECREASES: u32 = 5;
