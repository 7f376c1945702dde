//! Error types for EMI.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors from the channel qualifier codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QualifierError {
    /// Channel type outside 0..=3.
    #[error("invalid channel type: {0}")]
    InvalidType(u8),

    /// Channel number outside 0..=31.
    #[error("invalid channel number: {0}")]
    InvalidNumber(u8),

    /// Reserved bit 0x20 set.
    #[error("reserved bit set in qualifier {0:#04x}")]
    Reserved(u8),
}

/// Errors returned by operations on a connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection is closing or closed.
    #[error("connection closed")]
    Closed,

    /// Empty messages cannot be sent.
    #[error("empty message")]
    EmptyMessage,

    /// Message does not fit in a single datagram.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Largest payload that fits in a datagram.
        max: usize,
    },

    /// The sender buffer has no room for the message.
    #[error("sender buffer full ({capacity} bytes)")]
    SenderBufferFull {
        /// Sender buffer capacity in bytes.
        capacity: usize,
    },
}

/// Errors surfaced by `connect`.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Host name could not be resolved.
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    /// The peer never answered the connection request.
    #[error("connect timed out")]
    TimedOut,

    /// The peer refused the connection.
    #[error("connection rejected")]
    Rejected,

    /// A connection to this peer already exists on the socket.
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    /// The connection attempt was closed locally before it completed.
    #[error("connect cancelled")]
    Cancelled,

    /// The socket was closed.
    #[error("socket closed")]
    SocketClosed,
}

/// Why a rendezvous through a mediator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousFailure {
    /// Cookie MAC did not verify or the cookie expired.
    InvalidCookie,
    /// Cookie was already used by a completed rendezvous.
    CookieConsumed,
    /// The mediator never answered.
    MediatorUnreachable,
    /// The mediator answered but no peer arrived in time.
    TimedOut,
}

impl std::fmt::Display for RendezvousFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidCookie => "invalid or expired cookie",
            Self::CookieConsumed => "cookie already consumed",
            Self::MediatorUnreachable => "mediator unreachable",
            Self::TimedOut => "no peer arrived",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by `connect_p2p`.
#[derive(Debug, Error)]
pub enum P2pError {
    /// The mediator rejected or never completed the rendezvous.
    #[error("rendezvous failed: {0}")]
    RendezvousFailed(RendezvousFailure),

    /// Peers were matched but no authenticated handshake got through.
    #[error("p2p handshake failed")]
    HandshakeFailed,

    /// The socket was closed.
    #[error("socket closed")]
    SocketClosed,
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// MAC key has the wrong length.
    #[error("invalid key length")]
    InvalidKeyLength,

    /// Token bytes have the wrong length.
    #[error("invalid token length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
}

/// Configuration errors. Raised eagerly when a socket is opened.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Option name is not recognised.
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// Option value could not be parsed.
    #[error("invalid value for {option}: {value}")]
    InvalidValue {
        /// Option name.
        option: String,
        /// Raw value.
        value: String,
    },

    /// Option value is outside its allowed range.
    #[error("{option} out of range: {reason}")]
    OutOfRange {
        /// Option name.
        option: &'static str,
        /// Allowed range.
        reason: &'static str,
    },
}

/// Top-level EMI errors.
#[derive(Debug, Error)]
pub enum EmiError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connect error.
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// P2P error.
    #[error("p2p error: {0}")]
    P2p(#[from] P2pError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Qualifier error.
    #[error("qualifier error: {0}")]
    Qualifier(#[from] QualifierError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
